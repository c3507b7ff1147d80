//! Sahara handshake and Firehose programming.
//!
//! Opening runs the Sahara state machine that moves the device into
//! Firehose, then the Firehose init sequence (ping, configure, storage
//! info). Every Firehose exchange goes through [`SaharaDevice::run_operation`],
//! a generic send/collect/retry loop driven by a [`FirehoseOperation`].

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result, ResultExt};
use crate::events::{LogLevel, ObserverHandle, UpdateEvent, UpdatePhase};
use crate::image::Image;
use crate::protocol::constants::*;
use crate::protocol::firehose::{self, FirehoseMessage};
use crate::protocol::sahara::{self, SaharaPacket};
use crate::transport::{BufferedChannel, Channel, TransportError};

const SAHARA_MAX_PACKET: usize = 4096;
const DOC_END: &str = "</data>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaharaState {
    Init,
    Hello,
    Switch,
    Data,
}

/// One Firehose request/response exchange.
pub trait FirehoseOperation {
    fn name(&self) -> &'static str;

    /// Request to send on each attempt, if any.
    fn prepare(&mut self) -> Option<String>;

    /// Handle one element received from the device.
    fn process(&mut self, message: &FirehoseMessage) -> Result<()>;

    fn is_done(&self) -> bool;

    /// Reset per-attempt state before a retry.
    fn init_retry(&mut self) {}
}

fn nak(op: &str) -> Error {
    Error::protocol(format!("device refused {op}"))
}

struct Ping {
    done: bool,
}

impl FirehoseOperation for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }
    fn prepare(&mut self) -> Option<String> {
        Some(firehose::build_ping())
    }
    fn process(&mut self, message: &FirehoseMessage) -> Result<()> {
        if let FirehoseMessage::Response(rsp) = message {
            if !rsp.ack {
                return Err(nak("ping"));
            }
            self.done = true;
        }
        Ok(())
    }
    fn is_done(&self) -> bool {
        self.done
    }
}

/// Payload size negotiation. The target answers ACK to accept our proposal
/// or NAK carrying the size it supports.
struct Configure {
    proposed: u32,
    max_payload: Option<u32>,
}

impl FirehoseOperation for Configure {
    fn name(&self) -> &'static str {
        "configure"
    }
    fn prepare(&mut self) -> Option<String> {
        Some(firehose::build_configure(self.proposed))
    }
    fn process(&mut self, message: &FirehoseMessage) -> Result<()> {
        let FirehoseMessage::Response(rsp) = message else {
            return Ok(());
        };
        let size = if rsp.ack {
            rsp.max_payload_size_to_target_in_bytes
                .unwrap_or(self.proposed)
        } else {
            rsp.max_payload_size_to_target_in_bytes
                .ok_or_else(|| nak("configure"))?
        };
        self.max_payload = Some(size);
        Ok(())
    }
    fn is_done(&self) -> bool {
        self.max_payload.is_some()
    }
    fn init_retry(&mut self) {
        self.max_payload = None;
    }
}

#[derive(Default)]
struct StorageInfo {
    sector_size: Option<u32>,
    num_partition_sectors: Option<u32>,
    pages_in_block: Option<u32>,
    done: bool,
}

impl FirehoseOperation for StorageInfo {
    fn name(&self) -> &'static str {
        "storage info"
    }
    fn prepare(&mut self) -> Option<String> {
        Some(firehose::build_get_storage_info())
    }
    fn process(&mut self, message: &FirehoseMessage) -> Result<()> {
        match message {
            FirehoseMessage::Log(log) => {
                let value = |key| firehose::log_value_u32(log, key);
                self.sector_size = self.sector_size.or(value("sector_size_in_bytes"));
                self.num_partition_sectors = self
                    .num_partition_sectors
                    .or(value("num_partition_sectors"));
                self.pages_in_block = self.pages_in_block.or(value("pages_in_block"));
            }
            FirehoseMessage::Response(rsp) if rsp.ack => self.done = true,
            FirehoseMessage::Response(_) => return Err(nak("storage info")),
        }
        Ok(())
    }
    fn is_done(&self) -> bool {
        self.done
    }
    fn init_retry(&mut self) {
        *self = Self::default();
    }
}

/// Expects an ACK, optionally with a given `rawmode`.
struct Expect {
    name: &'static str,
    request: Option<String>,
    rawmode: Option<bool>,
    done: bool,
}

impl Expect {
    fn new(name: &'static str, request: Option<String>, rawmode: Option<bool>) -> Self {
        Self {
            name,
            request,
            rawmode,
            done: false,
        }
    }
}

impl FirehoseOperation for Expect {
    fn name(&self) -> &'static str {
        self.name
    }
    fn prepare(&mut self) -> Option<String> {
        self.request.clone()
    }
    fn process(&mut self, message: &FirehoseMessage) -> Result<()> {
        let FirehoseMessage::Response(rsp) = message else {
            return Ok(());
        };
        if !rsp.ack {
            return Err(nak(self.name));
        }
        match self.rawmode {
            Some(expected) if rsp.rawmode != Some(expected) => {
                debug!(op = self.name, rawmode = ?rsp.rawmode, "Ignoring ACK with other rawmode");
            }
            _ => self.done = true,
        }
        Ok(())
    }
    fn is_done(&self) -> bool {
        self.done
    }
}

/// Storage geometry reported by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirehoseGeometry {
    pub max_payload: u32,
    pub sector_size: u32,
    pub num_partition_sectors: Option<u32>,
    pub pages_in_block: u32,
    pub transfer_block_size: u32,
}

/// A modem in Firehose mode.
pub struct SaharaDevice<C: Channel> {
    chan: BufferedChannel<C>,
    observer: ObserverHandle,
    cancel: CancelToken,
    geometry: FirehoseGeometry,
}

impl<C: Channel> SaharaDevice<C> {
    #[instrument(level = "debug", skip_all, fields(port = %chan.name()))]
    pub fn open(chan: C, observer: ObserverHandle, cancel: CancelToken) -> Result<Self> {
        let mut chan = BufferedChannel::new(chan);
        let confirmation = sahara_handshake(&mut chan, &cancel)?;
        info!(confirmation = %confirmation, "Switched to Firehose");

        let mut dev = Self {
            chan,
            observer,
            cancel,
            geometry: FirehoseGeometry {
                max_payload: 0,
                sector_size: 0,
                num_partition_sectors: None,
                pages_in_block: 0,
                transfer_block_size: 0,
            },
        };
        dev.geometry = dev.firehose_init().context("Firehose init failed")?;
        Ok(dev)
    }

    pub fn geometry(&self) -> &FirehoseGeometry {
        &self.geometry
    }

    fn firehose_init(&mut self) -> Result<FirehoseGeometry> {
        self.run_operation(&mut Ping { done: false }, FIREHOSE_OP_RETRIES, FIREHOSE_PING_TIMEOUT)?;

        let mut configure = Configure {
            proposed: FIREHOSE_MAX_PAYLOAD_PROPOSED,
            max_payload: None,
        };
        self.run_operation(&mut configure, FIREHOSE_OP_RETRIES, FIREHOSE_CONFIGURE_TIMEOUT)?;
        let max_payload = configure.max_payload.unwrap_or(FIREHOSE_MAX_PAYLOAD_PROPOSED);

        let mut storage = StorageInfo::default();
        self.run_operation(&mut storage, FIREHOSE_OP_RETRIES, FIREHOSE_STORAGE_INFO_TIMEOUT)?;
        let sector_size = storage
            .sector_size
            .ok_or_else(|| Error::protocol("target didn't report its sector size"))?;
        let transfer_block_size = firehose::transfer_block_size(max_payload, sector_size)
            .ok_or_else(|| {
                Error::protocol(format!(
                    "max payload {max_payload} is smaller than a {sector_size}-byte sector"
                ))
            })?;

        let geometry = FirehoseGeometry {
            max_payload,
            sector_size,
            num_partition_sectors: storage.num_partition_sectors,
            pages_in_block: storage.pages_in_block.unwrap_or(0),
            transfer_block_size,
        };
        debug!(?geometry, "Firehose storage geometry");
        Ok(geometry)
    }

    /// Send `op`'s request and feed every received element to it until it
    /// reports done. A timeout restarts the operation while retries remain.
    pub fn run_operation(
        &mut self,
        op: &mut dyn FirehoseOperation,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            self.cancel.check()?;
            if let Some(request) = op.prepare() {
                trace!(op = op.name(), request = %request, "Firehose request");
                self.chan.write(request.as_bytes(), timeout)?;
            }

            let deadline = Instant::now() + timeout;
            while !op.is_done() {
                self.cancel.check()?;
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.chan.fill(remaining) {
                    Ok(_) => {}
                    Err(TransportError::Timeout { .. }) => break,
                    Err(e) => return Err(e.into()),
                }
                let documents = self.take_documents();
                if self.chan.pending().len() > FIREHOSE_MAX_RESPONSE {
                    return Err(Error::protocol(format!(
                        "Firehose {}: {} bytes without a complete response",
                        op.name(),
                        self.chan.pending().len()
                    )));
                }
                for doc in documents {
                    for message in firehose::parse_document(&doc) {
                        if let FirehoseMessage::Log(log) = &message {
                            self.observer.on_event(&UpdateEvent::Log {
                                level: LogLevel::Debug,
                                message: format!("firehose: {log}"),
                            });
                        }
                        if op.is_done() {
                            trace!(op = op.name(), "Ignoring message after completion");
                            continue;
                        }
                        op.process(&message).context(format!("Firehose {}", op.name()))?;
                    }
                }
            }
            if op.is_done() {
                return Ok(());
            }

            attempt += 1;
            if attempt > max_retries {
                return Err(Error::Timeout(format!("Firehose {}", op.name())));
            }
            warn!(op = op.name(), attempt, "Firehose operation timed out, retrying");
            op.init_retry();
        }
    }

    /// Pop every complete document from the receive buffer.
    fn take_documents(&mut self) -> Vec<String> {
        let text = String::from_utf8_lossy(self.chan.pending()).into_owned();
        match text.rfind(DOC_END) {
            Some(at) => {
                let end = at + DOC_END.len();
                // Lossy decoding may change lengths; only consume when exact.
                if text.len() == self.chan.pending().len() {
                    self.chan.consume(end);
                } else {
                    self.chan.discard_pending();
                }
                firehose::split_documents(&text.as_bytes()[..end])
            }
            None => Vec::new(),
        }
    }

    /// Program the whole image file.
    #[instrument(level = "info", skip_all, fields(image = %image.display_name()))]
    pub fn upload(&mut self, image: &mut Image) -> Result<()> {
        let geo = self.geometry;
        let sector = geo.sector_size as u64;
        let total = image.size();
        let num_partition_sectors = match geo.num_partition_sectors {
            Some(n) => n,
            None => partition_sectors(total, sector).ok_or_else(|| {
                Error::invalid_image(format!(
                    "{} needs more than {} sectors",
                    image.display_name(),
                    u32::MAX
                ))
            })?,
        };

        let mut setup = Expect::new(
            "program",
            Some(firehose::build_program(
                geo.pages_in_block,
                geo.sector_size,
                num_partition_sectors,
            )),
            Some(true),
        );
        self.run_operation(&mut setup, FIREHOSE_OP_RETRIES, FIREHOSE_SETUP_TIMEOUT)?;

        let block_size = geo.transfer_block_size as usize;
        let n_blocks = total.div_ceil(block_size as u64);
        let mut block = vec![0u8; block_size];
        for index in 0..n_blocks {
            self.cancel.check()?;
            let offset = index * block_size as u64;
            let want = (total - offset).min(block_size as u64) as usize;
            let n = image.read_at(offset, &mut block[..want])?;
            if n != want {
                return Err(Error::invalid_image(format!(
                    "{} shrank while reading",
                    image.display_name()
                )));
            }
            let len = (n as u64).div_ceil(sector) as usize * sector as usize;
            block[n..len].fill(0);
            self.chan.write(&block[..len], FIREHOSE_BLOCK_TIMEOUT)?;

            self.observer.on_event(&UpdateEvent::Progress {
                phase: UpdatePhase::Downloading,
                operation: image.display_name().to_string(),
                current: index + 1,
                total: n_blocks,
            });
        }

        // The target needs an empty packet to leave raw mode.
        self.chan
            .write(&[0u8; FIREHOSE_EOT_PACKET_LEN], FIREHOSE_BLOCK_TIMEOUT)?;

        let mut teardown = Expect::new("teardown", None, Some(false));
        self.run_operation(&mut teardown, 0, FIREHOSE_TEARDOWN_TIMEOUT)?;

        info!(blocks = n_blocks, "Image programmed");
        Ok(())
    }

    /// `<power value="reset"/>`; failures are logged.
    pub fn reset_to_normal_mode(&mut self) {
        let mut reset = Expect::new("reset", Some(firehose::build_reset()), None);
        if let Err(e) = self.run_operation(&mut reset, FIREHOSE_RESET_RETRIES, FIREHOSE_RESET_TIMEOUT) {
            warn!(error = %e, "Firehose reset failed");
        }
    }
}

fn read_packet<C: Channel>(
    chan: &mut BufferedChannel<C>,
    timeout: Duration,
) -> Result<SaharaPacket> {
    let deadline = Instant::now() + timeout;
    let header = chan.read_exact(SAHARA_HEADER_LEN, timeout)?;
    let length = sahara::packet_length(&header)?;
    if length > SAHARA_MAX_PACKET {
        chan.discard_pending();
        return Err(Error::protocol(format!("Sahara packet too large ({length} bytes)")));
    }
    // Give the body at least a moment even if the header used up the deadline.
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(100));
    let mut packet = header;
    packet.extend(chan.read_exact(length - SAHARA_HEADER_LEN, remaining)?);
    sahara::parse_packet(&packet)
}

/// Run the Sahara state machine up to the Firehose switch, returning the
/// target's confirmation text.
fn sahara_handshake<C: Channel>(
    chan: &mut BufferedChannel<C>,
    cancel: &CancelToken,
) -> Result<String> {
    let mut state = SaharaState::Init;
    let mut last_request: Option<Vec<u8>> = None;
    let mut attempts = 0;
    let mut response_length = 0usize;

    while state != SaharaState::Data {
        cancel.check()?;
        let packet = match read_packet(chan, SAHARA_PACKET_TIMEOUT) {
            Ok(packet) => packet,
            Err(e) if e.is_timeout() => {
                attempts += 1;
                if attempts >= SAHARA_MAX_ATTEMPTS {
                    return Err(Error::Timeout(format!("Sahara handshake in {state:?} state")));
                }
                if let Some(request) = &last_request {
                    debug!(?state, attempts, "Re-sending last Sahara request");
                    chan.write(request, SAHARA_PACKET_TIMEOUT)?;
                }
                continue;
            }
            Err(e) => return Err(e),
        };
        trace!(?state, packet = packet.name(), "Sahara packet");

        let (next, request) = match (state, packet) {
            (SaharaState::Init | SaharaState::Hello, SaharaPacket::HelloRequest { version, mode, .. }) => {
                debug!(version, mode, "Sahara hello");
                (SaharaState::Hello, sahara::build_hello_response())
            }
            (SaharaState::Hello, SaharaPacket::CommandReady) => (
                SaharaState::Switch,
                sahara::build_execute_request(SAHARA_EXEC_SWITCH_FIREHOSE),
            ),
            (
                SaharaState::Switch,
                SaharaPacket::ExecuteResponse {
                    execute,
                    response_length: len,
                },
            ) => {
                if execute != SAHARA_EXEC_SWITCH_FIREHOSE {
                    return Err(Error::protocol(format!(
                        "Sahara executed 0x{execute:x} instead of the Firehose switch"
                    )));
                }
                response_length = len as usize;
                (SaharaState::Data, sahara::build_execute_data(execute))
            }
            (_, SaharaPacket::EndImageTransfer { image_id, status }) => {
                return Err(sahara::end_of_transfer_error(image_id, status));
            }
            (state, packet) => {
                return Err(Error::protocol(format!(
                    "unexpected Sahara {} in {state:?} state",
                    packet.name()
                )));
            }
        };

        chan.write(&request, SAHARA_PACKET_TIMEOUT)?;
        if next != state {
            attempts = 0;
        }
        state = next;
        last_request = Some(request);
    }

    let raw = if response_length > 0 {
        chan.read_exact(response_length, SAHARA_PACKET_TIMEOUT)?
    } else {
        chan.read_some(SAHARA_PACKET_TIMEOUT)?
    };
    sahara::check_confirmation(&raw)
}

/// Sectors covering `total` bytes, if the count fits the wire field.
fn partition_sectors(total: u64, sector: u64) -> Option<u32> {
    u32::try_from(total.div_ceil(sector)).ok()
}
