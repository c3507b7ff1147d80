//! QDL transport device.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result, ResultExt};
use crate::events::{ObserverHandle, UpdateEvent, UpdatePhase};
use crate::image::Image;
use crate::protocol::constants::*;
use crate::protocol::dload::{self, DloadReply};
use crate::protocol::hdlc::{hdlc_frame, hdlc_unframe};
use crate::protocol::qdl::{self, HelloResponse, QdlResponse};
use crate::transport::{BufferedChannel, Channel};

/// A modem talking QDL, after a successful hello.
pub struct QdlDevice<C: Channel> {
    chan: BufferedChannel<C>,
    observer: ObserverHandle,
    cancel: CancelToken,
    version: u8,
    hello: HelloResponse,
}

impl<C: Channel> QdlDevice<C> {
    /// Switch the modem to SDP mode if needed and negotiate a protocol
    /// version.
    #[instrument(level = "debug", skip_all, fields(port = %chan.name()))]
    pub fn open(chan: C, observer: ObserverHandle, cancel: CancelToken) -> Result<Self> {
        let mut chan = BufferedChannel::new(chan);

        match dload_switch(&mut chan) {
            Ok(DloadReply::Switched) => debug!("Modem switched to SDP mode"),
            Ok(DloadReply::AlreadyInSdp) => debug!("Modem already in SDP mode"),
            Err(e) if e.is_timeout() => debug!("No reply to DLOAD switch"),
            Err(e) => return Err(e.context("DLOAD switch failed")),
        }

        for &version in QDL_PROTOCOL_VERSIONS {
            cancel.check()?;
            chan.discard_pending();
            match hello(&mut chan, version) {
                Ok(hello) => {
                    info!(
                        version,
                        boot_major = hello.boot_major,
                        boot_minor = hello.boot_minor,
                        "QDL session established"
                    );
                    return Ok(Self {
                        chan,
                        observer,
                        cancel,
                        version,
                        hello,
                    });
                }
                Err(e) => debug!(version, error = %e, "QDL hello rejected"),
            }
        }

        Err(Error::protocol("couldn't detect QDL protocol version"))
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn hello(&self) -> &HelloResponse {
        &self.hello
    }

    fn request(&mut self, payload: &[u8], timeout: Duration) -> Result<QdlResponse> {
        self.chan.write(&hdlc_frame(payload), timeout)?;
        read_response(&mut self.chan, timeout)
    }

    /// Send one image: open, every data chunk, session done.
    #[instrument(level = "info", skip_all, fields(image = %image.display_name()))]
    pub fn upload(&mut self, image: &mut Image) -> Result<()> {
        let code = image.image_type().qdl_code().ok_or_else(|| {
            Error::invalid_image(format!("{} has no QDL image type", image.display_name()))
        })?;
        let header = image.read_header()?;
        let data_size = u32::try_from(image.data_size())
            .map_err(|_| Error::invalid_image("image too large for QDL"))?;

        match self.request(&qdl::build_ufopen(code, &header, data_size), QDL_OPEN_TIMEOUT)? {
            QdlResponse::UfOpen(rsp) if rsp.status == 0 => {
                debug!(window = rsp.window_size, chunk = rsp.chunk_size, "Image opened")
            }
            QdlResponse::UfOpen(rsp) => {
                return Err(Error::protocol(format!(
                    "device refused image open (status {})",
                    rsp.status
                )));
            }
            other => return Err(unexpected("open", &other)),
        }

        let n_chunks = image.n_chunks();
        for index in 0..n_chunks {
            self.cancel.check()?;
            let chunk = image.read_chunk(index)?;
            let sequence = index as u16;
            let last = index + 1 == n_chunks;
            let timeout = if last {
                QDL_LAST_CHUNK_TIMEOUT
            } else {
                QDL_CHUNK_TIMEOUT
            };

            // Unframed: the header carries its own CRC.
            self.chan
                .write(&qdl::build_ufwrite(sequence, &chunk), QDL_CHUNK_TIMEOUT)?;
            match read_response(&mut self.chan, timeout)
                .context(format!("chunk {index}/{n_chunks}"))?
            {
                QdlResponse::UfWrite(rsp) if rsp.sequence != sequence => {
                    return Err(Error::protocol(format!(
                        "write acknowledged sequence {} instead of {sequence}",
                        rsp.sequence
                    )));
                }
                QdlResponse::UfWrite(rsp) if rsp.status != 0 => {
                    return Err(Error::protocol(format!(
                        "chunk {sequence} rejected (status {})",
                        rsp.status
                    )));
                }
                QdlResponse::UfWrite(_) => {}
                other => return Err(unexpected("write", &other)),
            }

            self.observer.on_event(&UpdateEvent::Progress {
                phase: UpdatePhase::Downloading,
                operation: image.display_name().to_string(),
                current: index as u64 + 1,
                total: n_chunks as u64,
            });
        }

        match self.request(&qdl::build_ufclose(), QDL_SESSION_DONE_TIMEOUT)? {
            QdlResponse::UfClose(rsp) if rsp.status == 0 => {}
            QdlResponse::UfClose(rsp) => {
                return Err(Error::protocol(format!(
                    "session done failed (status {}, image type 0x{:02x})",
                    rsp.status, rsp.image_type
                )));
            }
            other => return Err(unexpected("session done", &other)),
        }

        info!(chunks = n_chunks, "Image downloaded");
        Ok(())
    }

    /// Ask the modem to reboot. No answer is awaited; failures are logged.
    pub fn reset_to_normal_mode(&mut self) {
        if let Err(e) = self
            .chan
            .write(&hdlc_frame(&qdl::build_reset()), QDL_RESET_TIMEOUT)
        {
            warn!(error = %e, "Couldn't send QDL reset");
        }
    }
}

fn unexpected(what: &str, rsp: &QdlResponse) -> Error {
    Error::protocol(format!("expected {what} response, got {}", rsp.name()))
}

fn read_response<C: Channel>(
    chan: &mut BufferedChannel<C>,
    timeout: Duration,
) -> Result<QdlResponse> {
    let frame = chan.read_hdlc_frame(timeout)?;
    match QdlResponse::parse(&hdlc_unframe(&frame)?)? {
        QdlResponse::Error(err) => Err(err.into_error()),
        rsp => Ok(rsp),
    }
}

fn dload_switch<C: Channel>(chan: &mut BufferedChannel<C>) -> Result<DloadReply> {
    chan.write(&hdlc_frame(&dload::build_sdp_request()), DLOAD_TIMEOUT)?;
    let frame = chan.read_hdlc_frame(DLOAD_TIMEOUT)?;
    dload::parse_sdp_reply(&hdlc_unframe(&frame)?)
}

fn hello<C: Channel>(chan: &mut BufferedChannel<C>, version: u8) -> Result<HelloResponse> {
    chan.write(&hdlc_frame(&qdl::build_hello(version)), QDL_HELLO_TIMEOUT)?;
    match read_response(chan, QDL_HELLO_TIMEOUT)? {
        QdlResponse::Hello(rsp) => Ok(rsp),
        other => Err(unexpected("hello", &other)),
    }
}
