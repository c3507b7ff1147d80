//! Putting a modem into download mode.
//!
//! Methods are tried in order until one works:
//!
//! 1. control protocol: invalidate the firmware id,
//! 2. control protocol: boot-image download mode, then power cycle,
//! 3. `AT!BOOTHOLD` on each tty of the modem.
//!
//! A method whose requests the modem lacks reports `UnsupportedFeature` and
//! the next one runs.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::control::ModemControl;
use crate::error::{Error, Result};
use crate::events::{LogLevel, ObserverHandle, UpdateEvent};
use crate::transport::{BufferedChannel, Channel, ObservableChannel, SerialChannel, TransportError};

pub const BOOTHOLD_COMMAND: &[u8] = b"AT!BOOTHOLD\r";
pub const BOOTHOLD_TIMEOUT: Duration = Duration::from_secs(3);
/// Passes over the tty list.
pub const BOOTHOLD_ROUNDS: usize = 2;

/// The method that got the modem rebooting into download mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetMethod {
    FirmwareId,
    BootImageDownloadMode,
    Boothold(PathBuf),
}

impl std::fmt::Display for ResetMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetMethod::FirmwareId => write!(f, "firmware id"),
            ResetMethod::BootImageDownloadMode => write!(f, "boot image download mode"),
            ResetMethod::Boothold(path) => write!(f, "AT!BOOTHOLD on {}", path.display()),
        }
    }
}

type PortOpener = Box<dyn Fn(&Path) -> Result<Box<dyn Channel>> + Send + Sync>;

pub struct Reseter {
    control: Option<Box<dyn ModemControl>>,
    ttys: Vec<PathBuf>,
    open_port: PortOpener,
    observer: ObserverHandle,
    cancel: CancelToken,
}

impl Reseter {
    pub fn new(observer: ObserverHandle, cancel: CancelToken) -> Self {
        let obs = observer.clone();
        Self {
            control: None,
            ttys: Vec::new(),
            open_port: Box::new(move |path| {
                let serial = SerialChannel::open(path)?;
                Ok(Box::new(ObservableChannel::new(serial, obs.clone())) as Box<dyn Channel>)
            }),
            observer,
            cancel,
        }
    }

    pub fn with_control(mut self, control: Box<dyn ModemControl>) -> Self {
        self.control = Some(control);
        self
    }

    /// Ttys to try `AT!BOOTHOLD` on.
    pub fn with_ttys(mut self, ttys: Vec<PathBuf>) -> Self {
        self.ttys = ttys;
        self
    }

    /// Replace how AT ports are opened.
    pub fn with_port_opener<F>(mut self, open: F) -> Self
    where
        F: Fn(&Path) -> Result<Box<dyn Channel>> + Send + Sync + 'static,
    {
        self.open_port = Box::new(open);
        self
    }

    fn log(&self, level: LogLevel, message: String) {
        self.observer.on_event(&UpdateEvent::Log { level, message });
    }

    /// Run the chain. Fails only when every method failed.
    #[instrument(skip(self))]
    pub fn run(mut self) -> Result<ResetMethod> {
        if let Some(mut control) = self.control.take() {
            self.cancel.check()?;
            match control.set_firmware_id() {
                Ok(()) => return self.done(ResetMethod::FirmwareId),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => self.fall_through("firmware id", &e),
            }

            self.cancel.check()?;
            let result = control
                .set_boot_image_download_mode()
                .and_then(|()| control.power_cycle());
            match result {
                Ok(()) => return self.done(ResetMethod::BootImageDownloadMode),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => self.fall_through("boot image download mode", &e),
            }
        }

        let mut ttys = std::mem::take(&mut self.ttys);
        ttys.sort_by(|a, b| b.cmp(a));
        for round in 1..=BOOTHOLD_ROUNDS {
            for tty in &ttys {
                self.cancel.check()?;
                match self.boothold(tty) {
                    Ok(()) => return self.done(ResetMethod::Boothold(tty.clone())),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => debug!(tty = %tty.display(), round, error = %e, "AT!BOOTHOLD failed"),
                }
            }
        }

        Err(Error::unsupported(format!(
            "couldn't switch the modem into download mode ({} ttys tried)",
            ttys.len()
        )))
    }

    fn done(&self, method: ResetMethod) -> Result<ResetMethod> {
        info!(method = %method, "Modem rebooting into download mode");
        self.log(LogLevel::Info, format!("Reset requested via {method}"));
        Ok(method)
    }

    fn fall_through(&self, what: &str, err: &Error) {
        if err.is_unsupported() {
            debug!(error = %err, "{what} not supported");
        } else {
            warn!(error = %err, "{what} reset failed");
        }
        self.log(LogLevel::Debug, format!("{what} reset unavailable: {err}"));
    }

    /// Send `AT!BOOTHOLD` and wait for `OK`.
    fn boothold(&self, tty: &Path) -> Result<()> {
        let mut chan = BufferedChannel::new((self.open_port)(tty)?);
        let deadline = Instant::now() + BOOTHOLD_TIMEOUT;
        chan.write(BOOTHOLD_COMMAND, BOOTHOLD_TIMEOUT)?;
        loop {
            let reply = String::from_utf8_lossy(chan.pending()).into_owned();
            if reply.lines().any(|l| l.trim() == "OK") {
                return Ok(());
            }
            if reply.lines().any(|l| l.trim().starts_with("ERROR")) {
                return Err(Error::unsupported(format!(
                    "{} rejected AT!BOOTHOLD",
                    tty.display()
                )));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(BOOTHOLD_TIMEOUT).into());
            }
            chan.fill(remaining)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Capabilities, FirmwarePreference};
    use crate::events::NullObserver;
    use crate::transport::MockChannel;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeControl {
        firmware_id: bool,
        boot_mode: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ModemControl for FakeControl {
        fn get_capabilities(&mut self) -> Result<Capabilities> {
            Ok(Capabilities::default())
        }
        fn get_firmware_preference(&mut self) -> Result<Vec<FirmwarePreference>> {
            Ok(Vec::new())
        }
        fn set_firmware_preference(
            &mut self,
            _prefs: &[FirmwarePreference],
            _storage_index: Option<u8>,
        ) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn power_cycle(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("power_cycle");
            Ok(())
        }
        fn set_firmware_id(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("set_firmware_id");
            if self.firmware_id {
                Ok(())
            } else {
                Err(Error::unsupported("set firmware id"))
            }
        }
        fn set_boot_image_download_mode(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("set_boot_image_download_mode");
            if self.boot_mode {
                Ok(())
            } else {
                Err(Error::unsupported("boot image download mode"))
            }
        }
    }

    /// Ports keyed by path; unknown paths fail to open.
    fn opener(ports: HashMap<PathBuf, MockChannel>) -> impl Fn(&Path) -> Result<Box<dyn Channel>> + Send + Sync {
        move |path: &Path| match ports.get(path) {
            Some(mock) => Ok(Box::new(mock.clone()) as Box<dyn Channel>),
            None => Err(Error::DeviceNotFound(path.display().to_string())),
        }
    }

    fn reseter() -> Reseter {
        Reseter::new(Arc::new(NullObserver), CancelToken::new())
    }

    #[test]
    fn test_firmware_id_first() {
        let control = FakeControl {
            firmware_id: true,
            ..Default::default()
        };
        let calls = control.calls.clone();
        let method = reseter().with_control(Box::new(control)).run().unwrap();
        assert_eq!(method, ResetMethod::FirmwareId);
        assert_eq!(*calls.lock().unwrap(), vec!["set_firmware_id"]);
    }

    #[test]
    fn test_boot_mode_then_power_cycle() {
        let control = FakeControl {
            boot_mode: true,
            ..Default::default()
        };
        let calls = control.calls.clone();
        let method = reseter().with_control(Box::new(control)).run().unwrap();
        assert_eq!(method, ResetMethod::BootImageDownloadMode);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["set_firmware_id", "set_boot_image_download_mode", "power_cycle"]
        );
    }

    #[test]
    fn test_boothold_highest_tty_first() {
        let low = MockChannel::new();
        let high = MockChannel::new();
        high.queue_read(b"\r\nOK\r\n");
        let ports = HashMap::from([
            (PathBuf::from("/dev/ttyUSB0"), low.clone()),
            (PathBuf::from("/dev/ttyUSB2"), high.clone()),
        ]);
        let method = reseter()
            .with_control(Box::new(FakeControl::default()))
            .with_ttys(vec!["/dev/ttyUSB0".into(), "/dev/ttyUSB2".into()])
            .with_port_opener(opener(ports))
            .run()
            .unwrap();
        assert_eq!(method, ResetMethod::Boothold("/dev/ttyUSB2".into()));
        assert_eq!(high.get_writes(), vec![BOOTHOLD_COMMAND.to_vec()]);
        assert!(low.get_writes().is_empty());
    }

    #[test]
    fn test_boothold_retries_whole_list() {
        let port = MockChannel::new();
        let ports = HashMap::from([(PathBuf::from("/dev/ttyUSB1"), port.clone())]);
        let err = reseter()
            .with_ttys(vec!["/dev/ttyUSB1".into(), "/dev/ttyUSB9".into()])
            .with_port_opener(opener(ports))
            .run()
            .unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(port.get_writes().len(), BOOTHOLD_ROUNDS);
    }

    #[test]
    fn test_boothold_error_reply() {
        let port = MockChannel::new();
        port.queue_read(b"AT!BOOTHOLD\r\r\nERROR\r\n");
        let ports = HashMap::from([(PathBuf::from("/dev/ttyUSB0"), port.clone())]);
        let err = reseter()
            .with_ttys(vec!["/dev/ttyUSB0".into()])
            .with_port_opener(opener(ports))
            .run()
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Reseter::new(Arc::new(NullObserver), cancel)
            .with_control(Box::new(FakeControl::default()))
            .run()
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
