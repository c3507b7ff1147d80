//! Transport devices: a serial port speaking one of the download protocols.

pub mod qdl;
pub mod sahara;

use std::path::Path;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::events::{ObserverHandle, UpdateEvent};
use crate::image::Image;
use crate::transport::{Channel, ObservableChannel, SerialChannel};

pub use qdl::QdlDevice;
pub use sahara::{FirehoseGeometry, FirehoseOperation, SaharaDevice};

/// What the orchestrator needs from an open download-mode device.
pub trait Flasher: Send {
    fn protocol(&self) -> &'static str;

    /// Transfer one image.
    fn upload(&mut self, image: &mut Image) -> Result<()>;

    /// Best-effort reboot into normal mode. Errors are logged, not returned.
    fn reset_to_normal_mode(&mut self);
}

/// Opens a download-mode port and detects its protocol.
pub trait DeviceOpener: Send + Sync {
    fn open(
        &self,
        path: &Path,
        observer: ObserverHandle,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Flasher>>;
}

/// A modem in download mode.
pub enum TransportDevice<C: Channel> {
    Qdl(QdlDevice<C>),
    Sahara(SaharaDevice<C>),
}

impl<C: Channel + 'static> TransportDevice<C> {
    /// Try Sahara first, then QDL on a freshly opened channel.
    pub fn open_auto<F>(mut open: F, observer: ObserverHandle, cancel: &CancelToken) -> Result<Self>
    where
        F: FnMut() -> Result<C>,
    {
        let chan = open()?;
        let name = chan.name().to_string();
        let device = match SaharaDevice::open(chan, observer.clone(), cancel.clone()) {
            Ok(dev) => TransportDevice::Sahara(dev),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(error = %e, "Sahara probe failed, trying QDL");
                TransportDevice::Qdl(QdlDevice::open(open()?, observer.clone(), cancel.clone())?)
            }
        };
        info!(port = %name, protocol = device.protocol(), "Download-mode device opened");
        observer.on_event(&UpdateEvent::DeviceOpened {
            path: name,
            protocol: device.protocol().to_string(),
        });
        Ok(device)
    }
}

impl<C: Channel + 'static> Flasher for TransportDevice<C> {
    fn protocol(&self) -> &'static str {
        match self {
            TransportDevice::Qdl(_) => "QDL",
            TransportDevice::Sahara(_) => "Firehose",
        }
    }

    fn upload(&mut self, image: &mut Image) -> Result<()> {
        match self {
            TransportDevice::Qdl(dev) => dev.upload(image),
            TransportDevice::Sahara(dev) => dev.upload(image),
        }
    }

    fn reset_to_normal_mode(&mut self) {
        match self {
            TransportDevice::Qdl(dev) => dev.reset_to_normal_mode(),
            TransportDevice::Sahara(dev) => dev.reset_to_normal_mode(),
        }
    }
}

/// Opens real ttys, with packet tracing through the observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialDeviceOpener;

impl DeviceOpener for SerialDeviceOpener {
    fn open(
        &self,
        path: &Path,
        observer: ObserverHandle,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Flasher>> {
        let open = || -> Result<ObservableChannel<SerialChannel>> {
            let serial = SerialChannel::open(path)?;
            Ok(ObservableChannel::new(serial, observer.clone()))
        };
        let device = TransportDevice::open_auto(open, observer.clone(), cancel)?;
        Ok(Box::new(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::constants::*;
    use crate::transport::MockChannel;
    use std::sync::Arc;

    #[test]
    fn test_open_auto_prefers_sahara() {
        let mock = MockChannel::new();
        sahara::tests::queue_handshake(&mock);
        let m = mock.clone();
        let dev = TransportDevice::open_auto(
            move || Ok(m.clone()),
            Arc::new(NullObserver),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(dev.protocol(), "Firehose");
    }

    #[test]
    fn test_open_auto_falls_back_to_qdl() {
        let mock = MockChannel::new();
        let m = mock.clone();
        let mut opened = 0;
        let open = move || {
            opened += 1;
            if opened == 2 {
                // Only the second open sees QDL replies.
                m.queue_frame(&[DLOAD_CMD_ACK, 0, 0]);
                let mut hello = vec![QDL_CMD_HELLO_RSP];
                hello.extend_from_slice(&[0u8; 33]);
                m.queue_frame(&hello);
            }
            Ok(m.clone())
        };
        let dev = TransportDevice::open_auto(open, Arc::new(NullObserver), &CancelToken::new())
            .unwrap();
        assert_eq!(dev.protocol(), "QDL");
    }

    #[test]
    fn test_open_auto_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mock = MockChannel::new();
        let err = TransportDevice::open_auto(move || Ok(mock.clone()), Arc::new(NullObserver), &cancel)
            .err()
            .unwrap();
        assert!(err.is_cancelled());
    }
}
