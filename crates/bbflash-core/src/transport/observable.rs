//! Channel wrapper that reports traffic to the observer.

use std::time::Duration;

use super::traits::{Channel, TransportError};
use crate::events::{ObserverHandle, PacketDirection, UpdateEvent};

/// Bytes of each packet copied into the event.
const PREVIEW_LEN: usize = 32;

/// Emits an [`UpdateEvent::Packet`] for every successful read and write.
pub struct ObservableChannel<C: Channel> {
    inner: C,
    observer: ObserverHandle,
}

impl<C: Channel> ObservableChannel<C> {
    pub fn new(inner: C, observer: ObserverHandle) -> Self {
        Self { inner, observer }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn emit(&self, direction: PacketDirection, data: &[u8]) {
        self.observer.on_event(&UpdateEvent::Packet {
            direction,
            port: self.inner.name().to_string(),
            length: data.len(),
            data: Some(data.iter().take(PREVIEW_LEN).cloned().collect()),
        });
    }
}

impl<C: Channel> Channel for ObservableChannel<C> {
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let res = self.inner.write(data, timeout);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, data);
        }
        res
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read(max_len, timeout);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.emit(PacketDirection::Rx, data);
        }
        res
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
