//! Mock channel for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{Channel, TransportError};
use crate::protocol::hdlc::hdlc_frame;

/// Mock channel for unit testing protocol and device logic.
///
/// Clones share the same queues, so a test can keep a handle while the
/// device under test owns another.
#[derive(Clone)]
pub struct MockChannel {
    /// Queued chunks to return on read.
    read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether the device is "connected".
    connected: Arc<Mutex<bool>>,
    name: String,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            name: "mock".to_string(),
        }
    }

    /// Queue raw bytes to be returned by a later read.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.read_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Queue an HDLC-framed response.
    pub fn queue_frame(&self, payload: &[u8]) {
        self.queue_read(&hdlc_frame(payload));
    }

    /// Number of reads still queued.
    pub fn pending_reads(&self) -> usize {
        self.read_queue.lock().unwrap().len()
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate a hangup.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate the port coming back.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockChannel {
    fn write(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let mut queue = self.read_queue.lock().unwrap();
        let mut chunk = queue.pop_front().ok_or(TransportError::timeout(timeout))?;
        if chunk.len() > max_len {
            let rest = chunk.split_off(max_len);
            queue.push_front(rest);
        }
        Ok(chunk)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
