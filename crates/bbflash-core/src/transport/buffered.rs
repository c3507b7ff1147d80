//! Read buffering over a [`Channel`].
//!
//! Serial ttys deliver bytes in arbitrary pieces: one read may hold half a
//! frame or three of them. `BufferedChannel` keeps unconsumed bytes between
//! calls and offers the framing-aware reads the protocol devices need.

use std::time::{Duration, Instant};

use super::traits::{Channel, TransportError};
use crate::protocol::hdlc::HDLC_FLAG;

const READ_CHUNK: usize = 4096;

pub struct BufferedChannel<C: Channel> {
    inner: C,
    pending: Vec<u8>,
}

impl<C: Channel> BufferedChannel<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.inner.write(data, timeout)
    }

    /// Bytes received but not consumed yet.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Drop `n` bytes from the front of the pending buffer.
    pub fn consume(&mut self, n: usize) {
        self.pending.drain(..n.min(self.pending.len()));
    }

    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Append one read's worth of bytes to the pending buffer.
    pub fn fill(&mut self, timeout: Duration) -> Result<usize, TransportError> {
        let data = self.inner.read(READ_CHUNK, timeout)?;
        let n = data.len();
        self.pending.extend_from_slice(&data);
        Ok(n)
    }

    /// Return everything pending, reading once if nothing is buffered.
    pub fn read_some(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.pending.is_empty() {
            self.fill(timeout)?;
        }
        Ok(std::mem::take(&mut self.pending))
    }

    /// Read exactly `len` bytes before the deadline.
    pub fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        while self.pending.len() < len {
            let remaining = remaining(deadline, timeout)?;
            self.fill(remaining)?;
        }
        let rest = self.pending.split_off(len);
        Ok(std::mem::replace(&mut self.pending, rest))
    }

    /// Read one complete HDLC frame, flags included.
    ///
    /// Leading flag bytes are skipped; a frame ends at the first flag that
    /// follows at least one content byte.
    pub fn read_hdlc_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let start = self.pending.iter().position(|&b| b != HDLC_FLAG);
            if let Some(start) = start {
                if let Some(len) = self.pending[start..].iter().position(|&b| b == HDLC_FLAG) {
                    let end = start + len;
                    let mut frame = Vec::with_capacity(len + 2);
                    frame.push(HDLC_FLAG);
                    frame.extend_from_slice(&self.pending[start..end]);
                    frame.push(HDLC_FLAG);
                    self.pending.drain(..=end);
                    return Ok(frame);
                }
            } else {
                self.pending.clear();
            }
            let remaining = remaining(deadline, timeout)?;
            self.fill(remaining)?;
        }
    }
}

fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration, TransportError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        Err(TransportError::timeout(timeout))
    } else {
        Ok(remaining)
    }
}
