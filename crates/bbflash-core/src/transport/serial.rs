//! Serial tty channel on top of `serialport`.
//!
//! The port's own timeout is reset to the remaining time before every
//! read and write, so a device that stops talking can never hang the
//! process and a call never gives up before its deadline.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};
use tracing::{debug, instrument, trace};

use super::traits::{Channel, TransportError};

/// Baud rate for download-mode ports. USB ACM ignores it.
pub const BAUD_RATE: u32 = 115_200;

/// Serial port (or pseudo terminal).
pub struct SerialChannel {
    port: Mutex<TTYPort>,
    name: String,
}

impl SerialChannel {
    /// Open a tty in raw 115200 8N1 mode and drop anything still buffered.
    #[instrument(level = "debug", fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let open_failed = |e: serialport::Error| TransportError::OpenFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        let port = serialport::new(path.to_string_lossy(), BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native()
            .map_err(open_failed)?;
        port.clear(ClearBuffer::All).map_err(open_failed)?;

        debug!("Serial port opened");
        Ok(Self::from_port(port, path.display().to_string()))
    }

    /// Wrap an already open port. Its settings are left untouched.
    pub fn from_port(port: TTYPort, name: impl Into<String>) -> Self {
        Self {
            port: Mutex::new(port),
            name: name.into(),
        }
    }

    fn port(&self) -> Result<MutexGuard<'_, TTYPort>, TransportError> {
        self.port
            .lock()
            .map_err(|_| TransportError::Io(io::Error::other("serial port lock poisoned")))
    }
}

/// Time left before `deadline`, or a timeout error once it has passed.
fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration, TransportError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(TransportError::timeout(timeout));
    }
    Ok(left)
}

fn set_timeout(port: &mut TTYPort, left: Duration) -> Result<(), TransportError> {
    port.set_timeout(left)
        .map_err(|e| TransportError::Io(io::Error::other(e.to_string())))
}

impl Channel for SerialChannel {
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut port = self.port()?;
        let mut written = 0;

        while written < data.len() {
            set_timeout(&mut port, remaining(deadline, timeout)?)?;
            match port.write(&data[written..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => written += n,
                Err(e) if is_retryable(&e) => continue,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(TransportError::Disconnected);
                }
                Err(e) => return Err(TransportError::WriteFailed(e.to_string())),
            }
        }

        trace!(port = %self.name, bytes_written = written, "Write complete");
        Ok(written)
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut port = self.port()?;
        let mut buf = vec![0u8; max_len];

        loop {
            set_timeout(&mut port, remaining(deadline, timeout)?)?;
            match port.read(&mut buf) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => {
                    buf.truncate(n);
                    trace!(port = %self.name, bytes_read = n, "Read complete");
                    return Ok(buf);
                }
                Err(e) if is_retryable(&e) => continue,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(TransportError::Disconnected);
                }
                Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A port timeout is re-checked against the call's own deadline.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
