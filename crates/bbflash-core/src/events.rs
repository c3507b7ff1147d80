//! Event system for UI decoupling.
//!
//! The observer is the explicit logging handle of the engine: sessions,
//! devices and the reseter receive an `Arc<dyn UpdateObserver>` at
//! construction and report through it. Nothing in the crate consults a
//! global verbosity switch.

use std::fmt;
use std::sync::Arc;

use crate::error::ErrorKind;
use crate::state::UpdateStep;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Coarse phases of an update run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// Talking to the modem in normal mode.
    Preparing,
    /// Switching the modem into its programming mode.
    EnteringDownloadMode,
    /// Waiting for a device node to (re)appear.
    WaitingForDevice,
    /// Image transfer in progress.
    Downloading,
    /// Resetting the device back to normal mode.
    Resetting,
    /// Post-update checks.
    Validating,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Preparing => write!(f, "Preparing"),
            UpdatePhase::EnteringDownloadMode => write!(f, "Entering Download Mode"),
            UpdatePhase::WaitingForDevice => write!(f, "Waiting for Device"),
            UpdatePhase::Downloading => write!(f, "Downloading"),
            UpdatePhase::Resetting => write!(f, "Resetting"),
            UpdatePhase::Validating => write!(f, "Validating"),
            UpdatePhase::Complete => write!(f, "Complete"),
            UpdatePhase::Error => write!(f, "Error"),
        }
    }
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted during an update.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// A transport device finished its handshake.
    DeviceOpened { path: String, protocol: String },
    /// The device went away (expected after a reset).
    DeviceLost,
    /// Phase changed.
    PhaseChanged { from: UpdatePhase, to: UpdatePhase },
    /// The orchestrator is about to run a step.
    StepStarted { step: UpdateStep },
    /// Progress update for the current operation.
    Progress {
        phase: UpdatePhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Bytes sent/received on the wire.
    Packet {
        direction: PacketDirection,
        port: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Error occurred.
    Error { kind: ErrorKind, message: String },
    /// All operations completed successfully.
    Complete,
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// Shared observer handle.
pub type ObserverHandle = Arc<dyn UpdateObserver>;

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
///
/// Packet dumps are only rendered when `packets` is set, so protocol
/// tracing is chosen per session rather than process-wide.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver {
    pub packets: bool,
}

impl TracingObserver {
    pub fn with_packets(packets: bool) -> Self {
        Self { packets }
    }
}

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::DeviceOpened { path, protocol } => {
                tracing::info!(path = %path, protocol = %protocol, "Device opened");
            }
            UpdateEvent::DeviceLost => {
                tracing::debug!("Device went away");
            }
            UpdateEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            UpdateEvent::StepStarted { step } => {
                tracing::debug!(step = %step, "Running step");
            }
            UpdateEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::info!(phase = %phase, operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            UpdateEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UpdateEvent::Packet {
                direction,
                port,
                length,
                data,
            } => {
                if self.packets {
                    tracing::trace!(
                        dir = %direction,
                        port = %port,
                        len = length,
                        data = %data.as_deref().map(hex_preview).unwrap_or_default(),
                        "Packet"
                    );
                }
            }
            UpdateEvent::Error { kind, message } => {
                tracing::error!(kind = %kind, "Error: {}", message);
            }
            UpdateEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

/// Render bytes as `7e:01:02…` for packet traces.
pub fn hex_preview(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0x7e, 0x01, 0xff]), "7e:01:ff");
        assert_eq!(hex_preview(&[]), "");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(
            UpdatePhase::EnteringDownloadMode.to_string(),
            "Entering Download Mode"
        );
    }
}
