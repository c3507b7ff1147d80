//! bbflash-core: baseband modem firmware update engine.
//!
//! Reflashes cellular modems over a serial port. The modem is switched from
//! normal operation into a programming mode, firmware images are transferred
//! with whichever download protocol the chipset speaks, and the modem is
//! rebooted and checked.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: HDLC framing + CRC16, QDL, DLOAD, Sahara and Firehose codecs
//! - **Transport**: byte channels (serial tty, mock) with per-call deadlines
//! - **Image**: firmware files, including the nested CWE container
//! - **Device**: a download-mode port speaking QDL or Sahara/Firehose
//! - **Selection / Control**: finding device nodes and talking to the modem
//!   in normal mode, behind traits
//! - **Reseter**: the chain of ways to get a modem into download mode
//! - **State / Session**: the step-sequenced update orchestrator
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use bbflash_core::session::{UpdateConfig, UpdateSession};
//!
//! let config = UpdateConfig {
//!     images: vec!["SWI9X30C_02.24.05.06_GENERIC_002.026_000.cwe".into()],
//!     ..Default::default()
//! };
//!
//! let mut session = UpdateSession::new(config);
//! let outcome = session.run().expect("update failed");
//! println!("{outcome:?}");
//! ```

pub mod cancel;
pub mod control;
pub mod device;
pub mod error;
pub mod events;
pub mod image;
pub mod protocol;
pub mod report;
pub mod reseter;
pub mod selection;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use control::{Capabilities, ControlConnector, FirmwarePreference, FirmwareSnapshot, ModemControl};
pub use device::{DeviceOpener, Flasher, SerialDeviceOpener, TransportDevice};
pub use error::{Error, ErrorKind, Result};
pub use events::{LogLevel, NullObserver, ObserverHandle, TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase};
pub use image::{Image, ImageType, ParsedVersion, open_images, parse_version_string};
pub use report::UpdateReport;
pub use reseter::{ResetMethod, Reseter};
pub use selection::{DeviceClass, DeviceLocation, DeviceSelection, SelectionCriteria, SysfsSelection};
pub use session::{UpdateConfig, UpdateSession};
pub use state::{UpdateOutcome, UpdateStep};
pub use transport::{Channel, MockChannel, SerialChannel, TransportError};
