//! Modem control in normal mode.
//!
//! The updater only needs a handful of requests from the modem's control
//! protocol, expressed by [`ModemControl`]. [`QmicliControl`] implements them
//! on top of the `qmicli` tool.

pub mod qmicli;

use std::fmt;
use std::path::Path;

use crate::error::Result;

pub use qmicli::{QmicliConnector, QmicliControl};

/// Image type names used in firmware preferences.
pub const PREFERENCE_MODEM: &str = "modem";
pub const PREFERENCE_PRI: &str = "pri";

/// What the running firmware can do and what it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Full revision string reported by the modem.
    pub revision: Option<String>,
    /// Whether firmware preference requests are available.
    pub firmware_preference: bool,
    pub running: FirmwareSnapshot,
}

/// One entry of the firmware preference list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePreference {
    pub image_type: String,
    pub unique_id: String,
    pub build_id: String,
}

impl FirmwarePreference {
    /// Preference list selecting `firmware` with `config` for `carrier`.
    pub fn for_versions(firmware: &str, config: &str, carrier: &str) -> Vec<Self> {
        vec![
            FirmwarePreference {
                image_type: PREFERENCE_MODEM.to_string(),
                unique_id: "?_?".to_string(),
                build_id: format!("{firmware}_?"),
            },
            FirmwarePreference {
                image_type: PREFERENCE_PRI.to_string(),
                unique_id: config.to_string(),
                build_id: format!("{firmware}_{carrier}"),
            },
        ]
    }
}

impl fmt::Display for FirmwarePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: unique id '{}', build id '{}'", self.image_type, self.unique_id, self.build_id)
    }
}

/// Firmware, config and carrier of a modem at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareSnapshot {
    pub firmware: Option<String>,
    pub config: Option<String>,
    pub carrier: Option<String>,
}

impl FirmwareSnapshot {
    /// Derive a snapshot from a preference list (`pri` entry wins for
    /// config and carrier).
    pub fn from_preferences(prefs: &[FirmwarePreference]) -> Self {
        let mut snap = FirmwareSnapshot::default();
        for pref in prefs {
            let (build_fw, build_tail) = match pref.build_id.split_once('_') {
                Some((fw, tail)) => (fw, tail),
                None => (pref.build_id.as_str(), "?"),
            };
            if build_fw != "?" && snap.firmware.is_none() {
                snap.firmware = Some(build_fw.to_string());
            }
            if pref.image_type == PREFERENCE_PRI {
                if pref.unique_id != "?_?" && !pref.unique_id.is_empty() {
                    snap.config = Some(pref.unique_id.clone());
                }
                if build_tail != "?" {
                    snap.carrier = Some(build_tail.to_string());
                }
            }
        }
        snap
    }
}

/// The subset of the modem control protocol the updater uses.
///
/// Requests the firmware doesn't implement fail with an
/// `UnsupportedFeature` error.
pub trait ModemControl: Send {
    fn get_capabilities(&mut self) -> Result<Capabilities>;

    fn get_firmware_preference(&mut self) -> Result<Vec<FirmwarePreference>>;

    /// Select the firmware to boot. Returns the image types the modem still
    /// needs downloaded; empty when it already has them.
    fn set_firmware_preference(
        &mut self,
        prefs: &[FirmwarePreference],
        storage_index: Option<u8>,
    ) -> Result<Vec<String>>;

    /// Offline then reset.
    fn power_cycle(&mut self) -> Result<()>;

    /// Reboot into download mode by invalidating the firmware id.
    fn set_firmware_id(&mut self) -> Result<()>;

    /// Make the next boot stop in the boot loader.
    fn set_boot_image_download_mode(&mut self) -> Result<()>;
}

/// Connects to a control port.
pub trait ControlConnector: Send + Sync {
    fn connect(&self, path: &Path) -> Result<Box<dyn ModemControl>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferences_for_versions() {
        let prefs = FirmwarePreference::for_versions("02.24.05.06", "002.026_000", "GENERIC");
        assert_eq!(prefs[0].image_type, "modem");
        assert_eq!(prefs[0].unique_id, "?_?");
        assert_eq!(prefs[0].build_id, "02.24.05.06_?");
        assert_eq!(prefs[1].image_type, "pri");
        assert_eq!(prefs[1].unique_id, "002.026_000");
        assert_eq!(prefs[1].build_id, "02.24.05.06_GENERIC");
    }

    #[test]
    fn test_snapshot_from_preferences() {
        let prefs = FirmwarePreference::for_versions("02.24.05.06", "002.026_000", "GENERIC");
        let snap = FirmwareSnapshot::from_preferences(&prefs);
        assert_eq!(snap.firmware.as_deref(), Some("02.24.05.06"));
        assert_eq!(snap.config.as_deref(), Some("002.026_000"));
        assert_eq!(snap.carrier.as_deref(), Some("GENERIC"));

        assert_eq!(FirmwareSnapshot::from_preferences(&[]), FirmwareSnapshot::default());
    }
}
