//! Update steps and the working state of one run.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use tracing::warn;

use crate::control::{FirmwareSnapshot, ModemControl};
use crate::device::Flasher;
use crate::error::{Error, Result};
use crate::events::UpdatePhase;
use crate::image::Image;
use crate::image::cwe::merge_field;
use crate::report::UpdateReport;
use crate::selection::DeviceLocation;

/// One step of the update driver loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    QueryCapabilities,
    GetFirmwarePreference,
    SetFirmwarePreference,
    PowerCycle,
    /// Reseter chain, for firmware without preference support.
    EnterDownloadMode,
    WaitForDownloadModeDevice,
    SelectDevice,
    SelectImage,
    DownloadImage,
    CleanupImage,
    CleanupDevice,
    WaitForNormalModeDevice,
    WaitForBootSettle,
    QueryCapabilitiesAgain,
    Validate,
    Done,
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateStep::QueryCapabilities => "QUERY_CAPABILITIES",
            UpdateStep::GetFirmwarePreference => "GET_FIRMWARE_PREFERENCE",
            UpdateStep::SetFirmwarePreference => "SET_FIRMWARE_PREFERENCE",
            UpdateStep::PowerCycle => "POWER_CYCLE",
            UpdateStep::EnterDownloadMode => "ENTER_DOWNLOAD_MODE",
            UpdateStep::WaitForDownloadModeDevice => "WAIT_FOR_DOWNLOAD_MODE_DEVICE",
            UpdateStep::SelectDevice => "SELECT_DEVICE",
            UpdateStep::SelectImage => "SELECT_IMAGE",
            UpdateStep::DownloadImage => "DOWNLOAD_IMAGE",
            UpdateStep::CleanupImage => "CLEANUP_IMAGE",
            UpdateStep::CleanupDevice => "CLEANUP_DEVICE",
            UpdateStep::WaitForNormalModeDevice => "WAIT_FOR_NORMAL_MODE_DEVICE",
            UpdateStep::WaitForBootSettle => "WAIT_FOR_BOOT_SETTLE",
            UpdateStep::QueryCapabilitiesAgain => "QUERY_CAPABILITIES_AGAIN",
            UpdateStep::Validate => "VALIDATE",
            UpdateStep::Done => "DONE",
        };
        f.write_str(s)
    }
}

impl UpdateStep {
    /// Coarse phase reported to observers.
    pub fn phase(self) -> UpdatePhase {
        match self {
            UpdateStep::QueryCapabilities
            | UpdateStep::GetFirmwarePreference
            | UpdateStep::SetFirmwarePreference => UpdatePhase::Preparing,
            UpdateStep::PowerCycle | UpdateStep::EnterDownloadMode => {
                UpdatePhase::EnteringDownloadMode
            }
            UpdateStep::WaitForDownloadModeDevice
            | UpdateStep::SelectDevice
            | UpdateStep::WaitForNormalModeDevice
            | UpdateStep::WaitForBootSettle => UpdatePhase::WaitingForDevice,
            UpdateStep::SelectImage | UpdateStep::DownloadImage | UpdateStep::CleanupImage => {
                UpdatePhase::Downloading
            }
            UpdateStep::CleanupDevice => UpdatePhase::Resetting,
            UpdateStep::QueryCapabilitiesAgain | UpdateStep::Validate => UpdatePhase::Validating,
            UpdateStep::Done => UpdatePhase::Complete,
        }
    }
}

/// Versions the modem should run once the update is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedVersions {
    pub firmware: Option<String>,
    pub config: Option<String>,
    pub carrier: Option<String>,
}

impl ExpectedVersions {
    /// Merge explicit values with those carried by the images. Explicit
    /// values are seen first, so they win when mismatches are ignored.
    pub fn reconcile(
        explicit: ExpectedVersions,
        images: &[Image],
        ignore_version_errors: bool,
    ) -> Result<Self> {
        let mut merged = explicit;
        for image in images {
            let source = image.display_name();
            let ignore = ignore_version_errors;
            merge_field(&mut merged.firmware, image.firmware_version().map(str::to_string), "firmware version", source, ignore)?;
            merge_field(&mut merged.config, image.config_version().map(str::to_string), "config version", source, ignore)?;
            merge_field(&mut merged.carrier, image.carrier().map(str::to_string), "carrier", source, ignore)?;
        }
        Ok(merged)
    }

    /// All three values, as needed to select a firmware preference.
    pub fn complete(&self) -> Result<(&str, &str, &str)> {
        match (&self.firmware, &self.config, &self.carrier) {
            (Some(fw), Some(cfg), Some(carrier)) => Ok((fw, cfg, carrier)),
            _ => Err(Error::Config(format!(
                "firmware version, config version and carrier are all required (have {}, {}, {})",
                self.firmware.as_deref().unwrap_or("?"),
                self.config.as_deref().unwrap_or("?"),
                self.carrier.as_deref().unwrap_or("?"),
            ))),
        }
    }

    /// Compare with what the modem runs.
    pub fn check(&self, running: &FirmwareSnapshot, ignore_version_errors: bool) -> Result<()> {
        let fields = [
            ("firmware version", &self.firmware, &running.firmware),
            ("config version", &self.config, &running.config),
            ("carrier", &self.carrier, &running.carrier),
        ];
        for (what, expected, actual) in fields {
            let Some(expected) = expected else { continue };
            if actual.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(expected)) {
                continue;
            }
            let msg = format!(
                "modem runs {what} {} instead of {expected}",
                actual.as_deref().unwrap_or("unknown")
            );
            if ignore_version_errors {
                warn!("{msg}");
            } else {
                return Err(Error::VersionMismatch(msg));
            }
        }
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(UpdateReport),
    /// The modem already had the requested firmware.
    NoDownloadNeeded,
}

/// Working state owned by the driver loop.
pub struct UpdateRun {
    pub step: UpdateStep,
    /// Images still to transfer, largest first.
    pub pending: VecDeque<Image>,
    pub current: Option<Image>,
    pub device: Option<Box<dyn Flasher>>,
    pub control: Option<Box<dyn ModemControl>>,
    pub expected: ExpectedVersions,
    pub location: Option<DeviceLocation>,
    pub tty: Option<PathBuf>,
    pub cdc_wdm: Option<PathBuf>,
    pub images_done: usize,
    pub capabilities_attempts: usize,
    pub report: UpdateReport,
    pub outcome: Option<UpdateOutcome>,
}

impl UpdateRun {
    pub fn new(images: Vec<Image>, expected: ExpectedVersions, first: UpdateStep) -> Self {
        Self {
            step: first,
            pending: images.into(),
            current: None,
            device: None,
            control: None,
            expected,
            location: None,
            tty: None,
            cdc_wdm: None,
            images_done: 0,
            capabilities_attempts: 0,
            report: UpdateReport::default(),
            outcome: None,
        }
    }

    /// Transition to the next step.
    pub fn goto(&mut self, step: UpdateStep) {
        tracing::info!(from = %self.step, to = %step, "Step transition");
        self.step = step;
    }

    pub fn is_done(&self) -> bool {
        self.step == UpdateStep::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(fw: &str, cfg: &str, carrier: &str) -> ExpectedVersions {
        ExpectedVersions {
            firmware: Some(fw.into()),
            config: Some(cfg.into()),
            carrier: Some(carrier.into()),
        }
    }

    #[test]
    fn test_step_phase() {
        assert_eq!(UpdateStep::DownloadImage.phase(), UpdatePhase::Downloading);
        assert_eq!(UpdateStep::PowerCycle.phase(), UpdatePhase::EnteringDownloadMode);
        assert_eq!(UpdateStep::Validate.to_string(), "VALIDATE");
    }

    #[test]
    fn test_complete_requires_all() {
        let e = expected("02.24.05.06", "002.026_000", "GENERIC");
        assert_eq!(e.complete().unwrap(), ("02.24.05.06", "002.026_000", "GENERIC"));
        let partial = ExpectedVersions {
            carrier: None,
            ..e
        };
        assert_eq!(partial.complete().unwrap_err().kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_check_running() {
        let e = expected("02.24.05.06", "002.026_000", "GENERIC");
        let mut running = FirmwareSnapshot {
            firmware: Some("02.24.05.06".into()),
            config: Some("002.026_000".into()),
            carrier: Some("generic".into()),
        };
        e.check(&running, false).unwrap();

        running.firmware = Some("02.20.03.00".into());
        let err = e.check(&running, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::VersionMismatch);
        e.check(&running, true).unwrap();

        // Nothing expected, nothing to compare.
        ExpectedVersions::default()
            .check(&FirmwareSnapshot::default(), false)
            .unwrap();
    }

    #[test]
    fn test_goto() {
        let mut run = UpdateRun::new(Vec::new(), ExpectedVersions::default(), UpdateStep::SelectDevice);
        assert!(!run.is_done());
        run.goto(UpdateStep::Done);
        assert!(run.is_done());
    }
}
