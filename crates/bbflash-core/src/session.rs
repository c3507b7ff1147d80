//! Update session: the orchestrator driving a modem through an update.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::control::{ControlConnector, FirmwarePreference, QmicliConnector};
use crate::device::{DeviceOpener, SerialDeviceOpener};
use crate::error::{Error, Result, ResultExt};
use crate::events::{LogLevel, ObserverHandle, TracingObserver, UpdateEvent, UpdatePhase};
use crate::image::{ImageType, open_images};
use crate::reseter::{ResetMethod, Reseter};
use crate::selection::{DeviceCandidate, DeviceClass, DeviceSelection, SelectionCriteria, SysfsSelection};
use crate::state::{ExpectedVersions, UpdateOutcome, UpdateRun, UpdateStep};

/// Configuration for an update session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Firmware files to transfer.
    pub images: Vec<PathBuf>,
    /// Download-mode tty, when the modem is already in download mode.
    pub tty: Option<PathBuf>,
    /// Control port of the modem in normal mode.
    pub cdc_wdm: Option<PathBuf>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub busnum: Option<u8>,
    pub devnum: Option<u8>,
    /// Override for the firmware version carried by the images.
    pub firmware_version: Option<String>,
    pub config_version: Option<String>,
    pub carrier: Option<String>,
    pub ignore_version_errors: bool,
    /// Download even when the modem says it has the images already.
    pub override_download: bool,
    pub skip_validation: bool,
    pub modem_storage_index: Option<u8>,
    pub download_mode_timeout_secs: u64,
    pub normal_mode_timeout_secs: u64,
    /// Delay between the control port showing up and querying it.
    pub boot_settle_secs: u64,
    pub validation_retries: u32,
    pub validation_interval_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            images: Vec::new(),
            tty: None,
            cdc_wdm: None,
            vid: None,
            pid: None,
            busnum: None,
            devnum: None,
            firmware_version: None,
            config_version: None,
            carrier: None,
            ignore_version_errors: false,
            override_download: false,
            skip_validation: false,
            modem_storage_index: None,
            download_mode_timeout_secs: 120,
            normal_mode_timeout_secs: 120,
            boot_settle_secs: 5,
            validation_retries: 12,
            validation_interval_secs: 5,
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .context(format!("couldn't read {}", path.as_ref().display()))?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn selection_criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            tty: self.tty.clone(),
            cdc_wdm: self.cdc_wdm.clone(),
            vid: self.vid,
            pid: self.pid,
            busnum: self.busnum,
            devnum: self.devnum,
        }
    }

    fn explicit_versions(&self) -> ExpectedVersions {
        ExpectedVersions {
            firmware: self.firmware_version.clone(),
            config: self.config_version.clone(),
            carrier: self.carrier.clone(),
        }
    }
}

/// Update session - sequences mode switches, transfers and validation.
pub struct UpdateSession {
    config: UpdateConfig,
    selection: Box<dyn DeviceSelection>,
    opener: Box<dyn DeviceOpener>,
    connector: Option<Box<dyn ControlConnector>>,
    observer: ObserverHandle,
    cancel: CancelToken,
}

impl UpdateSession {
    /// Create a session on real hardware with the tracing observer.
    pub fn new(config: UpdateConfig) -> Self {
        let selection = SysfsSelection::new(config.selection_criteria());
        Self {
            config,
            selection: Box::new(selection),
            opener: Box::new(SerialDeviceOpener),
            connector: Some(Box::new(QmicliConnector::new())),
            observer: Arc::new(TracingObserver::default()),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_selection(mut self, selection: Box<dyn DeviceSelection>) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_opener(mut self, opener: Box<dyn DeviceOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Use `connector` for the control port; `None` disables the
    /// control path and post-update validation.
    pub fn with_connector(mut self, connector: Option<Box<dyn ControlConnector>>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_observer(mut self, observer: ObserverHandle) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&UpdateEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn validation_enabled(&self) -> bool {
        self.connector.is_some() && !self.config.skip_validation
    }

    /// Run the complete update.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<UpdateOutcome> {
        self.cancel.check()?;
        let result = self.prepare().and_then(|mut run| {
            let res = self.drive(&mut run);
            if res.is_err() {
                // Dropping the device closes the port; no reset after a failure.
                run.current = None;
                run.device = None;
            }
            res.map(|()| run)
        });

        match result {
            Ok(mut run) => {
                let outcome = run
                    .outcome
                    .take()
                    .unwrap_or_else(|| UpdateOutcome::Updated(run.report.clone()));
                if let UpdateOutcome::Updated(report) = &outcome
                    && report.before.is_some()
                {
                    info!("Firmware summary:\n{}", report.render());
                }
                self.observer.on_event(&UpdateEvent::Complete);
                Ok(outcome)
            }
            Err(e) => {
                self.observer.on_event(&UpdateEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Open the images, reconcile versions and pick the first step.
    fn prepare(&self) -> Result<UpdateRun> {
        if self.config.images.is_empty() {
            return Err(Error::Config("no firmware images given".into()));
        }
        let images = open_images(&self.config.images, self.config.ignore_version_errors)?;
        if let Some(bad) = images.iter().find(|i| i.image_type() == ImageType::Unknown) {
            return Err(Error::invalid_image(format!(
                "{}: unknown firmware image type",
                bad.display_name()
            )));
        }
        let expected = ExpectedVersions::reconcile(
            self.config.explicit_versions(),
            &images,
            self.config.ignore_version_errors,
        )?;
        info!(
            images = images.len(),
            firmware = ?expected.firmware,
            config = ?expected.config,
            carrier = ?expected.carrier,
            "Update prepared"
        );

        let mut run = UpdateRun::new(images, expected, UpdateStep::SelectDevice);
        if self.connector.is_some() && self.config.tty.is_none() {
            match self.selection.find_devices(DeviceClass::CdcWdm) {
                Ok(found) => {
                    if let Some(first) = pick_control_port(found) {
                        run.cdc_wdm = Some(first.path);
                        run.location = Some(first.location);
                        run.step = UpdateStep::QueryCapabilities;
                    }
                }
                Err(e) if e.kind() == crate::error::ErrorKind::DeviceNotFound => {
                    debug!(error = %e, "No control port, assuming download mode");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(run)
    }

    fn drive(&mut self, run: &mut UpdateRun) -> Result<()> {
        let mut phase = UpdatePhase::Preparing;
        while !run.is_done() {
            self.cancel.check()?;
            let step = run.step;
            if step.phase() != phase {
                self.observer.on_event(&UpdateEvent::PhaseChanged {
                    from: phase,
                    to: step.phase(),
                });
                phase = step.phase();
            }
            self.observer.on_event(&UpdateEvent::StepStarted { step });
            let next = self.run_step(run).context(format!("{step} failed"))?;
            run.goto(next);
        }
        if phase != UpdatePhase::Complete {
            self.observer.on_event(&UpdateEvent::PhaseChanged {
                from: phase,
                to: UpdatePhase::Complete,
            });
        }
        Ok(())
    }

    fn run_step(&mut self, run: &mut UpdateRun) -> Result<UpdateStep> {
        match run.step {
            UpdateStep::QueryCapabilities => self.query_capabilities(run),
            UpdateStep::GetFirmwarePreference => {
                let control = require(&mut run.control, "control port")?;
                for pref in control.get_firmware_preference()? {
                    info!(preference = %pref, "Current firmware preference");
                }
                Ok(UpdateStep::SetFirmwarePreference)
            }
            UpdateStep::SetFirmwarePreference => self.set_firmware_preference(run),
            UpdateStep::PowerCycle => {
                let mut control = run
                    .control
                    .take()
                    .ok_or_else(|| Error::protocol("no control port open"))?;
                control.power_cycle()?;
                self.observer.on_event(&UpdateEvent::DeviceLost);
                Ok(UpdateStep::WaitForDownloadModeDevice)
            }
            UpdateStep::EnterDownloadMode => {
                let method = self.enter_download_mode(run)?;
                self.log(LogLevel::Info, format!("Modem reset via {method}"));
                Ok(UpdateStep::WaitForDownloadModeDevice)
            }
            UpdateStep::WaitForDownloadModeDevice => {
                let location = run
                    .location
                    .clone()
                    .ok_or_else(|| Error::DeviceNotFound("modem location unknown".into()))?;
                let tty = self.selection.wait_for_device(
                    DeviceClass::Tty,
                    &location,
                    Duration::from_secs(self.config.download_mode_timeout_secs),
                    &self.cancel,
                )?;
                run.tty = Some(tty);
                Ok(UpdateStep::SelectDevice)
            }
            UpdateStep::SelectDevice => {
                let tty = match run.tty.clone() {
                    Some(tty) => tty,
                    None => {
                        let first = self
                            .selection
                            .find_devices(DeviceClass::Tty)?
                            .into_iter()
                            .next()
                            .ok_or_else(|| Error::DeviceNotFound("no download-mode tty".into()))?;
                        run.location.get_or_insert(first.location);
                        run.tty = Some(first.path.clone());
                        first.path
                    }
                };
                let device = self
                    .opener
                    .open(&tty, self.observer.clone(), &self.cancel)
                    .context(format!("couldn't open {}", tty.display()))?;
                info!(tty = %tty.display(), protocol = device.protocol(), "Device selected");
                run.device = Some(device);
                Ok(UpdateStep::SelectImage)
            }
            UpdateStep::SelectImage => match run.pending.pop_front() {
                Some(image) => {
                    info!(
                        image = image.display_name(),
                        image_type = %image.image_type(),
                        size = image.size(),
                        "Selected image"
                    );
                    run.current = Some(image);
                    Ok(UpdateStep::DownloadImage)
                }
                None => Ok(UpdateStep::CleanupDevice),
            },
            UpdateStep::DownloadImage => {
                let device = require(&mut run.device, "download-mode device")?;
                let image = run
                    .current
                    .as_mut()
                    .ok_or_else(|| Error::protocol("no image selected"))?;
                device.upload(image)?;
                Ok(UpdateStep::CleanupImage)
            }
            UpdateStep::CleanupImage => {
                if let Some(image) = run.current.take() {
                    debug!(image = image.display_name(), "Image done");
                    run.images_done += 1;
                }
                if run.pending.is_empty() {
                    Ok(UpdateStep::CleanupDevice)
                } else {
                    Ok(UpdateStep::SelectImage)
                }
            }
            UpdateStep::CleanupDevice => {
                if let Some(mut device) = run.device.take() {
                    device.reset_to_normal_mode();
                    self.observer.on_event(&UpdateEvent::DeviceLost);
                }
                info!(images = run.images_done, "Transfer finished");
                if self.validation_enabled() && run.location.is_some() {
                    Ok(UpdateStep::WaitForNormalModeDevice)
                } else {
                    Ok(UpdateStep::Done)
                }
            }
            UpdateStep::WaitForNormalModeDevice => {
                let location = run
                    .location
                    .clone()
                    .ok_or_else(|| Error::DeviceNotFound("modem location unknown".into()))?;
                let cdc = self.selection.wait_for_device(
                    DeviceClass::CdcWdm,
                    &location,
                    Duration::from_secs(self.config.normal_mode_timeout_secs),
                    &self.cancel,
                )?;
                run.cdc_wdm = Some(cdc);
                Ok(UpdateStep::WaitForBootSettle)
            }
            UpdateStep::WaitForBootSettle => {
                self.cancel
                    .sleep(Duration::from_secs(self.config.boot_settle_secs))?;
                Ok(UpdateStep::QueryCapabilitiesAgain)
            }
            UpdateStep::QueryCapabilitiesAgain => self.query_capabilities_again(run),
            UpdateStep::Validate => {
                if let Some(after) = &run.report.after {
                    run.expected
                        .check(after, self.config.ignore_version_errors)?;
                    info!(
                        firmware = ?after.firmware,
                        config = ?after.config,
                        carrier = ?after.carrier,
                        "Firmware validated"
                    );
                }
                Ok(UpdateStep::Done)
            }
            UpdateStep::Done => Ok(UpdateStep::Done),
        }
    }

    fn connector(&self) -> Result<&dyn ControlConnector> {
        self.connector
            .as_deref()
            .ok_or_else(|| Error::Config("no modem control configured".into()))
    }

    fn query_capabilities(&mut self, run: &mut UpdateRun) -> Result<UpdateStep> {
        let path = run
            .cdc_wdm
            .clone()
            .ok_or_else(|| Error::DeviceNotFound("no control port".into()))?;
        let mut control = self.connector()?.connect(&path)?;
        let caps = control.get_capabilities()?;
        info!(
            revision = ?caps.revision,
            firmware_preference = caps.firmware_preference,
            "Modem capabilities"
        );
        run.report.before = Some(caps.running.clone());
        run.control = Some(control);
        if caps.firmware_preference {
            Ok(UpdateStep::GetFirmwarePreference)
        } else {
            Ok(UpdateStep::EnterDownloadMode)
        }
    }

    fn set_firmware_preference(&mut self, run: &mut UpdateRun) -> Result<UpdateStep> {
        let (fw, config, carrier) = run.expected.complete()?;
        let prefs = FirmwarePreference::for_versions(fw, config, carrier);
        let control = require(&mut run.control, "control port")?;
        let to_download = control.set_firmware_preference(&prefs, self.config.modem_storage_index)?;
        if to_download.is_empty() {
            if !self.config.override_download {
                info!("Modem already has the requested firmware, no download needed");
                self.log(LogLevel::Info, "No download needed");
                run.control = None;
                run.outcome = Some(UpdateOutcome::NoDownloadNeeded);
                return Ok(UpdateStep::Done);
            }
            warn!("Modem already has the requested firmware, downloading anyway");
        } else {
            info!(images = ?to_download, "Modem requests download");
        }
        Ok(UpdateStep::PowerCycle)
    }

    fn enter_download_mode(&mut self, run: &mut UpdateRun) -> Result<ResetMethod> {
        let ttys = match (self.selection.find_devices(DeviceClass::Tty), &run.location) {
            (Ok(found), Some(location)) => found
                .into_iter()
                .filter(|c| c.location.matches(location))
                .map(|c| c.path)
                .collect(),
            (Ok(found), None) => found.into_iter().map(|c| c.path).collect(),
            (Err(e), _) => {
                debug!(error = %e, "No AT ports");
                Vec::new()
            }
        };
        let mut reseter = Reseter::new(self.observer.clone(), self.cancel.clone()).with_ttys(ttys);
        if let Some(control) = run.control.take() {
            reseter = reseter.with_control(control);
        }
        let method = reseter.run()?;
        self.observer.on_event(&UpdateEvent::DeviceLost);
        Ok(method)
    }

    fn query_capabilities_again(&mut self, run: &mut UpdateRun) -> Result<UpdateStep> {
        let path = run
            .cdc_wdm
            .clone()
            .ok_or_else(|| Error::DeviceNotFound("no control port".into()))?;
        let retries = self.config.validation_retries.max(1) as usize;
        loop {
            self.cancel.check()?;
            run.capabilities_attempts += 1;
            let caps = self
                .connector()?
                .connect(&path)
                .and_then(|mut control| control.get_capabilities());
            match caps {
                Ok(caps) => {
                    run.report.after = Some(caps.running);
                    return Ok(UpdateStep::Validate);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if run.capabilities_attempts >= retries => {
                    return Err(e.context("modem didn't answer after the update"));
                }
                Err(e) => {
                    debug!(attempt = run.capabilities_attempts, error = %e, "Modem not ready yet");
                    self.cancel
                        .sleep(Duration::from_secs(self.config.validation_interval_secs))?;
                }
            }
        }
    }

    /// Reset the modem into download mode and wait for its tty.
    #[instrument(skip(self))]
    pub fn reset_to_download_mode(&mut self) -> Result<PathBuf> {
        self.cancel.check()?;
        let mut run = UpdateRun::new(Vec::new(), ExpectedVersions::default(), UpdateStep::EnterDownloadMode);
        match self.selection.find_devices(DeviceClass::CdcWdm) {
            Ok(found) => {
                if let Some(first) = pick_control_port(found) {
                    if let Some(connector) = &self.connector {
                        match connector.connect(&first.path) {
                            Ok(control) => run.control = Some(control),
                            Err(e) => warn!(error = %e, "Control port unusable"),
                        }
                    }
                    run.location = Some(first.location);
                }
            }
            Err(e) => debug!(error = %e, "No control port"),
        }
        if run.location.is_none() {
            run.location = self
                .selection
                .find_devices(DeviceClass::Tty)?
                .into_iter()
                .next()
                .map(|c| c.location);
        }

        self.observer.on_event(&UpdateEvent::PhaseChanged {
            from: UpdatePhase::Preparing,
            to: UpdatePhase::EnteringDownloadMode,
        });
        self.enter_download_mode(&mut run)?;
        run.goto(UpdateStep::WaitForDownloadModeDevice);
        self.run_step(&mut run)?;
        let tty = run
            .tty
            .ok_or_else(|| Error::DeviceNotFound("no download-mode tty".into()))?;
        info!(tty = %tty.display(), "Modem in download mode");
        Ok(tty)
    }
}

fn require<'a, T: ?Sized>(slot: &'a mut Option<Box<T>>, what: &str) -> Result<&'a mut T> {
    slot.as_deref_mut()
        .ok_or_else(|| Error::protocol(format!("no {what} at this step")))
}

/// First of the control ports found. A modem may expose several (QMI and
/// MBIM); the others are logged and left alone.
fn pick_control_port(found: Vec<DeviceCandidate>) -> Option<DeviceCandidate> {
    let mut found = found.into_iter();
    let first = found.next()?;
    let skipped: Vec<String> = found.map(|c| c.path.display().to_string()).collect();
    debug!(
        chosen = %first.path.display(),
        skipped = ?skipped,
        "Control port selected"
    );
    Some(first)
}
