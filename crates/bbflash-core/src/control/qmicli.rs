//! [`ModemControl`] over the `qmicli` command-line tool.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, instrument};

use super::{Capabilities, ControlConnector, FirmwarePreference, FirmwareSnapshot, ModemControl};
use crate::error::{Error, Result};
use crate::image::{ParsedVersion, parse_version_string};

/// Error texts qmicli prints for requests the firmware lacks.
const UNSUPPORTED_MARKERS: &[&str] = &["notsupported", "not supported", "invalidqmicommand"];

/// Creates [`QmicliControl`] handles.
#[derive(Debug, Clone)]
pub struct QmicliConnector {
    program: PathBuf,
}

impl QmicliConnector {
    pub fn new() -> Self {
        Self::with_program("qmicli")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for QmicliConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlConnector for QmicliConnector {
    fn connect(&self, path: &Path) -> Result<Box<dyn ModemControl>> {
        if !path.exists() {
            return Err(Error::DeviceNotFound(path.display().to_string()));
        }
        Ok(Box::new(QmicliControl {
            program: self.program.clone(),
            device: path.to_path_buf(),
        }))
    }
}

/// One control port, driven through `qmicli -p`.
#[derive(Debug)]
pub struct QmicliControl {
    program: PathBuf,
    device: PathBuf,
}

impl QmicliControl {
    #[instrument(skip(self), fields(device = %self.device.display()))]
    fn run(&self, request: &str) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("-d")
            .arg(&self.device)
            .arg("-p")
            .arg(request)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::unsupported(format!("{} is not installed", self.program.display()))
                } else {
                    Error::Io(e)
                }
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            debug!(output = %stdout.trim(), "qmicli done");
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = format!("{} {}", stderr.trim(), stdout.trim()).trim().to_string();
        Err(command_error(request, &message))
    }
}

fn command_error(request: &str, message: &str) -> Error {
    let lower = message.to_ascii_lowercase();
    if UNSUPPORTED_MARKERS.iter().any(|m| lower.contains(m)) {
        Error::unsupported(format!("{request}: {message}"))
    } else {
        Error::protocol(format!("qmicli {request} failed: {message}"))
    }
}

/// Value of `Key: 'value'` (quotes optional).
fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.trim().strip_prefix(key)?.strip_prefix(':')?;
    Some(rest.trim().trim_matches('\''))
}

fn parse_revision(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|l| field_value(l, "Revision"))
        .map(str::to_string)
}

/// Versions in a revision line. Only the first word carries them; the
/// rest is build number, build host and date.
fn revision_version(revision: &str) -> Option<ParsedVersion> {
    parse_version_string(revision.split_whitespace().next()?)
}

fn parse_firmware_preference(output: &str) -> Vec<FirmwarePreference> {
    let mut prefs: Vec<FirmwarePreference> = Vec::new();
    for line in output.lines() {
        if let Some(v) = field_value(line, "Image type") {
            prefs.push(FirmwarePreference {
                image_type: v.to_string(),
                unique_id: String::new(),
                build_id: String::new(),
            });
        } else if let Some(last) = prefs.last_mut() {
            if let Some(v) = field_value(line, "Unique ID") {
                last.unique_id = v.to_string();
            } else if let Some(v) = field_value(line, "Build ID") {
                last.build_id = v.to_string();
            }
        }
    }
    prefs
}

fn parse_images_to_download(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|l| !l.contains("Images to download"))
        .skip(1)
        .map(|l| l.trim().trim_start_matches('[').trim_end_matches(']').trim())
        .filter(|l| !l.is_empty() && *l != "none" && *l != "(none)")
        .map(str::to_string)
        .collect()
}

fn preference_argument(prefs: &[FirmwarePreference], storage_index: Option<u8>) -> Result<String> {
    let snap = FirmwareSnapshot::from_preferences(prefs);
    let (Some(fw), Some(config), Some(carrier)) = (snap.firmware, snap.config, snap.carrier) else {
        return Err(Error::Config(
            "firmware preference needs firmware version, config version and carrier".into(),
        ));
    };
    let mut arg = format!(
        "--dms-set-firmware-preference=firmware-version={fw},config-version={config},carrier={carrier}"
    );
    if let Some(index) = storage_index {
        arg.push_str(&format!(",modem-storage-index={index}"));
    }
    Ok(arg)
}

impl ModemControl for QmicliControl {
    fn get_capabilities(&mut self) -> Result<Capabilities> {
        let revision = parse_revision(&self.run("--dms-get-revision")?);
        let (firmware_preference, prefs) = match self.get_firmware_preference() {
            Ok(prefs) => (true, prefs),
            Err(e) if e.is_unsupported() => (false, Vec::new()),
            Err(e) => return Err(e),
        };
        let mut running = FirmwareSnapshot::from_preferences(&prefs);
        if let Some(parsed) = revision.as_deref().and_then(revision_version) {
            running.firmware = Some(parsed.firmware);
            running.config = running.config.or(parsed.config);
            running.carrier = running.carrier.or(parsed.carrier);
        }
        Ok(Capabilities {
            revision,
            firmware_preference,
            running,
        })
    }

    fn get_firmware_preference(&mut self) -> Result<Vec<FirmwarePreference>> {
        Ok(parse_firmware_preference(&self.run("--dms-get-firmware-preference")?))
    }

    fn set_firmware_preference(
        &mut self,
        prefs: &[FirmwarePreference],
        storage_index: Option<u8>,
    ) -> Result<Vec<String>> {
        let arg = preference_argument(prefs, storage_index)?;
        Ok(parse_images_to_download(&self.run(&arg)?))
    }

    fn power_cycle(&mut self) -> Result<()> {
        self.run("--dms-set-operating-mode=offline")?;
        self.run("--dms-set-operating-mode=reset")?;
        Ok(())
    }

    fn set_firmware_id(&mut self) -> Result<()> {
        self.run("--dms-set-firmware-id").map(drop)
    }

    fn set_boot_image_download_mode(&mut self) -> Result<()> {
        self.run("--dms-set-boot-image-download-mode=boot-and-recovery")
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_revision() {
        let out = "[/dev/cdc-wdm0] Device revision retrieved:\n\tRevision: 'SWI9X30C_02.24.05.06 r7040 CARMD-EV-FRMWR2 2017/05/19 06:23:09'\n";
        assert_eq!(
            parse_revision(out).as_deref(),
            Some("SWI9X30C_02.24.05.06 r7040 CARMD-EV-FRMWR2 2017/05/19 06:23:09")
        );
        assert_eq!(parse_revision("nothing here"), None);
    }

    #[test]
    fn test_revision_version() {
        let parsed =
            revision_version("SWI9X30C_02.24.05.06 r7040 CARMD-EV-FRMWR2 2017/05/19 06:23:09")
                .unwrap();
        assert_eq!(parsed.firmware, "02.24.05.06");
        assert_eq!(revision_version("   "), None);
    }

    fn fake_qmicli(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("qmicli");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             case \"$4\" in\n\
             --dms-get-revision) printf \"[/dev/cdc-wdm0] Device revision retrieved:\\n\\tRevision: 'SWI9X30C_02.24.05.06 r7040 CARMD-EV-FRMWR2 2017/05/19 06:23:09'\\n\" ;;\n\
             *) echo \"error: QMI protocol error (94): 'NotSupported'\" >&2; exit 1 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_capabilities_from_revision_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = QmicliConnector::with_program(fake_qmicli(dir.path()));
        let mut ctl = conn.connect(dir.path()).unwrap();

        let caps = ctl.get_capabilities().unwrap();
        assert!(!caps.firmware_preference);
        assert_eq!(caps.running.firmware.as_deref(), Some("02.24.05.06"));

        let expected = crate::state::ExpectedVersions {
            firmware: Some("02.24.05.06".into()),
            ..Default::default()
        };
        expected.check(&caps.running, false).unwrap();
    }

    #[test]
    fn test_parse_firmware_preference() {
        let out = "[/dev/cdc-wdm0] Firmware preference successfully retrieved:\n\
                   [image 0]\n\tImage type: 'modem'\n\tUnique ID:  '?_?'\n\tBuild ID:   '02.24.05.06_?'\n\
                   [image 1]\n\tImage type: 'pri'\n\tUnique ID:  '002.026_000'\n\tBuild ID:   '02.24.05.06_GENERIC'\n";
        let prefs = parse_firmware_preference(out);
        assert_eq!(
            prefs,
            FirmwarePreference::for_versions("02.24.05.06", "002.026_000", "GENERIC")
        );
    }

    #[test]
    fn test_parse_images_to_download() {
        let out = "Firmware preference successfully selected\n\tImages to download:\n\t\t[modem]\n\t\t[pri]\n";
        assert_eq!(parse_images_to_download(out), vec!["modem", "pri"]);
        let none = "Firmware preference successfully selected\n\tImages to download: \n\t\tnone\n";
        assert!(parse_images_to_download(none).is_empty());
    }

    #[test]
    fn test_preference_argument() {
        let prefs = FirmwarePreference::for_versions("02.24.05.06", "002.026_000", "GENERIC");
        assert_eq!(
            preference_argument(&prefs, Some(2)).unwrap(),
            "--dms-set-firmware-preference=firmware-version=02.24.05.06,config-version=002.026_000,carrier=GENERIC,modem-storage-index=2"
        );
        assert!(preference_argument(&prefs[..1], None).is_err());
    }

    #[test]
    fn test_unsupported_errors() {
        let err = command_error("--dms-get-firmware-preference", "error: QMI protocol error (94): 'NotSupported'");
        assert!(err.is_unsupported());
        let err = command_error("--dms-get-revision", "error: couldn't open the QmiDevice");
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_missing_program_is_unsupported() {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = QmicliConnector::with_program(dir.path().join("no-such-qmicli"));
        let mut ctl = conn.connect(dir.path()).unwrap();
        assert!(ctl.set_firmware_id().unwrap_err().is_unsupported());
        assert_eq!(
            conn.connect(&dir.path().join("cdc-wdm9")).err().map(|e| e.kind()),
            Some(crate::error::ErrorKind::DeviceNotFound)
        );
    }
}
