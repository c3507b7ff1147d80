//! Device enumeration.
//!
//! The orchestrator only sees [`DeviceSelection`]. [`SysfsSelection`] is the
//! Linux adapter: USB devices are listed with `nusb`, their tty and cdc-wdm
//! children are found by walking sysfs.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nusb::MaybeFuture;
use tracing::{debug, info, instrument};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Kind of device node to look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Serial port (`ttyUSB*`, `ttyACM*`), used in download mode and for AT.
    Tty,
    /// QMI control port (`cdc-wdm*`), used in normal mode.
    CdcWdm,
}

impl DeviceClass {
    fn prefixes(self) -> &'static [&'static str] {
        match self {
            DeviceClass::Tty => &["ttyUSB", "ttyACM"],
            DeviceClass::CdcWdm => &["cdc-wdm"],
        }
    }

    fn sysfs_class(self) -> &'static str {
        match self {
            DeviceClass::Tty => "tty",
            DeviceClass::CdcWdm => "usbmisc",
        }
    }

    fn matches_name(self, name: &str) -> bool {
        self.prefixes().iter().any(|p| name.starts_with(p))
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceClass::Tty => write!(f, "tty"),
            DeviceClass::CdcWdm => write!(f, "cdc-wdm"),
        }
    }
}

/// Physical position of a modem on the USB tree.
///
/// A modem switching between normal and download mode re-enumerates, and
/// may come back on the USB2/USB3 twin of its port, so the port's `peer` is
/// recorded too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLocation {
    pub sysfs_path: PathBuf,
    pub port: Option<PathBuf>,
    pub peer_port: Option<PathBuf>,
}

impl DeviceLocation {
    /// Resolve the location of the USB device at `sysfs_path`.
    pub fn from_sysfs(sysfs_path: &Path) -> Self {
        let port = fs::canonicalize(sysfs_path.join("port")).ok();
        let peer_port = port
            .as_ref()
            .and_then(|p| fs::canonicalize(p.join("peer")).ok());
        Self {
            sysfs_path: sysfs_path.to_path_buf(),
            port,
            peer_port,
        }
    }

    /// Same device, same port, or the port's peer.
    pub fn matches(&self, other: &DeviceLocation) -> bool {
        if self.sysfs_path == other.sysfs_path {
            return true;
        }
        let same = |a: &Option<PathBuf>, b: &Option<PathBuf>| matches!((a, b), (Some(a), Some(b)) if a == b);
        same(&self.port, &other.port)
            || same(&self.port, &other.peer_port)
            || same(&self.peer_port, &other.port)
    }
}

/// A device node plus the USB device it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub path: PathBuf,
    pub location: DeviceLocation,
}

/// How the orchestrator finds device nodes.
pub trait DeviceSelection: Send + Sync {
    /// Nodes of `class` belonging to the selected modem, sorted by path.
    fn find_devices(&self, class: DeviceClass) -> Result<Vec<DeviceCandidate>>;

    /// Wait until a node of `class` shows up at `location`.
    fn wait_for_device(
        &self,
        class: DeviceClass,
        location: &DeviceLocation,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<PathBuf>;
}

/// What identifies the modem to update.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub tty: Option<PathBuf>,
    pub cdc_wdm: Option<PathBuf>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub busnum: Option<u8>,
    pub devnum: Option<u8>,
}

impl SelectionCriteria {
    fn explicit_path(&self, class: DeviceClass) -> Option<&Path> {
        match class {
            DeviceClass::Tty => self.tty.as_deref(),
            DeviceClass::CdcWdm => self.cdc_wdm.as_deref(),
        }
    }

    fn matches(&self, dev: &UsbDevice) -> bool {
        self.vid.is_none_or(|v| v == dev.vendor_id)
            && self.pid.is_none_or(|p| p == dev.product_id)
            && self.busnum.is_none_or(|b| b == dev.busnum)
            && self.devnum.is_none_or(|d| d == dev.devnum)
    }
}

/// One enumerated USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub busnum: u8,
    pub devnum: u8,
    pub sysfs_path: PathBuf,
}

type UsbLister = Box<dyn Fn() -> Result<Vec<UsbDevice>> + Send + Sync>;

/// List USB devices through `nusb`.
pub fn list_usb_devices() -> Result<Vec<UsbDevice>> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(|e| Error::DeviceNotFound(format!("couldn't list USB devices: {e}")))?;
    Ok(devices
        .map(|d| UsbDevice {
            vendor_id: d.vendor_id(),
            product_id: d.product_id(),
            busnum: d.busnum(),
            devnum: d.device_address(),
            sysfs_path: d.sysfs_path().to_path_buf(),
        })
        .collect())
}

/// sysfs + `nusb` backed [`DeviceSelection`].
pub struct SysfsSelection {
    criteria: SelectionCriteria,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    lister: UsbLister,
}

impl SysfsSelection {
    pub fn new(criteria: SelectionCriteria) -> Self {
        Self {
            criteria,
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            lister: Box::new(list_usb_devices),
        }
    }

    /// Use alternative sysfs and /dev roots.
    pub fn with_roots(mut self, sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = sysfs_root.into();
        self.dev_root = dev_root.into();
        self
    }

    /// Replace the USB enumeration.
    pub fn with_lister<F>(mut self, lister: F) -> Self
    where
        F: Fn() -> Result<Vec<UsbDevice>> + Send + Sync + 'static,
    {
        self.lister = Box::new(lister);
        self
    }

    /// USB device that owns the node `path` (e.g. `/dev/ttyUSB0`).
    fn owner_of(&self, class: DeviceClass, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::DeviceNotFound(format!("{} is not a device node", path.display())))?;
        let link = self
            .sysfs_root
            .join("class")
            .join(class.sysfs_class())
            .join(name)
            .join("device");
        let mut dir = fs::canonicalize(&link).map_err(|e| {
            Error::DeviceNotFound(format!("{}: no sysfs entry ({e})", path.display()))
        })?;
        // Interface directories sit below the USB device, which carries busnum.
        loop {
            if dir.join("busnum").is_file() {
                return Ok(dir);
            }
            if !dir.pop() || dir == self.sysfs_root {
                return Err(Error::DeviceNotFound(format!(
                    "{} is not a USB device",
                    path.display()
                )));
            }
        }
    }

    /// Node names of `class` anywhere below the USB device `dir`.
    fn children(&self, dir: &Path, class: DeviceClass) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                // sysfs is full of symlink cycles (driver, subsystem, port).
                let Ok(ft) = entry.file_type() else { continue };
                if !ft.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if class.matches_name(&name) {
                    found.push(self.dev_root.join(&name));
                } else {
                    stack.push(entry.path());
                }
            }
        }
        found.sort();
        found.dedup();
        found
    }

    fn candidates(&self, usb: &Path, class: DeviceClass) -> Vec<DeviceCandidate> {
        let location = DeviceLocation::from_sysfs(usb);
        self.children(usb, class)
            .into_iter()
            .map(|path| DeviceCandidate {
                path,
                location: location.clone(),
            })
            .collect()
    }
}

impl DeviceSelection for SysfsSelection {
    #[instrument(skip(self))]
    fn find_devices(&self, class: DeviceClass) -> Result<Vec<DeviceCandidate>> {
        if let Some(path) = self.criteria.explicit_path(class) {
            let usb = self.owner_of(class, path)?;
            return Ok(vec![DeviceCandidate {
                path: path.to_path_buf(),
                location: DeviceLocation::from_sysfs(&usb),
            }]);
        }

        // A given node of the other class pins the USB device.
        let other = match class {
            DeviceClass::Tty => DeviceClass::CdcWdm,
            DeviceClass::CdcWdm => DeviceClass::Tty,
        };
        if let Some(path) = self.criteria.explicit_path(other) {
            let usb = self.owner_of(other, path)?;
            let found = self.candidates(&usb, class);
            if found.is_empty() {
                return Err(Error::DeviceNotFound(format!(
                    "no {class} device next to {}",
                    path.display()
                )));
            }
            return Ok(found);
        }

        let matching: Vec<UsbDevice> = (self.lister)()?
            .into_iter()
            .filter(|d| self.criteria.matches(d))
            .filter(|d| !self.children(&d.sysfs_path, class).is_empty())
            .collect();
        match matching.as_slice() {
            [] => Err(Error::DeviceNotFound(format!("no USB modem with a {class} port"))),
            [dev] => {
                debug!(
                    vid = format!("{:04x}", dev.vendor_id),
                    pid = format!("{:04x}", dev.product_id),
                    bus = dev.busnum,
                    dev = dev.devnum,
                    "Selected USB device"
                );
                Ok(self.candidates(&dev.sysfs_path, class))
            }
            many => Err(Error::AmbiguousDevice(format!(
                "{} USB devices with a {class} port match, use --busnum/--devnum or an explicit path",
                many.len()
            ))),
        }
    }

    #[instrument(skip(self, location, cancel), fields(location = %location.sysfs_path.display()))]
    fn wait_for_device(
        &self,
        class: DeviceClass,
        location: &DeviceLocation,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        info!(%class, "Waiting for device");
        let start = Instant::now();
        loop {
            cancel.check()?;
            for dev in (self.lister)()? {
                if !DeviceLocation::from_sysfs(&dev.sysfs_path).matches(location) {
                    continue;
                }
                if let Some(path) = self.children(&dev.sysfs_path, class).into_iter().next() {
                    info!(path = %path.display(), elapsed_ms = start.elapsed().as_millis() as u64, "Device appeared");
                    return Ok(path);
                }
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "waiting {}s for a {class} device",
                    timeout.as_secs()
                )));
            }
            cancel.sleep(POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// Fake sysfs with one USB device `1-2` holding `nodes`.
    fn fake_usb(root: &Path, name: &str, nodes: &[&str]) -> PathBuf {
        let usb = root.join("devices/usb1").join(name);
        fs::create_dir_all(&usb).unwrap();
        fs::write(usb.join("busnum"), "1\n").unwrap();
        let intf = usb.join(format!("{name}:1.0"));
        fs::create_dir_all(&intf).unwrap();
        for node in nodes {
            let (class_dir, dir) = if node.starts_with("cdc-wdm") {
                ("usbmisc", intf.join("usbmisc").join(node))
            } else {
                ("tty", intf.join(node))
            };
            fs::create_dir_all(&dir).unwrap();
            let class = root.join("class").join(class_dir).join(node);
            fs::create_dir_all(&class).unwrap();
            symlink(&intf, class.join("device")).unwrap();
        }
        // Cycle back up, like the real driver links.
        symlink(&usb, intf.join("driver")).unwrap();
        usb
    }

    fn usb(path: &Path, devnum: u8) -> UsbDevice {
        UsbDevice {
            vendor_id: 0x1199,
            product_id: 0x9071,
            busnum: 1,
            devnum,
            sysfs_path: path.to_path_buf(),
        }
    }

    #[test]
    fn test_location_matches_peer_port() {
        let a = DeviceLocation {
            sysfs_path: "/sys/devices/usb2/2-1".into(),
            port: Some("/sys/ports/usb2-port1".into()),
            peer_port: Some("/sys/ports/usb3-port1".into()),
        };
        let b = DeviceLocation {
            sysfs_path: "/sys/devices/usb3/3-1".into(),
            port: Some("/sys/ports/usb3-port1".into()),
            peer_port: Some("/sys/ports/usb2-port1".into()),
        };
        let c = DeviceLocation {
            sysfs_path: "/sys/devices/usb3/3-2".into(),
            port: None,
            peer_port: None,
        };
        assert!(a.matches(&b));
        assert!(b.matches(&a));
        assert!(!a.matches(&c));
        assert!(c.matches(&c.clone()));
    }

    #[test]
    fn test_location_from_sysfs_links() {
        let dir = TempDir::new().unwrap();
        let usb = dir.path().join("1-2");
        let port = dir.path().join("usb1-port2");
        let peer = dir.path().join("usb2-port2");
        fs::create_dir_all(&usb).unwrap();
        fs::create_dir_all(&port).unwrap();
        fs::create_dir_all(&peer).unwrap();
        symlink(&port, usb.join("port")).unwrap();
        symlink(&peer, port.join("peer")).unwrap();

        let loc = DeviceLocation::from_sysfs(&usb);
        assert_eq!(loc.port, Some(fs::canonicalize(&port).unwrap()));
        assert_eq!(loc.peer_port, Some(fs::canonicalize(&peer).unwrap()));
    }

    #[test]
    fn test_find_by_usb_listing() {
        let dir = TempDir::new().unwrap();
        let modem = fake_usb(dir.path(), "1-2", &["ttyUSB2", "ttyUSB0", "cdc-wdm0"]);
        let hub = fake_usb(dir.path(), "1-1", &[]);
        let (m, h) = (modem.clone(), hub.clone());
        let sel = SysfsSelection::new(SelectionCriteria::default())
            .with_roots(dir.path(), "/dev")
            .with_lister(move || Ok(vec![usb(&h, 1), usb(&m, 2)]));

        let ttys = sel.find_devices(DeviceClass::Tty).unwrap();
        let paths: Vec<_> = ttys.iter().map(|c| c.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/dev/ttyUSB0"), PathBuf::from("/dev/ttyUSB2")]);
        assert_eq!(ttys[0].location.sysfs_path, modem);

        let wdm = sel.find_devices(DeviceClass::CdcWdm).unwrap();
        assert_eq!(wdm[0].path, PathBuf::from("/dev/cdc-wdm0"));
    }

    #[test]
    fn test_find_not_found_and_ambiguous() {
        let dir = TempDir::new().unwrap();
        let a = fake_usb(dir.path(), "1-2", &["ttyUSB0"]);
        let b = fake_usb(dir.path(), "1-3", &["ttyUSB1"]);
        let (a2, b2) = (a.clone(), b.clone());
        let sel = SysfsSelection::new(SelectionCriteria::default())
            .with_roots(dir.path(), "/dev")
            .with_lister(move || Ok(vec![usb(&a2, 2), usb(&b2, 3)]));
        let err = sel.find_devices(DeviceClass::Tty).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AmbiguousDevice);
        let err = sel.find_devices(DeviceClass::CdcWdm).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DeviceNotFound);

        let sel = SysfsSelection::new(SelectionCriteria {
            devnum: Some(3),
            ..Default::default()
        })
        .with_roots(dir.path(), "/dev")
        .with_lister(move || Ok(vec![usb(&a, 2), usb(&b, 3)]));
        let ttys = sel.find_devices(DeviceClass::Tty).unwrap();
        assert_eq!(ttys[0].path, PathBuf::from("/dev/ttyUSB1"));
    }

    #[test]
    fn test_explicit_path_resolves_owner() {
        let dir = TempDir::new().unwrap();
        let modem = fake_usb(dir.path(), "1-2", &["ttyUSB0", "ttyUSB1", "cdc-wdm0"]);
        let sel = SysfsSelection::new(SelectionCriteria {
            cdc_wdm: Some("/dev/cdc-wdm0".into()),
            ..Default::default()
        })
        .with_roots(dir.path(), "/dev")
        .with_lister(|| Ok(Vec::new()));

        let wdm = sel.find_devices(DeviceClass::CdcWdm).unwrap();
        assert_eq!(wdm.len(), 1);
        assert_eq!(wdm[0].location.sysfs_path, fs::canonicalize(&modem).unwrap());

        // Ttys next to the given control port.
        let ttys = sel.find_devices(DeviceClass::Tty).unwrap();
        assert_eq!(ttys.len(), 2);
    }

    #[test]
    fn test_wait_for_device() {
        let dir = TempDir::new().unwrap();
        let modem = fake_usb(dir.path(), "1-2", &["ttyUSB0"]);
        let m = modem.clone();
        let sel = SysfsSelection::new(SelectionCriteria::default())
            .with_roots(dir.path(), "/dev")
            .with_lister(move || Ok(vec![usb(&m, 5)]));
        let loc = DeviceLocation::from_sysfs(&modem);

        let path = sel
            .wait_for_device(DeviceClass::Tty, &loc, Duration::from_secs(1), &CancelToken::new())
            .unwrap();
        assert_eq!(path, PathBuf::from("/dev/ttyUSB0"));

        let start = Instant::now();
        let err = sel
            .wait_for_device(DeviceClass::CdcWdm, &loc, Duration::from_millis(200), &CancelToken::new())
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
