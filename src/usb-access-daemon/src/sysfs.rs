//! Signature partition discovery through sysfs.
//!
//! Scans `<sys>/class/block/*/uevent` for a partition whose `PARTNAME` is
//! `USB_SIG`, then walks up the resolved device path until it finds the USB
//! device node carrying `idVendor` and `idProduct`. A match returns
//! `<dev>/<DEVNAME>`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use usb_access_core::SignatureLocator;

/// GPT partition name of the signature partition.
pub const SIGNATURE_PARTITION_NAME: &str = "USB_SIG";

/// [`SignatureLocator`] reading the kernel's sysfs view.
#[derive(Debug, Clone)]
pub struct SysfsSignatureLocator {
    sys_root: PathBuf,
    dev_root: PathBuf,
    partition_name: String,
}

impl Default for SysfsSignatureLocator {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

/// Fields of a block device `uevent` file that matter here.
#[derive(Debug, Default, PartialEq, Eq)]
struct BlockUevent {
    devname: Option<String>,
    partname: Option<String>,
}

fn parse_uevent(contents: &str) -> BlockUevent {
    let mut uevent = BlockUevent::default();
    for line in contents.lines() {
        match line.split_once('=') {
            Some(("DEVNAME", value)) => uevent.devname = Some(value.trim().to_string()),
            Some(("PARTNAME", value)) => uevent.partname = Some(value.trim().to_string()),
            _ => {},
        }
    }
    uevent
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
}

impl SysfsSignatureLocator {
    /// Locator over custom sysfs and devfs roots.
    pub fn new(sys_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
            partition_name: SIGNATURE_PARTITION_NAME.to_string(),
        }
    }

    // Nearest ancestor of `device` that has USB ids, stopping at the sysfs root.
    fn usb_ids(&self, device: &Path) -> Option<(String, String)> {
        let mut current = device.parent();
        while let Some(dir) = current {
            if !dir.starts_with(&self.sys_root) {
                break;
            }
            if let (Some(vendor), Some(product)) =
                (read_attr(dir, "idVendor"), read_attr(dir, "idProduct"))
            {
                return Some((vendor, product));
            }
            current = dir.parent();
        }
        None
    }
}

impl SignatureLocator for SysfsSignatureLocator {
    fn locate(&self, vendor: &str, product: &str) -> Option<PathBuf> {
        let class_dir = self.sys_root.join("class").join("block");
        let entries = match fs::read_dir(&class_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %class_dir.display(), error = %e, "Sysfs: cannot list block devices");
                return None;
            },
        };

        for entry in entries.flatten() {
            let Ok(contents) = fs::read_to_string(entry.path().join("uevent")) else {
                continue;
            };
            let uevent = parse_uevent(&contents);
            if uevent.partname.as_deref() != Some(self.partition_name.as_str()) {
                continue;
            }
            let Some(devname) = uevent.devname else {
                continue;
            };
            let Ok(real) = fs::canonicalize(entry.path()) else {
                continue;
            };
            let Some((found_vendor, found_product)) = self.usb_ids(&real) else {
                trace!(devname = %devname, "Sysfs: signature partition not on a USB device");
                continue;
            };
            if found_vendor.eq_ignore_ascii_case(vendor) && found_product.eq_ignore_ascii_case(product)
            {
                let path = self.dev_root.join(&devname);
                debug!(devname = %devname, path = %path.display(), "Sysfs: signature partition found");
                return Some(path);
            }
            trace!(
                devname = %devname,
                vendor = %found_vendor,
                product = %found_product,
                "Sysfs: signature partition belongs to another device"
            );
        }
        None
    }
}
