//! Write-safety guard
//!
//! Write tests destroy data. Unless forced, they only run against devices
//! whose SCSI model string says they are the kernel's `scsi_debug` RAM disk.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Where sysfs is mounted.
pub const SYSFS_ROOT: &str = "/sys";

/// Model string reported by `scsi_debug` devices.
pub const SAFE_MODEL: &str = "scsi_debug";

/// Vendor and model as reported by sysfs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// `device/vendor`, trimmed.
    pub vendor: Option<String>,
    /// `device/model`, trimmed.
    pub model: Option<String>,
}

/// A write test was refused.
#[derive(Debug, Error)]
#[error("refusing to write to {} ({}); use --force to override", device.display(), describe(found.as_deref()))]
pub struct Refusal {
    /// Device that was refused.
    pub device: PathBuf,
    /// What was found instead of `scsi_debug`.
    pub found: Option<String>,
}

fn describe(found: Option<&str>) -> String {
    match found {
        Some(model) => format!("model '{model}' is not {SAFE_MODEL}"),
        None => "cannot read its model from sysfs".to_string(),
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Look up the sysfs identity of an sg node such as `/dev/sg3`.
pub fn identify(sysfs: &Path, device: &Path) -> DeviceIdentity {
    let Some(name) = device.file_name() else {
        return DeviceIdentity::default();
    };
    let dir = sysfs
        .join("class/scsi_generic")
        .join(name)
        .join("device");
    DeviceIdentity {
        vendor: read_attr(&dir, "vendor"),
        model: read_attr(&dir, "model"),
    }
}

/// Allow a write test on `device` only if it is a `scsi_debug` disk.
pub fn check_write_target(sysfs: &Path, device: &Path) -> Result<DeviceIdentity, Refusal> {
    let id = identify(sysfs, device);
    debug!(device = %device.display(), vendor = ?id.vendor, model = ?id.model, "write target");
    if id.model.as_deref() == Some(SAFE_MODEL) {
        Ok(id)
    } else {
        Err(Refusal {
            device: device.to_path_buf(),
            found: id.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(name: &str, vendor: &str, model: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        let dev = dir.path().join("class/scsi_generic").join(name).join("device");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("vendor"), vendor).unwrap();
        fs::write(dev.join("model"), model).unwrap();
        dir
    }

    #[test]
    fn test_scsi_debug_allowed() {
        // sysfs pads both fields with spaces
        let sys = fake_sysfs("sg4", "Linux   \n", "scsi_debug      \n");
        let id = check_write_target(sys.path(), Path::new("/dev/sg4")).unwrap();
        assert_eq!(id.vendor.as_deref(), Some("Linux"));
        assert_eq!(id.model.as_deref(), Some("scsi_debug"));
    }

    #[test]
    fn test_real_disk_refused() {
        let sys = fake_sysfs("sg0", "ATA", "Samsung SSD 870\n");
        let err = check_write_target(sys.path(), Path::new("/dev/sg0")).unwrap_err();
        assert_eq!(err.found.as_deref(), Some("Samsung SSD 870"));
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn test_unknown_device_refused() {
        let sys = fake_sysfs("sg0", "Linux", "scsi_debug");
        let err = check_write_target(sys.path(), Path::new("/dev/sg9")).unwrap_err();
        assert!(err.found.is_none());
        assert!(err.to_string().contains("/dev/sg9"));
    }
}
