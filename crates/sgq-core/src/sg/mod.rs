//! SCSI-generic driver interface
//!
//! - `sys`: `#[repr(C)]` kernel structures and ioctl numbers
//! - `shim`: the `SgDevice` trait and the real file-descriptor backed device
//! - `mem`: an in-memory device used by tests, benchmarks and dry runs
//! - `protocol`: the legacy (v3) and extended (v4) submit/receive encodings

pub mod mem;
pub mod protocol;
pub mod shim;
#[allow(missing_docs)]
pub mod sys;

use serde::Serialize;
use std::fmt;

pub use mem::{FaultPlan, MemDevice, MemDisk, MemOpener};
pub use protocol::{protocol_for, RawCompletion, Request, SgProtocol};
pub use shim::{DeviceOpener, SgDevice, SysOpener, SysSgDevice};

/// Asynchronous interface generation spoken on one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// `sg_io_hdr` via `write()`/`read()` (driver 3.x and later).
    Legacy,
    /// `sg_io_v4` via `SG_IOSUBMIT`/`SG_IORECEIVE` (driver 4.x).
    Extended,
}

impl Generation {
    /// Lowest driver version offering this generation.
    pub fn min_version(self) -> i32 {
        match self {
            Self::Legacy => sys::SG_MIN_VERSION,
            Self::Extended => sys::SG_V4_VERSION,
        }
    }

    /// Newest generation a driver of `version` supports.
    pub fn best_for(version: i32) -> Self {
        if version >= sys::SG_V4_VERSION {
            Self::Extended
        } else {
            Self::Legacy
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy v3"),
            Self::Extended => f.write_str("extended v4"),
        }
    }
}

/// Render a driver version number as `major.minor.patch` (40045 -> "4.0.45").
pub fn format_version(version: i32) -> String {
    format!(
        "{}.{}.{:02}",
        version / 10_000,
        (version / 100) % 100,
        version % 100
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_selection() {
        assert_eq!(Generation::best_for(30536), Generation::Legacy);
        assert_eq!(Generation::best_for(40000), Generation::Extended);
        assert_eq!(Generation::best_for(40045), Generation::Extended);
    }

    #[test]
    fn test_generation_min_version() {
        assert_eq!(Generation::Legacy.min_version(), 30000);
        assert_eq!(Generation::Extended.min_version(), 40000);
    }

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(40045), "4.0.45");
        assert_eq!(format_version(30536), "3.5.36");
    }

    #[test]
    fn test_generation_display() {
        assert_eq!(Generation::Legacy.to_string(), "legacy v3");
        assert_eq!(Generation::Extended.to_string(), "extended v4");
    }
}
