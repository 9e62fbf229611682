//! Device shims for testability
//!
//! Every OS call the engine makes against an opened sg device goes through
//! [`SgDevice`], so the session, submission and completion logic can run
//! against [`super::mem::MemDevice`] without a kernel.
//!
//! Architecture:
//! - `SgDevice`: one opened device handle (ioctls, read/write, poll, mmap)
//! - `SysSgDevice`: production implementation on an `O_NONBLOCK` fd
//! - `DeviceOpener`: opens one handle per worker thread

use crate::sg::sys::*;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::libc;
use nix::sys::stat::Mode;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::Duration;

// ============================================================================
// Device Shim Trait
// ============================================================================

/// One opened sg device handle.
///
/// Calls never block: submissions and receives report `EAGAIN` instead.
pub trait SgDevice: Send {
    /// `SG_GET_VERSION_NUM`
    fn version_num(&self) -> io::Result<i32>;

    /// `SG_GET_NUM_WAITING`: completed requests ready to be received.
    fn num_waiting(&self) -> io::Result<i32>;

    /// `SG_GET_RESERVED_SIZE`
    fn reserved_size(&self) -> io::Result<i32>;

    /// `SG_SET_RESERVED_SIZE`
    fn set_reserved_size(&self, size: i32) -> io::Result<()>;

    /// `SG_SET_GET_EXTENDED`; the driver writes back the read masks.
    fn set_get_extended(&self, info: &mut SgExtendedInfo) -> io::Result<()>;

    /// `SG_SET_FORCE_PACK_ID`
    fn set_force_pack_id(&self, on: bool) -> io::Result<()>;

    /// Queue a v3 request with `write()`.
    fn write_v3(&self, hdr: &SgIoHdr) -> io::Result<()>;

    /// Fetch a v3 response with `read()`.
    fn read_v3(&self, hdr: &mut SgIoHdr) -> io::Result<()>;

    /// `SG_IOSUBMIT`
    fn submit_v4(&self, hdr: &mut SgIoV4) -> io::Result<()>;

    /// `SG_IORECEIVE`
    fn receive_v4(&self, hdr: &mut SgIoV4) -> io::Result<()>;

    /// Wait up to `timeout` for a completion to become readable.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Map the reserved buffer for mmap transfers.
    fn map_reserved(&self, len: usize) -> io::Result<ReservedMapping>;
}

/// Opens device handles for the engine.
pub trait DeviceOpener: Send + Sync {
    /// Open `path` for worker `worker`, or for main-thread setup when `None`.
    fn open(&self, path: &Path, worker: Option<usize>) -> io::Result<Box<dyn SgDevice>>;
}

/// A mapping of the driver's reserved buffer.
#[derive(Debug)]
pub struct ReservedMapping {
    ptr: NonNull<u8>,
    len: usize,
    owned_by_kernel: bool,
}

// SAFETY: the mapping is only touched by the worker that owns the session.
unsafe impl Send for ReservedMapping {}

impl ReservedMapping {
    /// Wrap memory that outlives the mapping and needs no unmap.
    ///
    /// # Safety
    /// `ptr` must be valid for `len` bytes for the life of the mapping.
    pub unsafe fn borrowed(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            owned_by_kernel: false,
        }
    }

    /// Start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapping length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length mapping.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ReservedMapping {
    fn drop(&mut self) {
        if self.owned_by_kernel {
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.len);
            }
        }
    }
}

// ============================================================================
// Real Device Implementation
// ============================================================================

/// Production device: a non-blocking fd on `/dev/sgN`.
#[derive(Debug)]
pub struct SysSgDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl SysSgDevice {
    /// Open `path` read-write and non-blocking.
    pub fn open(path: &Path) -> io::Result<Self> {
        let flags = OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC;
        let fd = fcntl::open(path, flags, Mode::empty()).map_err(io::Error::from)?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            path: path.to_path_buf(),
        })
    }

    /// Device path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl_ptr<T>(&self, request: u32, arg: *mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, arg) };
        Errno::result(ret).map(drop).map_err(io::Error::from)
    }

    fn ioctl_get_int(&self, request: u32) -> io::Result<i32> {
        let mut val: libc::c_int = 0;
        self.ioctl_ptr(request, &mut val)?;
        Ok(val)
    }

    fn ioctl_set_int(&self, request: u32, val: i32) -> io::Result<()> {
        let mut val: libc::c_int = val;
        self.ioctl_ptr(request, &mut val)
    }
}

impl SgDevice for SysSgDevice {
    fn version_num(&self) -> io::Result<i32> {
        self.ioctl_get_int(SG_GET_VERSION_NUM)
    }

    fn num_waiting(&self) -> io::Result<i32> {
        self.ioctl_get_int(SG_GET_NUM_WAITING)
    }

    fn reserved_size(&self) -> io::Result<i32> {
        self.ioctl_get_int(SG_GET_RESERVED_SIZE)
    }

    fn set_reserved_size(&self, size: i32) -> io::Result<()> {
        self.ioctl_set_int(SG_SET_RESERVED_SIZE, size)
    }

    fn set_get_extended(&self, info: &mut SgExtendedInfo) -> io::Result<()> {
        self.ioctl_ptr(SG_SET_GET_EXTENDED, info as *mut SgExtendedInfo)
    }

    fn set_force_pack_id(&self, on: bool) -> io::Result<()> {
        self.ioctl_set_int(SG_SET_FORCE_PACK_ID, i32::from(on))
    }

    fn write_v3(&self, hdr: &SgIoHdr) -> io::Result<()> {
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (hdr as *const SgIoHdr).cast(),
                size_of::<SgIoHdr>(),
            )
        };
        Errno::result(ret).map(drop).map_err(io::Error::from)
    }

    fn read_v3(&self, hdr: &mut SgIoHdr) -> io::Result<()> {
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (hdr as *mut SgIoHdr).cast(),
                size_of::<SgIoHdr>(),
            )
        };
        Errno::result(ret).map(drop).map_err(io::Error::from)
    }

    fn submit_v4(&self, hdr: &mut SgIoV4) -> io::Result<()> {
        self.ioctl_ptr(SG_IOSUBMIT, hdr as *mut SgIoV4)
    }

    fn receive_v4(&self, hdr: &mut SgIoV4) -> io::Result<()> {
        self.ioctl_ptr(SG_IORECEIVE, hdr as *mut SgIoV4)
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        match Errno::result(ret) {
            Ok(n) => Ok(n > 0 && (pfd.revents & libc::POLLIN) != 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn map_reserved(&self, len: usize) -> io::Result<ReservedMapping> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(ReservedMapping {
            ptr,
            len,
            owned_by_kernel: true,
        })
    }
}

/// Opens real `/dev/sgN` nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysOpener;

impl DeviceOpener for SysOpener {
    fn open(&self, path: &Path, _worker: Option<usize>) -> io::Result<Box<dyn SgDevice>> {
        Ok(Box::new(SysSgDevice::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = SysSgDevice::open(Path::new("/nonexistent/sg99")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_open_rejects_nul_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let path = Path::new(OsStr::from_bytes(b"/dev/sg\0bad"));
        let err = SysSgDevice::open(path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_ioctl_on_regular_file_fails() {
        // /dev/null accepts the open but rejects sg ioctls
        let dev = SysSgDevice::open(Path::new("/dev/null")).unwrap();
        assert!(dev.version_num().is_err());
        assert_eq!(dev.path(), Path::new("/dev/null"));
    }

    #[test]
    fn test_borrowed_mapping() {
        let mut backing = vec![0u8; 64];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let map = unsafe { ReservedMapping::borrowed(ptr, backing.len()) };
        assert_eq!(map.len(), 64);
        assert!(!map.is_empty());
        assert_eq!(map.as_ptr(), backing.as_mut_ptr());
        drop(map);
    }

    #[test]
    fn test_sys_opener_is_object_safe() {
        let opener: Box<dyn DeviceOpener> = Box::new(SysOpener);
        assert!(opener.open(Path::new("/nonexistent/sg0"), None).is_err());
    }
}
