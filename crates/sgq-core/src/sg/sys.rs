//! Raw SCSI-generic kernel interface definitions
//!
//! Port of the parts of `include/scsi/sg.h` and `include/uapi/linux/bsg.h`
//! used by the asynchronous engine: the v3 `sg_io_hdr`, the v4 `sg_io_v4`,
//! the v4 driver's `sg_extended_info`, and the ioctl request numbers that
//! go with them.
//!
//! The v3 header carries real pointers; the v4 header carries addresses as
//! `u64`. Both layouts are checked against the kernel sizes in the tests.

use std::mem::size_of;

// ============================================================================
// ioctl encoding helpers
// ============================================================================

/// The sg driver's ioctl "type" byte.
const SG_IOCTL_MAGIC: u32 = 0x22;

const fn _iowr(ty: u32, nr: u32, sz: usize) -> u32 {
    (3 << 30) | ((sz as u32) << 16) | (ty << 8) | nr
}

// ============================================================================
// Legacy (v3) ioctls - plain numbers with an int argument
// ============================================================================

/// Read the pre-allocated (reserved) buffer size, in bytes.
pub const SG_GET_RESERVED_SIZE: u32 = 0x2272;
/// Request a new reserved buffer size, in bytes.
pub const SG_SET_RESERVED_SIZE: u32 = 0x2275;
/// When set, `read()` only returns the request whose pack_id matches.
pub const SG_SET_FORCE_PACK_ID: u32 = 0x227b;
/// Number of completed requests waiting to be read.
pub const SG_GET_NUM_WAITING: u32 = 0x227d;
/// Driver version as a decimal number, e.g. 30536 or 40045.
pub const SG_GET_VERSION_NUM: u32 = 0x2282;

// ============================================================================
// Extended (v4) ioctls
// ============================================================================

const SG_IOSUBMIT_NR: u32 = 0x41;
const SG_IORECEIVE_NR: u32 = 0x42;
const SG_SET_GET_EXTENDED_NR: u32 = 0x51;

/// Submit one `sg_io_v4` request without waiting for it.
pub const SG_IOSUBMIT: u32 = _iowr(SG_IOCTL_MAGIC, SG_IOSUBMIT_NR, size_of::<SgIoV4>());
/// Fetch one completed `sg_io_v4` request.
pub const SG_IORECEIVE: u32 = _iowr(SG_IOCTL_MAGIC, SG_IORECEIVE_NR, size_of::<SgIoV4>());
/// Read and/or write per-fd extended settings.
pub const SG_SET_GET_EXTENDED: u32 = _iowr(
    SG_IOCTL_MAGIC,
    SG_SET_GET_EXTENDED_NR,
    size_of::<SgExtendedInfo>(),
);

// ============================================================================
// Header constants
// ============================================================================

/// `interface_id` of a v3 header.
pub const SG_INTERFACE_ID_ORIG: i32 = b'S' as i32;
/// `guard` of a v4 header.
pub const SG_V4_GUARD: i32 = b'Q' as i32;
/// `protocol` value for SCSI.
pub const BSG_PROTOCOL_SCSI: u32 = 0;
/// `subprotocol` value for a SCSI command.
pub const BSG_SUB_PROTOCOL_SCSI_CMD: u32 = 0;

pub const SG_DXFER_NONE: i32 = -1;
pub const SG_DXFER_TO_DEV: i32 = -2;
pub const SG_DXFER_FROM_DEV: i32 = -3;

// Per-command flags (shared by v3 `flags` and v4 `flags`)
pub const SG_FLAG_DIRECT_IO: u32 = 0x1;
pub const SG_FLAG_MMAP_IO: u32 = 0x4;
pub const SG_FLAG_Q_AT_TAIL: u32 = 0x10;
pub const SG_FLAG_Q_AT_HEAD: u32 = 0x20;
pub const SG_FLAG_NO_DXFER: u32 = 0x10000;

// sg_extended_info masks
pub const SG_SEIM_CTL_FLAGS: u32 = 0x1;
pub const SG_SEIM_READ_VAL: u32 = 0x2;
pub const SG_SEIM_RESERVED_SIZE: u32 = 0x4;

// sg_extended_info control flags
pub const SG_CTL_FLAGM_TIME_IN_NS: u32 = 0x1;
pub const SG_CTL_FLAGM_TAG_FOR_PACK_ID: u32 = 0x2;
pub const SG_CTL_FLAGM_Q_TAIL: u32 = 0x10;
pub const SG_CTL_FLAGM_NO_DURATION: u32 = 0x400;
pub const SG_CTL_FLAGM_MORE_ASYNC: u32 = 0x800;
pub const SG_CTL_FLAGM_EXCL_WAITQ: u32 = 0x1000;

// Status bytes
pub const SAM_STAT_GOOD: u8 = 0x00;
pub const SAM_STAT_CHECK_CONDITION: u8 = 0x02;
pub const SAM_STAT_BUSY: u8 = 0x08;
pub const SAM_STAT_TASK_SET_FULL: u8 = 0x28;
pub const DID_OK: u16 = 0x00;
pub const DRIVER_OK: u16 = 0x00;
/// Set in `driver_status` when sense data was written; not an error on its own.
pub const DRIVER_SENSE: u16 = 0x08;

// ============================================================================
// Versions and sizes
// ============================================================================

/// Oldest driver that supports asynchronous v3 write()/read().
pub const SG_MIN_VERSION: i32 = 30000;
/// First driver generation with SG_IOSUBMIT/SG_IORECEIVE.
pub const SG_V4_VERSION: i32 = 40000;
/// Sense buffer handed to the driver with every command.
pub const SENSE_BUFF_LEN: usize = 32;
/// Default per-command timeout.
pub const DEF_TIMEOUT_MS: u32 = 20_000;

// ============================================================================
// Kernel Structures
// ============================================================================

/// v3 request/response header - matches kernel `sg_io_hdr_t` (88 bytes on LP64)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SgIoHdr {
    pub interface_id: i32,
    pub dxfer_direction: i32,
    pub cmd_len: u8,
    pub mx_sb_len: u8,
    pub iovec_count: u16,
    pub dxfer_len: u32,
    pub dxferp: *mut libc::c_void,
    pub cmdp: *const u8,
    pub sbp: *mut u8,
    pub timeout: u32,
    pub flags: u32,
    pub pack_id: i32,
    pub usr_ptr: *mut libc::c_void,
    pub status: u8,
    pub masked_status: u8,
    pub msg_status: u8,
    pub sb_len_wr: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub resid: i32,
    pub duration: u32,
    pub info: u32,
}

impl Default for SgIoHdr {
    fn default() -> Self {
        Self {
            interface_id: SG_INTERFACE_ID_ORIG,
            dxfer_direction: SG_DXFER_NONE,
            cmd_len: 0,
            mx_sb_len: 0,
            iovec_count: 0,
            dxfer_len: 0,
            dxferp: std::ptr::null_mut(),
            cmdp: std::ptr::null(),
            sbp: std::ptr::null_mut(),
            timeout: DEF_TIMEOUT_MS,
            flags: 0,
            pack_id: -1,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        }
    }
}

/// v4 request/response header - matches kernel `struct sg_io_v4` (160 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SgIoV4 {
    pub guard: i32,
    pub protocol: u32,
    pub subprotocol: u32,
    pub request_len: u32,
    pub request: u64,
    pub request_tag: u64,
    pub request_attr: u32,
    pub request_priority: u32,
    /// The sg driver carries pack_id here.
    pub request_extra: u32,
    pub max_response_len: u32,
    pub response: u64,
    pub dout_iovec_count: u32,
    pub dout_xfer_len: u32,
    pub din_iovec_count: u32,
    pub din_xfer_len: u32,
    pub dout_xferp: u64,
    pub din_xferp: u64,
    pub timeout: u32,
    pub flags: u32,
    pub usr_ptr: u64,
    pub spare_in: u32,
    pub driver_status: u32,
    pub transport_status: u32,
    pub device_status: u32,
    pub retry_delay: u32,
    pub info: u32,
    pub duration: u32,
    pub response_len: u32,
    pub din_resid: i32,
    pub dout_resid: i32,
    pub generated_tag: u64,
    pub spare_out: u32,
    pub padding: u32,
}

impl Default for SgIoV4 {
    fn default() -> Self {
        Self {
            guard: SG_V4_GUARD,
            protocol: BSG_PROTOCOL_SCSI,
            subprotocol: BSG_SUB_PROTOCOL_SCSI_CMD,
            request_len: 0,
            request: 0,
            request_tag: 0,
            request_attr: 0,
            request_priority: 0,
            request_extra: 0,
            max_response_len: 0,
            response: 0,
            dout_iovec_count: 0,
            dout_xfer_len: 0,
            din_iovec_count: 0,
            din_xfer_len: 0,
            dout_xferp: 0,
            din_xferp: 0,
            timeout: DEF_TIMEOUT_MS,
            flags: 0,
            usr_ptr: 0,
            spare_in: 0,
            driver_status: 0,
            transport_status: 0,
            device_status: 0,
            retry_delay: 0,
            info: 0,
            duration: 0,
            response_len: 0,
            din_resid: 0,
            dout_resid: 0,
            generated_tag: 0,
            spare_out: 0,
            padding: 0,
        }
    }
}

/// Per-fd extended settings - matches kernel `struct sg_extended_info` (96 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SgExtendedInfo {
    pub sei_wr_mask: u32,
    pub sei_rd_mask: u32,
    pub ctl_flags_wr_mask: u32,
    pub ctl_flags_rd_mask: u32,
    pub ctl_flags: u32,
    pub read_value: u32,
    pub reserved_sz: u32,
    pub tot_fd_thresh: u32,
    pub minor_index: u32,
    pub share_fd: u32,
    pub sgat_elem_sz: u32,
    pub pad_to_96: [u8; 52],
}

impl Default for SgExtendedInfo {
    fn default() -> Self {
        Self {
            sei_wr_mask: 0,
            sei_rd_mask: 0,
            ctl_flags_wr_mask: 0,
            ctl_flags_rd_mask: 0,
            ctl_flags: 0,
            read_value: 0,
            reserved_sz: 0,
            tot_fd_thresh: 0,
            minor_index: 0,
            share_fd: 0,
            sgat_elem_sz: 0,
            pad_to_96: [0; 52],
        }
    }
}

impl SgExtendedInfo {
    /// Build a request that sets `flags` on and reads them back.
    pub fn set_ctl_flags(flags: u32) -> Self {
        Self {
            sei_wr_mask: SG_SEIM_CTL_FLAGS,
            sei_rd_mask: SG_SEIM_CTL_FLAGS,
            ctl_flags_wr_mask: flags,
            ctl_flags_rd_mask: flags,
            ctl_flags: flags,
            ..Default::default()
        }
    }
}
