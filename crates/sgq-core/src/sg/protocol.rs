//! Protocol generations
//!
//! The worker loop only sees [`SgProtocol`]. A session picks one
//! implementation at open time and keeps it for its lifetime.

use crate::cdb::Direction;
use crate::sg::shim::SgDevice;
use crate::sg::sys::*;
use crate::sg::Generation;
use std::io;

/// One command as handed to the driver.
///
/// `data` and `sense` must stay valid until the matching completion is
/// received; `cdb` only until `submit` returns.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    /// Encoded CDB.
    pub cdb: &'a [u8],
    /// Correlation id.
    pub pack_id: i32,
    /// Data direction.
    pub direction: Direction,
    /// Data buffer, null for no-data commands and mmap transfers.
    pub data: *mut u8,
    /// Transfer length in bytes.
    pub xfer_len: u32,
    /// Sense buffer.
    pub sense: *mut u8,
    /// Sense buffer capacity.
    pub sense_len: u8,
    /// `SG_FLAG_*` bits.
    pub flags: u32,
    /// Command timeout in milliseconds.
    pub timeout_ms: u32,
}

/// Driver response fields common to both generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawCompletion {
    /// Correlation id of the request that completed.
    pub pack_id: i32,
    /// SCSI status byte.
    pub status: u8,
    /// Host adapter status.
    pub host_status: u16,
    /// Driver status.
    pub driver_status: u16,
    /// Bytes of sense written.
    pub sense_len: u8,
    /// Driver-measured duration (milliseconds, or nanoseconds with `TIME_IN_NS`).
    pub duration: u32,
    /// Residual byte count.
    pub resid: i32,
}

/// Submit/receive encoding for one protocol generation.
pub trait SgProtocol: Send + Sync {
    /// Which generation this is.
    fn generation(&self) -> Generation;

    /// Queue `req` on `dev` without waiting.
    fn submit(&self, dev: &dyn SgDevice, req: &Request<'_>) -> io::Result<()>;

    /// Fetch one completion; `wanted` selects a specific pack_id when the
    /// driver was told to force pack_id matching.
    fn receive(&self, dev: &dyn SgDevice, wanted: Option<i32>) -> io::Result<RawCompletion>;
}

/// v3 `sg_io_hdr` through `write()`/`read()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyProtocol;

/// v4 `sg_io_v4` through `SG_IOSUBMIT`/`SG_IORECEIVE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtendedProtocol;

static LEGACY: LegacyProtocol = LegacyProtocol;
static EXTENDED: ExtendedProtocol = ExtendedProtocol;

/// The protocol implementation for `generation`.
pub fn protocol_for(generation: Generation) -> &'static dyn SgProtocol {
    match generation {
        Generation::Legacy => &LEGACY,
        Generation::Extended => &EXTENDED,
    }
}

fn dxfer_direction(direction: Direction) -> i32 {
    match direction {
        Direction::None => SG_DXFER_NONE,
        Direction::ToDevice => SG_DXFER_TO_DEV,
        Direction::FromDevice => SG_DXFER_FROM_DEV,
    }
}

impl LegacyProtocol {
    /// Build the v3 header for `req`.
    pub fn encode(req: &Request<'_>) -> SgIoHdr {
        let xfer = req.direction != Direction::None;
        SgIoHdr {
            dxfer_direction: dxfer_direction(req.direction),
            cmd_len: req.cdb.len() as u8,
            mx_sb_len: req.sense_len,
            dxfer_len: if xfer { req.xfer_len } else { 0 },
            dxferp: if xfer { req.data.cast() } else { std::ptr::null_mut() },
            cmdp: req.cdb.as_ptr(),
            sbp: req.sense,
            timeout: req.timeout_ms,
            flags: req.flags,
            pack_id: req.pack_id,
            ..Default::default()
        }
    }
}

impl SgProtocol for LegacyProtocol {
    fn generation(&self) -> Generation {
        Generation::Legacy
    }

    fn submit(&self, dev: &dyn SgDevice, req: &Request<'_>) -> io::Result<()> {
        dev.write_v3(&Self::encode(req))
    }

    fn receive(&self, dev: &dyn SgDevice, wanted: Option<i32>) -> io::Result<RawCompletion> {
        let mut hdr = SgIoHdr {
            pack_id: wanted.unwrap_or(-1),
            ..Default::default()
        };
        dev.read_v3(&mut hdr)?;
        Ok(RawCompletion {
            pack_id: hdr.pack_id,
            status: hdr.status,
            host_status: hdr.host_status,
            driver_status: hdr.driver_status,
            sense_len: hdr.sb_len_wr,
            duration: hdr.duration,
            resid: hdr.resid,
        })
    }
}

impl ExtendedProtocol {
    /// Build the v4 header for `req`.
    pub fn encode(req: &Request<'_>) -> SgIoV4 {
        let mut hdr = SgIoV4 {
            request_len: req.cdb.len() as u32,
            request: req.cdb.as_ptr() as u64,
            request_extra: req.pack_id as u32,
            max_response_len: u32::from(req.sense_len),
            response: req.sense as u64,
            timeout: req.timeout_ms,
            flags: req.flags,
            ..Default::default()
        };
        match req.direction {
            Direction::None => {}
            Direction::ToDevice => {
                hdr.dout_xfer_len = req.xfer_len;
                hdr.dout_xferp = req.data as u64;
            }
            Direction::FromDevice => {
                hdr.din_xfer_len = req.xfer_len;
                hdr.din_xferp = req.data as u64;
            }
        }
        hdr
    }
}

impl SgProtocol for ExtendedProtocol {
    fn generation(&self) -> Generation {
        Generation::Extended
    }

    fn submit(&self, dev: &dyn SgDevice, req: &Request<'_>) -> io::Result<()> {
        let mut hdr = Self::encode(req);
        dev.submit_v4(&mut hdr)
    }

    fn receive(&self, dev: &dyn SgDevice, wanted: Option<i32>) -> io::Result<RawCompletion> {
        let mut hdr = SgIoV4 {
            request_extra: wanted.unwrap_or(-1) as u32,
            ..Default::default()
        };
        dev.receive_v4(&mut hdr)?;
        Ok(RawCompletion {
            pack_id: hdr.request_extra as i32,
            status: hdr.device_status as u8,
            host_status: hdr.transport_status as u16,
            driver_status: hdr.driver_status as u16,
            sense_len: hdr.response_len.min(u32::from(u8::MAX)) as u8,
            duration: hdr.duration,
            resid: hdr.din_resid,
        })
    }
}
