//! In-memory sg device
//!
//! [`MemDisk`] is a RAM-backed logical unit shared by every handle opened on
//! it; [`MemDevice`] is one open handle with its own completion queue, the
//! same way each `open()` of `/dev/sgN` gets a private sg file descriptor.
//! Commands execute synchronously at submit time and sit in the handle's
//! queue until received.
//!
//! A [`FaultPlan`] scripts the errno and sense conditions the engine has to
//! survive: resource pressure, queue overflow, out-of-order completion,
//! recovered errors and medium errors.

use crate::cdb::{
    decode_rw16, Capacity, OP_READ_16, OP_SERVICE_ACTION_IN_16, OP_TEST_UNIT_READY, OP_WRITE_16,
    SA_READ_CAPACITY_16,
};
use crate::sense::{
    write_fixed_sense, SENSE_KEY_ILLEGAL_REQUEST, SENSE_KEY_MEDIUM_ERROR,
    SENSE_KEY_RECOVERED_ERROR,
};
use crate::sg::shim::{DeviceOpener, ReservedMapping, SgDevice};
use crate::sg::sys::*;
use nix::libc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Driver version reported by default (4.0.45).
pub const MEM_DEFAULT_VERSION: i32 = 40045;

/// Reserved buffer size a fresh handle starts with.
pub const MEM_DEFAULT_RESERVED: usize = 32 * 1024;

/// Largest reserved buffer a handle grants.
pub const MEM_MAX_RESERVED: usize = 16 * 1024 * 1024;

// ============================================================================
// Shared disk
// ============================================================================

/// RAM-backed logical unit.
#[derive(Debug)]
pub struct MemDisk {
    blocks: u64,
    block_size: u32,
    data: Mutex<Vec<u8>>,
    commands: AtomicU64,
    peak_queued: AtomicUsize,
}

impl MemDisk {
    /// A zero-filled disk of `blocks` x `block_size` bytes.
    pub fn new(blocks: u64, block_size: u32) -> Arc<Self> {
        let len = blocks as usize * block_size as usize;
        Arc::new(Self {
            blocks,
            block_size,
            data: Mutex::new(vec![0u8; len]),
            commands: AtomicU64::new(0),
            peak_queued: AtomicUsize::new(0),
        })
    }

    /// Capacity as READ CAPACITY(16) reports it.
    pub fn capacity(&self) -> Capacity {
        Capacity {
            blocks: self.blocks,
            block_size: self.block_size,
        }
    }

    /// Commands executed on this disk by all handles.
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Most completions ever queued on a single handle.
    pub fn peak_queued(&self) -> usize {
        self.peak_queued.load(Ordering::Relaxed)
    }

    /// Copy of one block.
    pub fn read_block(&self, lba: u64) -> Option<Vec<u8>> {
        if lba >= self.blocks {
            return None;
        }
        let bs = self.block_size as usize;
        let start = lba as usize * bs;
        Some(self.data.lock()[start..start + bs].to_vec())
    }

    /// Overwrite one block.
    pub fn write_block(&self, lba: u64, block: &[u8]) -> bool {
        let bs = self.block_size as usize;
        if lba >= self.blocks || block.len() != bs {
            return false;
        }
        let start = lba as usize * bs;
        self.data.lock()[start..start + bs].copy_from_slice(block);
        true
    }
}

// ============================================================================
// Fault plan
// ============================================================================

/// Scripted misbehaviour for one handle.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Errnos returned by successive submissions before they start succeeding.
    pub submit_errors: VecDeque<i32>,
    /// Errnos returned by successive receives before they start succeeding.
    pub receive_errors: VecDeque<i32>,
    /// Errno every receive returns, after `receive_errors` runs out.
    pub receive_always: Option<i32>,
    /// Completions the handle queues before submissions fail with `E2BIG`.
    pub queue_capacity: Option<usize>,
    /// Deliver the newest completion first.
    pub out_of_order: bool,
    /// Every k-th command completes with RECOVERED ERROR sense.
    pub recovered_every: Option<u64>,
    /// The k-th command (1-based) completes with MEDIUM ERROR sense.
    pub medium_error_at: Option<u64>,
    /// Keep the reserved buffer at its initial size.
    pub refuse_reserved: bool,
    /// Extended control flags the driver grants; all when `None`.
    pub grant_ctl_flags: Option<u32>,
}

impl FaultPlan {
    /// A plan with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next submissions with `errnos`, in order.
    pub fn submit_errors(mut self, errnos: impl IntoIterator<Item = i32>) -> Self {
        self.submit_errors.extend(errnos);
        self
    }

    /// Fail the next receives with `errnos`, in order.
    pub fn receive_errors(mut self, errnos: impl IntoIterator<Item = i32>) -> Self {
        self.receive_errors.extend(errnos);
        self
    }

    /// Fail every receive with `errno`.
    pub fn receive_always(mut self, errno: i32) -> Self {
        self.receive_always = Some(errno);
        self
    }

    /// Refuse submissions with `E2BIG` once `cap` completions are queued.
    pub fn queue_capacity(mut self, cap: usize) -> Self {
        self.queue_capacity = Some(cap);
        self
    }

    /// Complete newest-first.
    pub fn out_of_order(mut self) -> Self {
        self.out_of_order = true;
        self
    }

    /// Report RECOVERED ERROR on every `k`-th command.
    pub fn recovered_every(mut self, k: u64) -> Self {
        self.recovered_every = Some(k.max(1));
        self
    }

    /// Report MEDIUM ERROR on command number `k`.
    pub fn medium_error_at(mut self, k: u64) -> Self {
        self.medium_error_at = Some(k);
        self
    }

    /// Never grow the reserved buffer.
    pub fn refuse_reserved(mut self) -> Self {
        self.refuse_reserved = true;
        self
    }

    /// Grant only `flags` from extended control requests.
    pub fn grant_ctl_flags(mut self, flags: u32) -> Self {
        self.grant_ctl_flags = Some(flags);
        self
    }
}

// ============================================================================
// Device handle
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Done {
    pack_id: i32,
    status: u8,
    driver_status: u16,
    sense_len: u8,
    duration: u32,
    resid: i32,
}

#[derive(Debug)]
struct HandleState {
    queue: VecDeque<Done>,
    plan: FaultPlan,
    executed: u64,
    reserved: Vec<u8>,
    ctl_flags: u32,
    force_pack_id: bool,
}

/// One open handle on a [`MemDisk`].
#[derive(Debug)]
pub struct MemDevice {
    disk: Arc<MemDisk>,
    version: i32,
    state: Mutex<HandleState>,
}

/// Decoded submission shared by both header formats.
struct Submission<'a> {
    cdb: &'a [u8],
    pack_id: i32,
    data: *mut u8,
    data_len: usize,
    to_device: bool,
    sense: *mut u8,
    sense_cap: usize,
    flags: u32,
}

impl MemDevice {
    /// Open a handle with the default driver version.
    pub fn new(disk: Arc<MemDisk>) -> Self {
        Self::with_plan(disk, MEM_DEFAULT_VERSION, FaultPlan::default())
    }

    /// Open a handle reporting `version` and following `plan`.
    pub fn with_plan(disk: Arc<MemDisk>, version: i32, plan: FaultPlan) -> Self {
        Self {
            disk,
            version,
            state: Mutex::new(HandleState {
                queue: VecDeque::new(),
                plan,
                executed: 0,
                reserved: vec![0u8; MEM_DEFAULT_RESERVED],
                ctl_flags: 0,
                force_pack_id: false,
            }),
        }
    }

    /// The disk behind this handle.
    pub fn disk(&self) -> &Arc<MemDisk> {
        &self.disk
    }

    fn enqueue(&self, sub: Submission<'_>) -> io::Result<()> {
        let mut st = self.state.lock();
        if let Some(errno) = st.plan.submit_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if sub.cdb.is_empty() || sub.cdb.len() > 16 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if let Some(cap) = st.plan.queue_capacity {
            if st.queue.len() >= cap {
                return Err(io::Error::from_raw_os_error(libc::E2BIG));
            }
        }
        let done = self.execute(&mut st, &sub);
        st.queue.push_back(done);
        self.disk
            .peak_queued
            .fetch_max(st.queue.len(), Ordering::Relaxed);
        Ok(())
    }

    fn execute(&self, st: &mut HandleState, sub: &Submission<'_>) -> Done {
        st.executed += 1;
        let n = st.executed;
        self.disk.commands.fetch_add(1, Ordering::Relaxed);

        let sense: &mut [u8] = if sub.sense.is_null() || sub.sense_cap == 0 {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(sub.sense, sub.sense_cap) }
        };

        let mut result = match sub.cdb[0] {
            _ if st.plan.medium_error_at == Some(n) => {
                Err((SENSE_KEY_MEDIUM_ERROR, 0x11, 0x00))
            }
            OP_TEST_UNIT_READY => Ok(0),
            OP_READ_16 | OP_WRITE_16 => self.transfer(st, sub),
            OP_SERVICE_ACTION_IN_16 if sub.cdb[1] & 0x1f == SA_READ_CAPACITY_16 => {
                if !sub.data.is_null() && !sub.to_device {
                    let out = unsafe { std::slice::from_raw_parts_mut(sub.data, sub.data_len) };
                    self.disk.capacity().encode(out);
                }
                Ok(0)
            }
            // INVALID COMMAND OPERATION CODE
            _ => Err((SENSE_KEY_ILLEGAL_REQUEST, 0x20, 0x00)),
        };

        if result.is_ok() && st.plan.recovered_every.is_some_and(|k| n % k == 0) {
            // RECOVERED DATA WITH RETRIES
            result = Err((SENSE_KEY_RECOVERED_ERROR, 0x17, 0x01));
        }

        let duration = if st.ctl_flags & SG_CTL_FLAGM_TIME_IN_NS != 0 {
            1_000 + (n % 8) as u32 * 250
        } else {
            0
        };
        match result {
            Ok(resid) => Done {
                pack_id: sub.pack_id,
                status: SAM_STAT_GOOD,
                driver_status: DRIVER_OK,
                sense_len: 0,
                duration,
                resid,
            },
            Err((key, asc, ascq)) => Done {
                pack_id: sub.pack_id,
                status: SAM_STAT_CHECK_CONDITION,
                driver_status: DRIVER_SENSE,
                sense_len: write_fixed_sense(sense, key, asc, ascq) as u8,
                duration,
                resid: 0,
            },
        }
    }

    /// READ(16)/WRITE(16) data movement; `Ok` carries the residual count.
    fn transfer(&self, st: &mut HandleState, sub: &Submission<'_>) -> Result<i32, (u8, u8, u8)> {
        // INVALID FIELD IN CDB
        let rw = decode_rw16(sub.cdb).ok_or((SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00))?;
        let end = rw.lba.checked_add(u64::from(rw.blocks));
        if !matches!(end, Some(end) if end <= self.disk.blocks) {
            // LOGICAL BLOCK ADDRESS OUT OF RANGE
            return Err((SENSE_KEY_ILLEGAL_REQUEST, 0x21, 0x00));
        }
        if sub.flags & SG_FLAG_NO_DXFER != 0 {
            return Ok(0);
        }
        let bs = self.disk.block_size as usize;
        let want = rw.blocks as usize * bs;
        let start = rw.lba as usize * bs;

        let user: &mut [u8] = if sub.flags & SG_FLAG_MMAP_IO != 0 {
            let len = st.reserved.len().min(want);
            &mut st.reserved[..len]
        } else if sub.data.is_null() {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(sub.data, sub.data_len) }
        };
        let moved = user.len().min(want);
        let mut disk = self.disk.data.lock();
        if sub.to_device {
            disk[start..start + moved].copy_from_slice(&user[..moved]);
        } else {
            user[..moved].copy_from_slice(&disk[start..start + moved]);
        }
        Ok((want - moved) as i32)
    }

    fn dequeue(&self, wanted: i32) -> io::Result<Done> {
        let mut st = self.state.lock();
        if let Some(errno) = st.plan.receive_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if let Some(errno) = st.plan.receive_always {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let done = if st.force_pack_id && wanted != -1 {
            st.queue
                .iter()
                .position(|d| d.pack_id == wanted)
                .and_then(|i| st.queue.remove(i))
        } else if st.plan.out_of_order {
            st.queue.pop_back()
        } else {
            st.queue.pop_front()
        };
        done.ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))
    }
}

impl SgDevice for MemDevice {
    fn version_num(&self) -> io::Result<i32> {
        Ok(self.version)
    }

    fn num_waiting(&self) -> io::Result<i32> {
        Ok(self.state.lock().queue.len() as i32)
    }

    fn reserved_size(&self) -> io::Result<i32> {
        Ok(self.state.lock().reserved.len() as i32)
    }

    fn set_reserved_size(&self, size: i32) -> io::Result<()> {
        if size < 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut st = self.state.lock();
        if !st.plan.refuse_reserved {
            let size = (size as usize).min(MEM_MAX_RESERVED);
            st.reserved.resize(size, 0);
        }
        Ok(())
    }

    fn set_get_extended(&self, info: &mut SgExtendedInfo) -> io::Result<()> {
        if self.version < SG_V4_VERSION {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        let mut st = self.state.lock();
        if info.sei_wr_mask & SG_SEIM_CTL_FLAGS != 0 {
            let grantable = st.plan.grant_ctl_flags.unwrap_or(u32::MAX);
            let mask = info.ctl_flags_wr_mask & grantable;
            st.ctl_flags = (st.ctl_flags & !mask) | (info.ctl_flags & mask);
        }
        if info.sei_rd_mask & SG_SEIM_CTL_FLAGS != 0 {
            info.ctl_flags = st.ctl_flags & info.ctl_flags_rd_mask;
        }
        if info.sei_rd_mask & SG_SEIM_RESERVED_SIZE != 0 {
            info.reserved_sz = st.reserved.len() as u32;
        }
        Ok(())
    }

    fn set_force_pack_id(&self, on: bool) -> io::Result<()> {
        self.state.lock().force_pack_id = on;
        Ok(())
    }

    fn write_v3(&self, hdr: &SgIoHdr) -> io::Result<()> {
        if hdr.interface_id != SG_INTERFACE_ID_ORIG || hdr.cmdp.is_null() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let cdb = unsafe { std::slice::from_raw_parts(hdr.cmdp, usize::from(hdr.cmd_len)) };
        self.enqueue(Submission {
            cdb,
            pack_id: hdr.pack_id,
            data: hdr.dxferp.cast(),
            data_len: hdr.dxfer_len as usize,
            to_device: hdr.dxfer_direction == SG_DXFER_TO_DEV,
            sense: hdr.sbp,
            sense_cap: usize::from(hdr.mx_sb_len),
            flags: hdr.flags,
        })
    }

    fn read_v3(&self, hdr: &mut SgIoHdr) -> io::Result<()> {
        let done = self.dequeue(hdr.pack_id)?;
        hdr.pack_id = done.pack_id;
        hdr.status = done.status;
        hdr.masked_status = done.status >> 1;
        hdr.host_status = DID_OK;
        hdr.driver_status = done.driver_status;
        hdr.sb_len_wr = done.sense_len;
        hdr.duration = done.duration;
        hdr.resid = done.resid;
        Ok(())
    }

    fn submit_v4(&self, hdr: &mut SgIoV4) -> io::Result<()> {
        if self.version < SG_V4_VERSION {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        if hdr.guard != SG_V4_GUARD || hdr.request == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let cdb = unsafe {
            std::slice::from_raw_parts(hdr.request as *const u8, hdr.request_len as usize)
        };
        let (data, data_len, to_device) = if hdr.dout_xfer_len > 0 {
            (hdr.dout_xferp as *mut u8, hdr.dout_xfer_len as usize, true)
        } else {
            (hdr.din_xferp as *mut u8, hdr.din_xfer_len as usize, false)
        };
        self.enqueue(Submission {
            cdb,
            pack_id: hdr.request_extra as i32,
            data,
            data_len,
            to_device,
            sense: hdr.response as *mut u8,
            sense_cap: hdr.max_response_len as usize,
            flags: hdr.flags,
        })
    }

    fn receive_v4(&self, hdr: &mut SgIoV4) -> io::Result<()> {
        if self.version < SG_V4_VERSION {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        let done = self.dequeue(hdr.request_extra as i32)?;
        hdr.request_extra = done.pack_id as u32;
        hdr.device_status = u32::from(done.status);
        hdr.transport_status = u32::from(DID_OK);
        hdr.driver_status = u32::from(done.driver_status);
        hdr.response_len = u32::from(done.sense_len);
        hdr.duration = done.duration;
        hdr.din_resid = done.resid;
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        if !self.state.lock().queue.is_empty() {
            return Ok(true);
        }
        // Completions are synchronous; an empty queue stays empty.
        std::thread::sleep(timeout.min(Duration::from_micros(50)));
        Ok(!self.state.lock().queue.is_empty())
    }

    fn map_reserved(&self, len: usize) -> io::Result<ReservedMapping> {
        let mut st = self.state.lock();
        if len == 0 || len > st.reserved.len() {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let ptr = NonNull::new(st.reserved.as_mut_ptr())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        // The reserved Vec lives as long as this handle; the session drops the
        // mapping before the device.
        Ok(unsafe { ReservedMapping::borrowed(ptr, len) })
    }
}

// ============================================================================
// Opener
// ============================================================================

/// Hands out [`MemDevice`] handles for registered paths.
#[derive(Debug, Default)]
pub struct MemOpener {
    disks: FxHashMap<PathBuf, Arc<MemDisk>>,
    plans: Mutex<FxHashMap<usize, FaultPlan>>,
    version: Option<i32>,
}

impl MemOpener {
    /// An opener with no disks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `disk` at `path`.
    pub fn with_disk(mut self, path: impl Into<PathBuf>, disk: Arc<MemDisk>) -> Self {
        self.disks.insert(path.into(), disk);
        self
    }

    /// Give worker `worker` the fault plan `plan`.
    pub fn with_plan(self, worker: usize, plan: FaultPlan) -> Self {
        self.plans.lock().insert(worker, plan);
        self
    }

    /// Report `version` from every handle.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }

    /// The disk served at `path`.
    pub fn disk(&self, path: &Path) -> Option<&Arc<MemDisk>> {
        self.disks.get(path)
    }
}

impl DeviceOpener for MemOpener {
    fn open(&self, path: &Path, worker: Option<usize>) -> io::Result<Box<dyn SgDevice>> {
        let disk = self
            .disks
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let plan = worker
            .and_then(|w| self.plans.lock().remove(&w))
            .unwrap_or_default();
        let version = self.version.unwrap_or(MEM_DEFAULT_VERSION);
        Ok(Box::new(MemDevice::with_plan(disk, version, plan)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::Command;
    use crate::sense::{classify, Category};
    use crate::sg::protocol::{protocol_for, Request};
    use crate::sg::Generation;

    fn req<'a>(cmd: &'a Command, pack_id: i32, data: &mut [u8], sense: &mut [u8]) -> Request<'a> {
        Request {
            cdb: cmd.as_bytes(),
            pack_id,
            direction: cmd.direction(),
            data: data.as_mut_ptr(),
            xfer_len: cmd.xfer_len(),
            sense: sense.as_mut_ptr(),
            sense_len: sense.len() as u8,
            flags: 0,
            timeout_ms: DEF_TIMEOUT_MS,
        }
    }

    #[test]
    fn test_write_then_read_both_generations() {
        for generation in [Generation::Legacy, Generation::Extended] {
            let disk = MemDisk::new(64, 512);
            let dev = MemDevice::new(disk.clone());
            let proto = protocol_for(generation);
            let mut sense = [0u8; SENSE_BUFF_LEN];

            let mut out = vec![0xa5u8; 1024];
            let w = Command::write(10, 2, 512);
            proto.submit(&dev, &req(&w, 1, &mut out, &mut sense)).unwrap();
            let c = proto.receive(&dev, None).unwrap();
            assert_eq!(c.pack_id, 1);
            assert_eq!(c.status, SAM_STAT_GOOD);

            let mut back = vec![0u8; 1024];
            let r = Command::read(10, 2, 512);
            proto.submit(&dev, &req(&r, 2, &mut back, &mut sense)).unwrap();
            let c = proto.receive(&dev, None).unwrap();
            assert_eq!(c.pack_id, 2);
            assert_eq!(back, out);
            assert_eq!(disk.read_block(11).unwrap(), vec![0xa5u8; 512]);
        }
    }

    #[test]
    fn test_receive_empty_is_eagain() {
        let dev = MemDevice::new(MemDisk::new(8, 512));
        let err = protocol_for(Generation::Legacy).receive(&dev, None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
    }

    #[test]
    fn test_out_of_range_lba_sets_sense() {
        let dev = MemDevice::new(MemDisk::new(8, 512));
        let proto = protocol_for(Generation::Extended);
        let mut data = vec![0u8; 1024];
        let mut sense = [0u8; SENSE_BUFF_LEN];
        let cmd = Command::read(7, 2, 512);
        proto.submit(&dev, &req(&cmd, 5, &mut data, &mut sense)).unwrap();
        let c = proto.receive(&dev, None).unwrap();
        let cat = classify(c.status, c.host_status, c.driver_status, &sense);
        assert_eq!(
            cat,
            Category::CheckCondition {
                key: SENSE_KEY_ILLEGAL_REQUEST,
                asc: 0x21,
                ascq: 0
            }
        );
    }

    #[test]
    fn test_queue_capacity_e2big() {
        let disk = MemDisk::new(8, 512);
        let dev = MemDevice::with_plan(disk, MEM_DEFAULT_VERSION, FaultPlan::new().queue_capacity(2));
        let proto = protocol_for(Generation::Extended);
        let cmd = Command::no_op();
        let mut sense = [0u8; SENSE_BUFF_LEN];
        let mut none: [u8; 0] = [];
        proto.submit(&dev, &req(&cmd, 1, &mut none, &mut sense)).unwrap();
        proto.submit(&dev, &req(&cmd, 2, &mut none, &mut sense)).unwrap();
        let err = proto.submit(&dev, &req(&cmd, 3, &mut none, &mut sense)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::E2BIG));
        proto.receive(&dev, None).unwrap();
        proto.submit(&dev, &req(&cmd, 3, &mut none, &mut sense)).unwrap();
        assert_eq!(dev.num_waiting().unwrap(), 2);
    }

    #[test]
    fn test_scripted_submit_errors() {
        let plan = FaultPlan::new().submit_errors([libc::ENOMEM, libc::EAGAIN]);
        let dev = MemDevice::with_plan(MemDisk::new(8, 512), MEM_DEFAULT_VERSION, plan);
        let proto = protocol_for(Generation::Legacy);
        let cmd = Command::no_op();
        let mut sense = [0u8; SENSE_BUFF_LEN];
        let mut none: [u8; 0] = [];
        let first = proto.submit(&dev, &req(&cmd, 1, &mut none, &mut sense));
        assert_eq!(first.unwrap_err().raw_os_error(), Some(libc::ENOMEM));
        let second = proto.submit(&dev, &req(&cmd, 1, &mut none, &mut sense));
        assert_eq!(second.unwrap_err().raw_os_error(), Some(libc::EAGAIN));
        proto.submit(&dev, &req(&cmd, 1, &mut none, &mut sense)).unwrap();
    }

    #[test]
    fn test_force_pack_id_and_out_of_order() {
        let plan = FaultPlan::new().out_of_order();
        let dev = MemDevice::with_plan(MemDisk::new(8, 512), MEM_DEFAULT_VERSION, plan);
        let proto = protocol_for(Generation::Legacy);
        let cmd = Command::no_op();
        let mut sense = [0u8; SENSE_BUFF_LEN];
        let mut none: [u8; 0] = [];
        for id in 1..=3 {
            proto.submit(&dev, &req(&cmd, id, &mut none, &mut sense)).unwrap();
        }
        assert_eq!(proto.receive(&dev, None).unwrap().pack_id, 3);
        dev.set_force_pack_id(true).unwrap();
        assert_eq!(proto.receive(&dev, Some(1)).unwrap().pack_id, 1);
        let err = proto.receive(&dev, Some(1)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
        assert_eq!(proto.receive(&dev, Some(2)).unwrap().pack_id, 2);
    }

    #[test]
    fn test_legacy_driver_rejects_v4() {
        let dev = MemDevice::with_plan(MemDisk::new(8, 512), 30536, FaultPlan::new());
        let mut info = SgExtendedInfo::set_ctl_flags(SG_CTL_FLAGM_TIME_IN_NS);
        assert_eq!(
            dev.set_get_extended(&mut info).unwrap_err().raw_os_error(),
            Some(libc::ENOTTY)
        );
        let mut hdr = SgIoV4::default();
        assert!(dev.submit_v4(&mut hdr).is_err());
    }

    #[test]
    fn test_extended_grant_mask() {
        let plan = FaultPlan::new().grant_ctl_flags(SG_CTL_FLAGM_TIME_IN_NS);
        let dev = MemDevice::with_plan(MemDisk::new(8, 512), MEM_DEFAULT_VERSION, plan);
        let mut info =
            SgExtendedInfo::set_ctl_flags(SG_CTL_FLAGM_TIME_IN_NS | SG_CTL_FLAGM_MORE_ASYNC);
        dev.set_get_extended(&mut info).unwrap();
        assert_eq!(info.ctl_flags, SG_CTL_FLAGM_TIME_IN_NS);
    }

    #[test]
    fn test_read_capacity() {
        let dev = MemDevice::new(MemDisk::new(2048, 4096));
        let proto = protocol_for(Generation::Extended);
        let cmd = Command::read_capacity();
        let mut data = vec![0u8; 32];
        let mut sense = [0u8; SENSE_BUFF_LEN];
        proto.submit(&dev, &req(&cmd, 9, &mut data, &mut sense)).unwrap();
        proto.receive(&dev, None).unwrap();
        let cap = Capacity::from_response(&data).unwrap();
        assert_eq!(cap.blocks, 2048);
        assert_eq!(cap.block_size, 4096);
    }

    #[test]
    fn test_reserved_resize_and_refuse() {
        let dev = MemDevice::new(MemDisk::new(8, 512));
        dev.set_reserved_size(1 << 20).unwrap();
        assert_eq!(dev.reserved_size().unwrap(), 1 << 20);

        let stubborn =
            MemDevice::with_plan(MemDisk::new(8, 512), MEM_DEFAULT_VERSION, FaultPlan::new().refuse_reserved());
        stubborn.set_reserved_size(1 << 20).unwrap();
        assert_eq!(stubborn.reserved_size().unwrap(), MEM_DEFAULT_RESERVED as i32);
    }

    #[test]
    fn test_opener_plans_per_worker() {
        let disk = MemDisk::new(8, 512);
        let opener = MemOpener::new()
            .with_disk("/dev/sg7", disk.clone())
            .with_plan(1, FaultPlan::new().receive_always(libc::EAGAIN));
        let healthy = opener.open(Path::new("/dev/sg7"), Some(0)).unwrap();
        let broken = opener.open(Path::new("/dev/sg7"), Some(1)).unwrap();
        let proto = protocol_for(Generation::Extended);
        let cmd = Command::no_op();
        let mut sense = [0u8; SENSE_BUFF_LEN];
        let mut none: [u8; 0] = [];
        proto.submit(healthy.as_ref(), &req(&cmd, 1, &mut none, &mut sense)).unwrap();
        proto.submit(broken.as_ref(), &req(&cmd, 2, &mut none, &mut sense)).unwrap();
        assert!(proto.receive(healthy.as_ref(), None).is_ok());
        assert!(proto.receive(broken.as_ref(), None).is_err());
        assert!(opener.open(Path::new("/dev/sg8"), None).is_err());
        assert_eq!(disk.commands(), 2);
    }
}
