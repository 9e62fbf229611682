//! Worker thread orchestration
//!
//! One worker owns one device session, one buffer pool and one in-flight map.
//! It keeps up to `max_queue_depth` commands outstanding until it has issued
//! and completed its target count, then tears down in a fixed order:
//! counters are merged, the session is closed, and only then are buffers
//! returned and the pool drained.

use crate::buffer::{BufferPool, BufferPoolStats};
use crate::cdb::{Command, OpKind};
use crate::complete::{complete, CompleteOutcome};
use crate::config::{EngineConfig, ResolvedTarget, XferMode};
use crate::error::{EngineError, SessionError};
use crate::inflight::{InFlight, Slot};
use crate::policy::{Action, LoopSnapshot};
use crate::session::DeviceSession;
use crate::sg::shim::DeviceOpener;
use crate::sg::sys::SG_FLAG_Q_AT_TAIL;
use crate::stats::{LocalCounters, Shared};
use crate::submit::{submit, CommandFlags, Pending, SubmitOutcome};
use nix::libc;
use rand::distr::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::io;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Bytes of each written block stamped with its LBA.
pub const LBA_STAMP_LEN: usize = 8;

/// Everything a worker borrows from the coordinator.
#[derive(Clone, Copy)]
pub struct WorkerContext<'a> {
    /// Worker number, from 0.
    pub index: usize,
    /// Validated configuration.
    pub config: &'a EngineConfig,
    /// Devices with resolved LBA ranges.
    pub targets: &'a [ResolvedTarget],
    /// Opens this worker's device handle.
    pub opener: &'a dyn DeviceOpener,
    /// Counters, pack_id generator, console and entropy.
    pub shared: &'a Shared,
}

/// How one worker ended.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    /// Worker number.
    pub index: usize,
    /// Device path.
    pub device: String,
    /// Commands accepted by the driver.
    pub submitted: u64,
    /// Commands completed.
    pub completed: u64,
    /// Error that stopped the worker early.
    pub error: Option<String>,
    /// Buffers not returned to the pool at exit.
    pub leaked_buffers: u64,
}

impl WorkerReport {
    /// Whether the worker reached its target without error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-thread loop state.
struct Worker<'a> {
    ctx: WorkerContext<'a>,
    target: &'a ResolvedTarget,
    pool: BufferPool,
    inflight: InFlight,
    counters: LocalCounters,
    submitted: u64,
    completed: u64,
    encore: Option<Pending>,
    force_drain: bool,
}

/// Run one worker to completion or failure.
pub fn run_worker(ctx: &WorkerContext<'_>) -> WorkerReport {
    let Some(target) = ctx.targets.get(ctx.index % ctx.targets.len().max(1)) else {
        ctx.shared.stats.record_failed_worker();
        error!(thread = ctx.index, "no device to run against");
        return WorkerReport {
            index: ctx.index,
            device: String::new(),
            submitted: 0,
            completed: 0,
            error: Some("no device configured".into()),
            leaked_buffers: 0,
        };
    };

    let cfg = ctx.config;
    let mut worker = Worker {
        ctx: *ctx,
        target,
        pool: BufferPool::new(cfg.xfer_len() as usize),
        inflight: InFlight::with_capacity(cfg.queue_depth() as usize),
        counters: LocalCounters::default(),
        submitted: 0,
        completed: 0,
        encore: None,
        force_drain: false,
    };

    let mut session = None;
    let result = worker.run(&mut session);
    let pool_stats = worker.teardown(session);

    let device = target.path.display().to_string();
    let error = match result {
        Ok(()) => {
            debug!(thread = ctx.index, device = %device, completed = worker.completed, "worker finished");
            None
        }
        Err(e) => {
            ctx.shared.stats.record_failed_worker();
            error!(thread = ctx.index, device = %device, errno = ?e.errno(), "worker stopped: {}", e);
            ctx.shared
                .console
                .line(&format!("worker {} ({device}): {e}", ctx.index));
            Some(e.to_string())
        }
    };
    if pool_stats.has_leaks() {
        warn!(thread = ctx.index, leaked = pool_stats.leaked(), "buffers not returned to pool");
    }
    if cfg.worker_summaries {
        ctx.shared.console.line(&format!(
            "worker {} ({device}): submitted {}, completed {}, buffers allocated {} reused {}",
            ctx.index, worker.submitted, worker.completed, pool_stats.allocated, pool_stats.reused,
        ));
    }

    WorkerReport {
        index: ctx.index,
        device,
        submitted: worker.submitted,
        completed: worker.completed,
        error,
        leaked_buffers: pool_stats.leaked(),
    }
}

impl Worker<'_> {
    fn run(&mut self, session_slot: &mut Option<DeviceSession>) -> Result<(), EngineError> {
        let cfg = self.ctx.config;
        let index = self.ctx.index;
        let path = self.target.path.display().to_string();

        let device = self
            .ctx
            .opener
            .open(&self.target.path, Some(index))
            .map_err(|source| SessionError::Open {
                path: path.clone(),
                source,
            })?;
        let session = session_slot.insert(DeviceSession::open(device, &path, &cfg.session_options())?);
        if cfg.xfer_mode == XferMode::Mmap {
            session.map_reserved((cfg.xfer_len() as usize).max(1))?;
        }
        let session: &DeviceSession = session;

        let mut rng = self.seed_rng()?;
        let lbas = if cfg.op.needs_lba() {
            let last = self.target.end.saturating_sub(u64::from(cfg.blocks_per_cmd));
            Some(
                Uniform::new_inclusive(self.target.start, last)
                    .map_err(|e| EngineError::Setup(format!("LBA range: {e}")))?,
            )
        } else {
            None
        };

        let flags = CommandFlags {
            flags: cfg.xfer_mode.flags() | SG_FLAG_Q_AT_TAIL,
            timeout_ms: cfg.timeout_ms,
        };
        let op = cfg.op.name();
        let policy = cfg.queue;
        let started = Instant::now();
        info!(
            thread = index,
            device = %path,
            generation = %session.generation(),
            depth = policy.max_queue_depth,
            op,
            "worker started"
        );

        loop {
            let outstanding = self.inflight.len() as u32;
            let ready = if outstanding == 0 {
                0
            } else {
                session
                    .num_waiting()
                    .map_err(|source| SessionError::Control {
                        path: path.clone(),
                        what: "SG_GET_NUM_WAITING",
                        source,
                    })?
                    .min(outstanding)
            };
            let snap = LoopSnapshot {
                submitted: self.submitted,
                target: cfg.commands_per_thread,
                outstanding,
                ready,
                force_drain: self.force_drain,
            };

            match policy.next_action(&snap) {
                Action::Done => break,
                Action::Submit => {
                    let pending = match self.encore.take() {
                        Some(p) => p,
                        None => self.fresh_request(&mut rng, lbas.as_ref())?,
                    };
                    self.submit_one(session, &flags, pending)?;
                }
                Action::Drain(n) => self.drain(session, n)?,
                Action::Wait => cfg
                    .idle_wait
                    .wait(session)
                    .map_err(|source| SessionError::Control {
                        path: path.clone(),
                        what: "poll",
                        source,
                    })?,
            }
        }

        debug!(
            thread = index,
            elapsed = ?started.elapsed(),
            submitted = self.submitted,
            "worker loop done"
        );
        Ok(())
    }

    fn seed_rng(&self) -> Result<StdRng, EngineError> {
        let seed = match self.ctx.config.seed {
            Some(seed) => seed.wrapping_add(self.ctx.index as u64),
            None => self
                .ctx
                .shared
                .entropy
                .seed()
                .map_err(|e| EngineError::Setup(format!("entropy read failed: {e}")))?,
        };
        Ok(StdRng::seed_from_u64(seed))
    }

    fn fresh_request(
        &mut self,
        rng: &mut StdRng,
        lbas: Option<&Uniform<u64>>,
    ) -> Result<Pending, EngineError> {
        let cfg = self.ctx.config;
        let mut buf = self.pool.acquire()?;
        let lba = lbas.map(|dist| rng.sample(dist));
        if let (OpKind::Write, Some(lba)) = (cfg.op, lba) {
            stamp_blocks(buf.as_mut_slice(), lba, cfg.block_size as usize);
        }
        Ok(Pending {
            pack_id: self.ctx.shared.pack_ids.next_id(),
            buf,
            lba,
        })
    }

    fn submit_one(
        &mut self,
        session: &DeviceSession,
        flags: &CommandFlags,
        pending: Pending,
    ) -> Result<(), EngineError> {
        let cfg = self.ctx.config;
        let cmd = Command::for_op(cfg.op, pending.lba.unwrap_or(0), cfg.blocks_per_cmd, cfg.block_size);
        match submit(session, &cmd, flags, pending, &cfg.submit, &mut self.counters) {
            SubmitOutcome::Ok(p) => {
                let slot = Slot {
                    buf: p.buf,
                    lba: p.lba,
                    submitted_at: Instant::now(),
                };
                self.inflight.insert(p.pack_id, slot)?;
                self.submitted += 1;
                self.force_drain = false;
                Ok(())
            }
            SubmitOutcome::RetryAfterDrain(p) if self.inflight.is_empty() => {
                let pack_id = p.pack_id;
                self.pool.release(p.buf);
                Err(EngineError::Submit {
                    op: cmd.name(),
                    pack_id,
                    source: io::Error::from_raw_os_error(libc::E2BIG),
                })
            }
            SubmitOutcome::RetryAfterDrain(p) => {
                self.encore = Some(p);
                self.force_drain = true;
                Ok(())
            }
            SubmitOutcome::Fatal { pending, error } => {
                self.pool.release(pending.buf);
                Err(error)
            }
        }
    }

    fn drain(&mut self, session: &DeviceSession, n: u32) -> Result<(), EngineError> {
        let cfg = self.ctx.config;
        let op = cfg.op.name();
        let xfer_len = i64::from(cfg.bytes_per_cmd());
        for _ in 0..n {
            if self.inflight.is_empty() {
                break;
            }
            let wanted = if cfg.force_pack_id {
                self.inflight.oldest()
            } else {
                None
            };
            match complete(session, op, wanted, &cfg.complete, &self.inflight, &mut self.counters) {
                CompleteOutcome::Ok(done) => {
                    let slot = self.inflight.remove(done.pack_id)?;
                    self.pool.release(slot.buf);
                    self.completed += 1;
                    self.counters.bytes += (xfer_len - i64::from(done.resid)).max(0) as u64;
                }
                CompleteOutcome::Fatal(e) => return Err(e),
            }
        }
        self.force_drain = false;
        Ok(())
    }

    /// Merge counters, close the session, then reclaim every buffer.
    fn teardown(&mut self, session: Option<DeviceSession>) -> BufferPoolStats {
        self.counters.merge_into(&self.ctx.shared.stats);
        drop(session);
        for buf in self.inflight.drain() {
            self.pool.release(buf);
        }
        if let Some(p) = self.encore.take() {
            self.pool.release(p.buf);
        }
        self.pool.drain();
        self.pool.stats()
    }
}

/// Write each block's LBA into its first bytes.
pub fn stamp_blocks(buf: &mut [u8], first_lba: u64, block_size: usize) {
    if block_size < LBA_STAMP_LEN {
        return;
    }
    for (i, block) in buf.chunks_exact_mut(block_size).enumerate() {
        block[..LBA_STAMP_LEN].copy_from_slice(&(first_lba + i as u64).to_le_bytes());
    }
}

/// LBA stamped into a block by [`stamp_blocks`].
pub fn read_stamp(block: &[u8]) -> Option<u64> {
    let bytes: [u8; LBA_STAMP_LEN] = block.get(..LBA_STAMP_LEN)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complete::CompletePolicy;
    use crate::config::DeviceTarget;
    use crate::policy::Favor;
    use crate::retry::RetryPolicy;
    use crate::sg::mem::{FaultPlan, MemDevice, MemDisk, MemOpener, MEM_DEFAULT_VERSION};
    use crate::sg::shim::{ReservedMapping, SgDevice};
    use crate::sg::sys::{SgExtendedInfo, SgIoHdr, SgIoV4};
    use crate::stats::{Console, EntropySource};
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    const DEV: &str = "/dev/sg7";

    fn target(blocks: u64) -> ResolvedTarget {
        ResolvedTarget {
            path: PathBuf::from(DEV),
            start: 0,
            end: blocks,
        }
    }

    fn config(op: OpKind, depth: u32, commands: u64) -> EngineConfig {
        EngineConfig {
            devices: vec![DeviceTarget::new(DEV)],
            op,
            commands_per_thread: commands,
            seed: Some(7),
            ..Default::default()
        }
        .with_queue_depth(depth)
    }

    fn quiet() -> Shared {
        Shared::new(Console::new(Box::new(io::sink())), EntropySource::default())
    }

    fn run(cfg: &EngineConfig, opener: &MemOpener, shared: &Shared, blocks: u64) -> WorkerReport {
        let targets = [target(blocks)];
        run_worker(&WorkerContext {
            index: 0,
            config: cfg,
            targets: &targets,
            opener,
            shared,
        })
    }

    #[test]
    fn test_noop_worker_reaches_target() {
        let disk = MemDisk::new(64, 512);
        let opener = MemOpener::new().with_disk(DEV, Arc::clone(&disk));
        let shared = quiet();
        let cfg = config(OpKind::NoOp, 4, 100);
        let report = run(&cfg, &opener, &shared, 64);
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(report.submitted, 100);
        assert_eq!(report.completed, 100);
        assert_eq!(report.leaked_buffers, 0);
        let snap = shared.stats.snapshot();
        assert_eq!(snap.starts, 100);
        assert_eq!(snap.finishes, 100);
        assert!(disk.peak_queued() <= 4);
    }

    #[test]
    fn test_write_stamps_lbas() {
        let disk = MemDisk::new(32, 512);
        let opener = MemOpener::new().with_disk(DEV, Arc::clone(&disk));
        let shared = quiet();
        let cfg = EngineConfig {
            blocks_per_cmd: 2,
            ..config(OpKind::Write, 2, 40)
        };
        let report = run(&cfg, &opener, &shared, 32);
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(shared.stats.snapshot().bytes, 40 * 1024);
        let mut written = 0;
        for lba in 0..32 {
            let block = disk.read_block(lba).unwrap();
            if block.iter().any(|&b| b != 0) {
                assert_eq!(read_stamp(&block), Some(lba));
                written += 1;
            }
        }
        assert!(written > 0);
    }

    #[test]
    fn test_queue_full_encore_keeps_pack_id_unique() {
        let disk = MemDisk::new(64, 512);
        let opener = MemOpener::new()
            .with_disk(DEV, Arc::clone(&disk))
            .with_plan(0, FaultPlan::new().queue_capacity(2));
        let shared = quiet();
        let cfg = config(OpKind::Read, 8, 50).with_favor(Favor::Submit);
        let report = run(&cfg, &opener, &shared, 64);
        assert!(report.succeeded(), "{:?}", report.error);
        let snap = shared.stats.snapshot();
        assert_eq!(snap.starts, 50);
        assert_eq!(snap.finishes, 50);
        assert!(snap.e2big > 0);
        assert!(disk.peak_queued() <= 2);
        assert_eq!(disk.commands(), 50);
        // one id per accepted command, none burned on encores
        assert_eq!(shared.pack_ids.next_id(), 51);
    }

    #[test]
    fn test_completion_ceiling_stops_worker() {
        let disk = MemDisk::new(64, 512);
        let opener = MemOpener::new()
            .with_disk(DEV, disk)
            .with_plan(0, FaultPlan::new().receive_always(libc::EAGAIN));
        let shared = quiet();
        let cfg = EngineConfig {
            complete: crate::complete::CompletePolicy {
                retry: crate::retry::RetryPolicy::new(10),
            },
            ..config(OpKind::NoOp, 2, 10)
        };
        let report = run(&cfg, &opener, &shared, 64);
        assert!(!report.succeeded());
        assert!(report.error.unwrap().contains("gave up"));
        assert_eq!(report.leaked_buffers, 0);
        assert_eq!(shared.stats.snapshot().failed_workers, 1);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let shared = quiet();
        let cfg = config(OpKind::NoOp, 1, 1);
        let report = run(&cfg, &MemOpener::new(), &shared, 64);
        assert!(!report.succeeded());
        assert!(report.error.unwrap().contains(DEV));
        assert_eq!(shared.stats.snapshot().failed_workers, 1);
    }

    #[test]
    fn test_mmap_mode_runs_at_depth_one() {
        let disk = MemDisk::new(16, 512);
        let opener = MemOpener::new().with_disk(DEV, disk);
        let shared = quiet();
        let cfg = EngineConfig {
            xfer_mode: XferMode::Mmap,
            ..config(OpKind::Read, 1, 20)
        };
        let report = run(&cfg, &opener, &shared, 16);
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(report.completed, 20);
    }

    #[test]
    fn test_no_xfer_moves_no_bytes() {
        let opener = MemOpener::new().with_disk(DEV, MemDisk::new(64, 512));
        let shared = quiet();
        let cfg = EngineConfig {
            xfer_mode: XferMode::NoXfer,
            ..config(OpKind::Read, 4, 30)
        };
        let report = run(&cfg, &opener, &shared, 64);
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(report.completed, 30);
        assert_eq!(shared.stats.snapshot().bytes, 0);
    }

    /// A completion is only receivable after `num_waiting` has reported it,
    /// and every other `num_waiting` call reports nothing.
    struct SlowDevice {
        inner: MemDevice,
        polls: Mutex<u32>,
        visible: Mutex<i32>,
    }

    impl SlowDevice {
        fn take_visible(&self) -> io::Result<()> {
            let mut visible = self.visible.lock();
            if *visible == 0 {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            *visible -= 1;
            Ok(())
        }
    }

    impl SgDevice for SlowDevice {
        fn version_num(&self) -> io::Result<i32> {
            self.inner.version_num()
        }
        fn num_waiting(&self) -> io::Result<i32> {
            let mut polls = self.polls.lock();
            *polls += 1;
            if *polls % 2 == 1 {
                return Ok(0);
            }
            let n = self.inner.num_waiting()?;
            *self.visible.lock() = n;
            Ok(n)
        }
        fn reserved_size(&self) -> io::Result<i32> {
            self.inner.reserved_size()
        }
        fn set_reserved_size(&self, size: i32) -> io::Result<()> {
            self.inner.set_reserved_size(size)
        }
        fn set_get_extended(&self, info: &mut SgExtendedInfo) -> io::Result<()> {
            self.inner.set_get_extended(info)
        }
        fn set_force_pack_id(&self, on: bool) -> io::Result<()> {
            self.inner.set_force_pack_id(on)
        }
        fn write_v3(&self, hdr: &SgIoHdr) -> io::Result<()> {
            self.inner.write_v3(hdr)
        }
        fn read_v3(&self, hdr: &mut SgIoHdr) -> io::Result<()> {
            self.take_visible()?;
            self.inner.read_v3(hdr)
        }
        fn submit_v4(&self, hdr: &mut SgIoV4) -> io::Result<()> {
            self.inner.submit_v4(hdr)
        }
        fn receive_v4(&self, hdr: &mut SgIoV4) -> io::Result<()> {
            self.take_visible()?;
            self.inner.receive_v4(hdr)
        }
        fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
            self.inner.wait_readable(timeout)
        }
        fn map_reserved(&self, len: usize) -> io::Result<ReservedMapping> {
            self.inner.map_reserved(len)
        }
    }

    struct SlowOpener(Arc<MemDisk>);

    impl DeviceOpener for SlowOpener {
        fn open(&self, _path: &Path, _worker: Option<usize>) -> io::Result<Box<dyn SgDevice>> {
            let plan = FaultPlan::new().queue_capacity(1);
            Ok(Box::new(SlowDevice {
                inner: MemDevice::with_plan(Arc::clone(&self.0), MEM_DEFAULT_VERSION, plan),
                polls: Mutex::new(0),
                visible: Mutex::new(0),
            }))
        }
    }

    #[test]
    fn test_queue_full_waits_for_a_ready_completion() {
        let disk = MemDisk::new(64, 512);
        let opener = SlowOpener(Arc::clone(&disk));
        let shared = quiet();
        let cfg = EngineConfig {
            // a single blind receive would be fatal
            complete: CompletePolicy {
                retry: RetryPolicy::new(0),
            },
            ..config(OpKind::NoOp, 4, 40).with_favor(Favor::Submit)
        };
        let targets = [target(64)];
        let report = run_worker(&WorkerContext {
            index: 0,
            config: &cfg,
            targets: &targets,
            opener: &opener,
            shared: &shared,
        });
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(report.completed, 40);
        assert!(shared.stats.snapshot().e2big > 0);
        assert_eq!(disk.commands(), 40);
    }

    #[test]
    fn test_stamp_round_trip() {
        let mut buf = vec![0u8; 1024];
        stamp_blocks(&mut buf, 40, 512);
        assert_eq!(read_stamp(&buf[..512]), Some(40));
        assert_eq!(read_stamp(&buf[512..]), Some(41));
        assert_eq!(read_stamp(&buf[..4]), None);
    }
}
