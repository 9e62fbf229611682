//! Run coordinator
//!
//! Validates the configuration, probes every device once from the calling
//! thread, then runs one worker per configured thread and joins them all.
//! Workers never cancel each other; the coordinator only aggregates.

use crate::cdb::Capacity;
use crate::config::{check_span, EngineConfig, LbaRange, ResolvedTarget};
use crate::error::{EngineError, SessionError};
use crate::session::DeviceSession;
use crate::sg::shim::DeviceOpener;
use crate::stats::{Report, Shared};
use crate::worker::{run_worker, WorkerContext, WorkerReport};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Outcome of a full run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Aggregated counters and rates.
    pub report: Report,
    /// One entry per worker, in index order.
    pub workers: Vec<WorkerReport>,
    /// Devices and the LBA ranges they were exercised over.
    pub targets: Vec<ResolvedTarget>,
}

impl RunSummary {
    /// True when every worker reached its target.
    pub fn all_succeeded(&self) -> bool {
        self.workers.iter().all(WorkerReport::succeeded)
    }
}

/// Multi-threaded command engine.
pub struct Engine {
    config: EngineConfig,
    opener: Arc<dyn DeviceOpener>,
    shared: Shared,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine over devices handed out by `opener`.
    pub fn new(config: EngineConfig, opener: Arc<dyn DeviceOpener>) -> Self {
        Self::with_shared(config, opener, Shared::default())
    }

    /// Engine with a caller-supplied console and entropy source.
    pub fn with_shared(config: EngineConfig, opener: Arc<dyn DeviceOpener>, shared: Shared) -> Self {
        Self {
            config,
            opener,
            shared,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// State shared with the workers.
    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Probe the devices and run every worker to completion.
    ///
    /// Errors are setup failures only; worker failures are reported in
    /// [`RunSummary::workers`] and counted in the report.
    pub fn run(&self) -> Result<RunSummary, EngineError> {
        self.config.validate()?;
        let targets = self.resolve_targets()?;

        let threads = self.config.threads;
        info!(
            threads,
            devices = targets.len(),
            commands = self.config.commands_per_thread,
            depth = self.config.queue_depth(),
            op = self.config.op.name(),
            "starting run"
        );

        let start = Instant::now();
        let workers = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(threads);
            for index in 0..threads {
                let ctx = WorkerContext {
                    index,
                    config: &self.config,
                    targets: &targets,
                    opener: self.opener.as_ref(),
                    shared: &self.shared,
                };
                let spawned = std::thread::Builder::new()
                    .name(format!("sgq-worker-{index}"))
                    .spawn_scoped(scope, move || run_worker(&ctx));
                handles.push((index, spawned));
            }

            handles
                .into_iter()
                .map(|(index, spawned)| {
                    let joined = match spawned {
                        Ok(handle) => handle.join().map_err(|_| EngineError::WorkerPanicked(index)),
                        Err(e) => Err(EngineError::Setup(format!("spawn worker {index}: {e}"))),
                    };
                    joined.unwrap_or_else(|e| {
                        self.shared.stats.record_failed_worker();
                        error!(thread = index, "{}", e);
                        WorkerReport {
                            index,
                            device: String::new(),
                            submitted: 0,
                            completed: 0,
                            error: Some(e.to_string()),
                            leaked_buffers: 0,
                        }
                    })
                })
                .collect::<Vec<_>>()
        });
        let elapsed = start.elapsed();

        let report = Report::new(&self.shared.stats.snapshot(), threads, elapsed);
        info!(
            completed = report.completed,
            failed_workers = report.failed_workers,
            elapsed = ?elapsed,
            "run finished"
        );
        Ok(RunSummary {
            report,
            workers,
            targets,
        })
    }

    /// Open each device once, negotiate, and turn every LBA range into a
    /// concrete one.
    fn resolve_targets(&self) -> Result<Vec<ResolvedTarget>, EngineError> {
        let cfg = &self.config;
        let opts = cfg.session_options();
        let timeout = Duration::from_millis(u64::from(cfg.timeout_ms));

        cfg.devices
            .iter()
            .map(|dev| -> Result<ResolvedTarget, EngineError> {
                let path = dev.path.display().to_string();
                let handle = self
                    .opener
                    .open(&dev.path, None)
                    .map_err(|source| SessionError::Open {
                        path: path.clone(),
                        source,
                    })?;
                let session = DeviceSession::open(handle, &path, &opts)?;

                let (start, end) = if cfg.op.needs_lba() {
                    let capacity = if dev.lba.needs_capacity() {
                        let cap = session.read_capacity(self.shared.pack_ids.next_id(), timeout)?;
                        self.check_block_size(&path, cap);
                        Some(cap.blocks)
                    } else {
                        None
                    };
                    let (start, end) = dev.lba.resolve(capacity)?;
                    check_span(start, end, cfg.blocks_per_cmd)?;
                    (start, end)
                } else {
                    // no-op commands never address blocks
                    match dev.lba {
                        LbaRange::Bounded { start, end } => (start, end),
                        LbaRange::ToEnd { start } => (start, start),
                    }
                };
                info!(
                    device = %path,
                    version = session.version(),
                    generation = %session.generation(),
                    start,
                    end,
                    "device ready"
                );
                Ok(ResolvedTarget {
                    path: dev.path.clone(),
                    start,
                    end,
                })
            })
            .collect()
    }

    fn check_block_size(&self, path: &str, cap: Capacity) {
        if cap.block_size != self.config.block_size {
            warn!(
                device = %path,
                device_block_size = cap.block_size,
                configured = self.config.block_size,
                "configured block size differs from device"
            );
        }
    }
}
