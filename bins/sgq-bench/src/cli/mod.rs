//! Command-line interface for sgq-bench
//!
//! All options map onto one [`EngineConfig`]; validation beyond what clap
//! checks happens in the engine.

pub mod run;

use clap::{ArgAction, Parser, ValueEnum};
use sgq_core::config::{DEFAULT_BLOCK_SIZE, DEFAULT_COMMANDS};
use sgq_core::policy::{DEFAULT_IDLE_SLEEP, DEFAULT_QUEUE_DEPTH};
use sgq_core::sg::sys::DEF_TIMEOUT_MS;
use sgq_core::{
    Backoff, CompletePolicy, DeviceTarget, DomainErrorPolicy, EngineConfig, Favor, Generation,
    IdleWait, LbaRange, OpKind, QueuePolicy, SubmitPolicy, XferMode,
};
use std::path::PathBuf;
use std::time::Duration;

/// Blocks per device served in `--dry-run` mode.
pub const DEFAULT_DRY_RUN_BLOCKS: u64 = 8192;

/// sgq-bench - asynchronous SCSI generic stress and benchmark tool
#[derive(Parser, Debug)]
#[command(name = "sgq-bench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// SCSI generic device(s), e.g. /dev/sg1; threads take them round-robin
    #[arg(required = true)]
    pub devices: Vec<PathBuf>,

    /// Worker threads
    #[arg(short, long, default_value = "1")]
    pub threads: usize,

    /// Commands per thread
    #[arg(short = 'n', long = "num", default_value_t = DEFAULT_COMMANDS)]
    pub commands: u64,

    /// Commands in flight per thread
    #[arg(short, long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    pub queue_depth: u32,

    /// SCSI command to issue
    #[arg(short, long, value_enum, default_value = "noop")]
    pub op: Op,

    /// LBA range: START-END (END inclusive) or START- (to end of device)
    #[arg(long, value_parser = parse_lba)]
    pub lba: Option<LbaRange>,

    /// Logical block size in bytes
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Blocks per read/write command
    #[arg(short = 'c', long = "blocks", default_value = "1")]
    pub blocks: u32,

    /// Use the legacy v3 interface
    #[arg(long, conflicts_with = "v4")]
    pub v3: bool,

    /// Use the extended v4 interface
    #[arg(long)]
    pub v4: bool,

    /// Drain priority when completions are ready
    #[arg(long, value_enum, default_value = "balanced")]
    pub favor: FavorArg,

    /// Outstanding count at which --favor submit drains harder
    #[arg(long)]
    pub watermark: Option<u32>,

    /// Sleep this many microseconds between completion retries
    #[arg(long, conflicts_with_all = ["yield_cpu", "sched_yield"])]
    pub wait_us: Option<u64>,

    /// Yield the thread between completion retries (default)
    #[arg(long = "yield", conflicts_with = "sched_yield")]
    pub yield_cpu: bool,

    /// Call sched_yield(2) between completion retries
    #[arg(long)]
    pub sched_yield: bool,

    /// Poll timeout in ms when idle; 0 sleeps a fixed 100 us instead
    #[arg(long, default_value = "0")]
    pub poll_ms: u64,

    /// Direct IO into user buffers
    #[arg(long, conflicts_with_all = ["mmap", "no_xfer"])]
    pub direct: bool,

    /// Transfer through the mmap'ed reserved buffer (queue depth 1)
    #[arg(long, conflicts_with = "no_xfer")]
    pub mmap: bool,

    /// Skip the user-space data copy
    #[arg(long)]
    pub no_xfer: bool,

    /// Ask the driver for relaxed queueing
    #[arg(long)]
    pub more_async: bool,

    /// Ask the driver for exclusive wait-queue wakeups
    #[arg(long)]
    pub excl_wait: bool,

    /// Do not ask for nanosecond command timing
    #[arg(long)]
    pub no_time_ns: bool,

    /// Receive the oldest outstanding pack_id instead of any
    #[arg(long)]
    pub force_pack_id: bool,

    /// Per-command timeout in milliseconds
    #[arg(long, default_value_t = DEF_TIMEOUT_MS)]
    pub timeout_ms: u32,

    /// Seed for LBA generation (default: read /dev/urandom)
    #[arg(long)]
    pub seed: Option<u64>,

    /// What to do when submission fails with EDOM
    #[arg(long, value_enum, default_value = "fail")]
    pub on_edom: EdomArg,

    /// Print every counter, including zeros, and per-thread summaries
    #[arg(short = 'S', long)]
    pub stats: bool,

    /// More log output (repeat for more)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Allow writes to devices that are not scsi_debug
    #[arg(long)]
    pub force: bool,

    /// Run against in-memory devices instead of opening the paths
    #[arg(long)]
    pub dry_run: bool,

    /// Size of each in-memory device in blocks
    #[arg(long, default_value_t = DEFAULT_DRY_RUN_BLOCKS)]
    pub dry_run_blocks: u64,
}

/// SCSI command selection
#[derive(Clone, Copy, Debug, ValueEnum, Default, PartialEq, Eq)]
pub enum Op {
    /// TEST UNIT READY
    #[default]
    Noop,
    /// READ(16)
    Read,
    /// WRITE(16)
    Write,
}

impl From<Op> for OpKind {
    fn from(op: Op) -> Self {
        match op {
            Op::Noop => OpKind::NoOp,
            Op::Read => OpKind::Read,
            Op::Write => OpKind::Write,
        }
    }
}

/// Drain priority
#[derive(Clone, Copy, Debug, ValueEnum, Default, PartialEq, Eq)]
pub enum FavorArg {
    /// Drain everything ready
    Complete,
    /// Drain half of what is ready
    #[default]
    Balanced,
    /// Keep the queue full
    Submit,
}

impl From<FavorArg> for Favor {
    fn from(f: FavorArg) -> Self {
        match f {
            FavorArg::Complete => Favor::Complete,
            FavorArg::Balanced => Favor::Balanced,
            FavorArg::Submit => Favor::Submit,
        }
    }
}

/// EDOM handling
#[derive(Clone, Copy, Debug, ValueEnum, Default, PartialEq, Eq)]
pub enum EdomArg {
    /// Stop the thread
    #[default]
    Fail,
    /// Retry like EAGAIN
    Retry,
}

impl Cli {
    /// Protocol generation override.
    pub fn generation(&self) -> Option<Generation> {
        match (self.v3, self.v4) {
            (true, _) => Some(Generation::Legacy),
            (_, true) => Some(Generation::Extended),
            _ => None,
        }
    }

    /// Transfer mode from the transfer flags.
    pub fn xfer_mode(&self) -> XferMode {
        if self.direct {
            XferMode::Direct
        } else if self.mmap {
            XferMode::Mmap
        } else if self.no_xfer {
            XferMode::NoXfer
        } else {
            XferMode::Indirect
        }
    }

    /// Pause between completion retries.
    pub fn completion_backoff(&self) -> Backoff {
        match self.wait_us {
            Some(0) => Backoff::None,
            Some(us) => Backoff::Sleep(Duration::from_micros(us)),
            None if self.sched_yield => Backoff::SchedYield,
            None => Backoff::Yield,
        }
    }

    /// Idle wait from `--poll-ms`.
    pub fn idle_wait(&self) -> IdleWait {
        match self.poll_ms {
            0 => IdleWait::Sleep(DEFAULT_IDLE_SLEEP),
            ms => IdleWait::Poll(Duration::from_millis(ms)),
        }
    }

    /// Engine configuration for these options.
    pub fn engine_config(&self) -> EngineConfig {
        let lba = self.lba.unwrap_or_default();
        let complete = CompletePolicy::default();
        EngineConfig {
            devices: self
                .devices
                .iter()
                .map(|p| DeviceTarget::new(p.clone()).with_lba(lba))
                .collect(),
            threads: self.threads,
            commands_per_thread: self.commands,
            op: self.op.into(),
            block_size: self.block_size,
            blocks_per_cmd: self.blocks,
            generation: self.generation(),
            queue: QueuePolicy {
                max_queue_depth: self.queue_depth,
                favor: self.favor.into(),
                watermark: self.watermark,
            },
            idle_wait: self.idle_wait(),
            xfer_mode: self.xfer_mode(),
            ns_timing: !self.no_time_ns,
            more_async: self.more_async,
            excl_waitq: self.excl_wait,
            force_pack_id: self.force_pack_id,
            timeout_ms: self.timeout_ms,
            seed: self.seed,
            submit: SubmitPolicy {
                domain: match self.on_edom {
                    EdomArg::Fail => DomainErrorPolicy::Fail,
                    EdomArg::Retry => DomainErrorPolicy::Retry,
                },
                ..SubmitPolicy::default()
            },
            complete: CompletePolicy {
                retry: complete.retry.with_backoff(self.completion_backoff()),
            },
            worker_summaries: self.stats,
        }
    }

    /// Default tracing level for the `-v` count.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Parse `START-END` (END inclusive) or `START-` into an LBA range.
pub fn parse_lba(s: &str) -> Result<LbaRange, String> {
    let (start, end) = s
        .trim()
        .split_once('-')
        .ok_or_else(|| format!("expected START-END or START-, got '{s}'"))?;
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|e| format!("bad start LBA '{start}': {e}"))?;
    let end = end.trim();
    if end.is_empty() {
        return Ok(LbaRange::ToEnd { start });
    }
    let last: u64 = end.parse().map_err(|e| format!("bad end LBA '{end}': {e}"))?;
    if last < start {
        return Err(format!("end LBA {last} is before start LBA {start}"));
    }
    let end = last
        .checked_add(1)
        .ok_or_else(|| format!("end LBA {last} is too large"))?;
    Ok(LbaRange::Bounded { start, end })
}
