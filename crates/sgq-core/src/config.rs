//! Engine configuration

use crate::cdb::OpKind;
use crate::complete::CompletePolicy;
use crate::error::ConfigError;
use crate::policy::{Favor, IdleWait, QueuePolicy};
use crate::session::SessionOptions;
use crate::sg::sys::{DEF_TIMEOUT_MS, SG_FLAG_DIRECT_IO, SG_FLAG_MMAP_IO, SG_FLAG_NO_DXFER};
use crate::sg::Generation;
use crate::submit::SubmitPolicy;
use serde::Serialize;
use std::path::PathBuf;

/// Default commands issued by each worker.
pub const DEFAULT_COMMANDS: u64 = 1000;
/// Default logical block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Blocks a worker may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LbaRange {
    /// `start..end`, end exclusive.
    Bounded {
        /// First LBA.
        start: u64,
        /// One past the last LBA.
        end: u64,
    },
    /// `start..` the device's last block.
    ToEnd {
        /// First LBA.
        start: u64,
    },
}

impl Default for LbaRange {
    fn default() -> Self {
        Self::ToEnd { start: 0 }
    }
}

impl LbaRange {
    /// Whether the device capacity is needed to resolve this range.
    pub fn needs_capacity(&self) -> bool {
        matches!(self, Self::ToEnd { .. })
    }

    /// Concrete `start..end` given the device's block count.
    pub fn resolve(&self, device_blocks: Option<u64>) -> Result<(u64, u64), ConfigError> {
        let (start, end) = match *self {
            Self::Bounded { start, end } => (start, end),
            Self::ToEnd { start } => (start, device_blocks.unwrap_or(0)),
        };
        if start >= end {
            return Err(ConfigError::EmptyLbaRange { start, end });
        }
        Ok((start, end))
    }
}

/// One device and the blocks to exercise on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceTarget {
    /// Device node, e.g. `/dev/sg1`.
    pub path: PathBuf,
    /// Addressable blocks.
    pub lba: LbaRange,
}

impl DeviceTarget {
    /// Whole device.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lba: LbaRange::default(),
        }
    }

    /// Restrict to `lba`.
    pub fn with_lba(mut self, lba: LbaRange) -> Self {
        self.lba = lba;
        self
    }
}

/// A target after "to end of device" has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTarget {
    /// Device node.
    pub path: PathBuf,
    /// First LBA.
    pub start: u64,
    /// One past the last LBA.
    pub end: u64,
}

/// How data moves between user memory and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum XferMode {
    /// Driver bounces through kernel buffers.
    #[default]
    Indirect,
    /// DMA straight to the user buffer.
    Direct,
    /// Transfer via the mmap'ed reserved buffer.
    Mmap,
    /// Skip the user copy altogether.
    NoXfer,
}

impl XferMode {
    /// Per-command `SG_FLAG_*` bits.
    pub fn flags(self) -> u32 {
        match self {
            Self::Indirect => 0,
            Self::Direct => SG_FLAG_DIRECT_IO,
            Self::Mmap => SG_FLAG_MMAP_IO,
            Self::NoXfer => SG_FLAG_NO_DXFER,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Devices; worker `i` uses `devices[i % devices.len()]`.
    pub devices: Vec<DeviceTarget>,
    /// Worker threads.
    pub threads: usize,
    /// Commands each worker completes.
    pub commands_per_thread: u64,
    /// Operation issued.
    pub op: OpKind,
    /// Logical block size in bytes.
    pub block_size: u32,
    /// Blocks per read/write command.
    pub blocks_per_cmd: u32,
    /// Protocol generation override.
    pub generation: Option<Generation>,
    /// Submit/drain scheduling.
    pub queue: QueuePolicy,
    /// How to wait when there is nothing to do.
    pub idle_wait: IdleWait,
    /// Data transfer mode.
    pub xfer_mode: XferMode,
    /// Ask for nanosecond timing.
    pub ns_timing: bool,
    /// Ask for relaxed queueing.
    pub more_async: bool,
    /// Ask for exclusive wait-queue wakeups.
    pub excl_waitq: bool,
    /// Receive the oldest outstanding pack_id instead of any.
    pub force_pack_id: bool,
    /// Per-command timeout.
    pub timeout_ms: u32,
    /// Fixed LBA generator seed; `None` reads the entropy source.
    pub seed: Option<u64>,
    /// Submission retry ceilings.
    pub submit: SubmitPolicy,
    /// Completion retry ceiling and backoff.
    pub complete: CompletePolicy,
    /// Print one summary line per worker.
    pub worker_summaries: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            threads: 1,
            commands_per_thread: DEFAULT_COMMANDS,
            op: OpKind::NoOp,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks_per_cmd: 1,
            generation: None,
            queue: QueuePolicy::default(),
            idle_wait: IdleWait::default(),
            xfer_mode: XferMode::default(),
            ns_timing: true,
            more_async: false,
            excl_waitq: false,
            force_pack_id: false,
            timeout_ms: DEF_TIMEOUT_MS,
            seed: None,
            submit: SubmitPolicy::default(),
            complete: CompletePolicy::default(),
            worker_summaries: false,
        }
    }
}

impl EngineConfig {
    /// Defaults against one whole device.
    pub fn for_device(path: impl Into<PathBuf>) -> Self {
        Self {
            devices: vec![DeviceTarget::new(path)],
            ..Default::default()
        }
    }

    /// Queue depth per worker.
    pub fn queue_depth(&self) -> u32 {
        self.queue.max_queue_depth
    }

    /// Set queue depth per worker.
    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue.max_queue_depth = depth;
        self
    }

    /// Set favor policy.
    pub fn with_favor(mut self, favor: Favor) -> Self {
        self.queue.favor = favor;
        self
    }

    /// Bytes moved by one command.
    pub fn xfer_len(&self) -> u32 {
        if self.op.needs_lba() {
            self.block_size.saturating_mul(self.blocks_per_cmd)
        } else {
            0
        }
    }

    /// Bytes one completed command moves; 0 when the transfer is suppressed.
    pub fn bytes_per_cmd(&self) -> u32 {
        if self.xfer_mode == XferMode::NoXfer {
            0
        } else {
            self.xfer_len()
        }
    }

    /// Session negotiation derived from this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            generation: self.generation,
            ns_timing: self.ns_timing,
            more_async: self.more_async,
            excl_waitq: self.excl_waitq,
            reserve_bytes: self.xfer_len() as usize,
            force_pack_id: self.force_pack_id,
        }
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        if self.threads == 0 {
            return Err(ConfigError::Zero("threads"));
        }
        if self.commands_per_thread == 0 {
            return Err(ConfigError::Zero("commands per thread"));
        }
        if self.queue.max_queue_depth == 0 {
            return Err(ConfigError::Zero("queue depth"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Zero("command timeout"));
        }
        if self.op.needs_lba() {
            if self.block_size == 0 {
                return Err(ConfigError::Zero("block size"));
            }
            if self.blocks_per_cmd == 0 {
                return Err(ConfigError::Zero("blocks per command"));
            }
            if self.block_size.checked_mul(self.blocks_per_cmd).is_none() {
                return Err(ConfigError::TransferTooLarge {
                    block_size: self.block_size,
                    blocks: self.blocks_per_cmd,
                });
            }
            for dev in &self.devices {
                if let LbaRange::Bounded { start, end } = dev.lba {
                    if start >= end {
                        return Err(ConfigError::EmptyLbaRange { start, end });
                    }
                    check_span(start, end, self.blocks_per_cmd)?;
                }
            }
        }
        if self.xfer_mode == XferMode::Mmap && self.queue.max_queue_depth > 1 {
            return Err(ConfigError::MmapQueueDepth(self.queue.max_queue_depth));
        }
        Ok(())
    }
}

/// The range must hold at least one command's worth of blocks.
pub fn check_span(start: u64, end: u64, blocks: u32) -> Result<(), ConfigError> {
    let span = end - start;
    if span < u64::from(blocks) {
        return Err(ConfigError::RangeTooSmall { span, blocks });
    }
    Ok(())
}
