//! Error types for sgq-core.

use crate::sense::Category;
use crate::sg::Generation;
use nix::libc;
use thiserror::Error;

/// Errors raised while opening and negotiating a device session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The device node could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Device path.
        path: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A control ioctl failed.
    #[error("{what} on {path} failed: {source}")]
    Control {
        /// Device path.
        path: String,
        /// Which control operation.
        what: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The driver is older than the asynchronous interface requires.
    #[error("{path}: sg driver version {found} is older than required {required}")]
    VersionTooOld {
        /// Device path.
        path: String,
        /// Reported version number.
        found: i32,
        /// Minimum accepted version number.
        required: i32,
    },

    /// The requested protocol generation is not offered by this driver.
    #[error("{path}: {generation} interface needs sg driver {required} or later (found {found})")]
    GenerationUnavailable {
        /// Device path.
        path: String,
        /// Requested generation.
        generation: Generation,
        /// Reported version number.
        found: i32,
        /// Version that introduced the generation.
        required: i32,
    },

    /// READ CAPACITY during setup did not succeed.
    #[error("{path}: READ CAPACITY failed: {reason}")]
    Capacity {
        /// Device path.
        path: String,
        /// Why it failed.
        reason: String,
    },
}

/// Errors from the per-thread buffer pool.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The requested size/alignment cannot form a layout.
    #[error("invalid buffer layout: {len} bytes aligned to {align}")]
    Layout {
        /// Requested length.
        len: usize,
        /// Requested alignment.
        align: usize,
    },

    /// The allocator returned null.
    #[error("allocation of {0} bytes failed")]
    AllocationFailed(usize),
}

/// Invalid engine configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No devices were given.
    #[error("at least one device is required")]
    NoDevices,

    /// A field that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// LBA range is empty or inverted.
    #[error("LBA range {start}..{end} is empty")]
    EmptyLbaRange {
        /// First LBA.
        start: u64,
        /// One past the last LBA.
        end: u64,
    },

    /// The range cannot hold a single command's worth of blocks.
    #[error("LBA range of {span} blocks cannot hold {blocks} blocks per command")]
    RangeTooSmall {
        /// Blocks in the range.
        span: u64,
        /// Blocks per command.
        blocks: u32,
    },

    /// Transfer size overflows the 32-bit transfer length.
    #[error("transfer of {block_size} x {blocks} bytes is too large")]
    TransferTooLarge {
        /// Block size.
        block_size: u32,
        /// Blocks per command.
        blocks: u32,
    },

    /// mmap transfers share the single reserved buffer.
    #[error("mmap transfer mode requires a queue depth of 1 (got {0})")]
    MmapQueueDepth(u32),
}

/// Errors that stop a worker or the whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Session setup failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Buffer pool failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Submission failed with a non-retriable error.
    #[error("{op} submit failed for pack_id {pack_id}: {source}")]
    Submit {
        /// Operation name.
        op: &'static str,
        /// Correlation id.
        pack_id: i32,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Receive failed with a non-retriable error.
    #[error("{op} receive failed: {source}")]
    Receive {
        /// Operation name.
        op: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A bounded retry loop gave up.
    #[error("{op}: gave up after {attempts} attempts")]
    RetriesExhausted {
        /// Operation name.
        op: &'static str,
        /// Attempts made.
        attempts: u32,
    },

    /// The device completed a command with a failing status.
    #[error("{op} pack_id {pack_id} failed: {category}")]
    CommandFailed {
        /// Operation name.
        op: &'static str,
        /// Correlation id.
        pack_id: i32,
        /// Result category.
        category: Category,
    },

    /// A correlation id was tracked twice.
    #[error("pack_id {0} is already in flight")]
    DuplicatePackId(i32),

    /// The driver returned a correlation id this thread never submitted.
    #[error("completion for unknown pack_id {0}")]
    UnknownPackId(i32),

    /// Setup-time failure outside the session (entropy source, etc).
    #[error("setup failed: {0}")]
    Setup(String),

    /// A worker thread panicked.
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}

impl EngineError {
    /// Raw errno carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Submit { source, .. } | Self::Receive { source, .. } => source.raw_os_error(),
            Self::Session(
                SessionError::Open { source, .. } | SessionError::Control { source, .. },
            ) => source.raw_os_error(),
            _ => None,
        }
    }

    /// Returns true for kernel resource pressure that a retry could clear.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.errno(),
            Some(libc::EAGAIN | libc::EBUSY | libc::ENOMEM)
        )
    }
}
