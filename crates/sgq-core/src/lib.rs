//! Asynchronous multi-threaded command engine for Linux SCSI-generic devices.
//!
//! Each worker thread keeps a bounded number of SCSI commands in flight on
//! one `/dev/sgN` node, using either the legacy v3 (`write()`/`read()`) or
//! the extended v4 (`SG_IOSUBMIT`/`SG_IORECEIVE`) asynchronous interface.
//! Completions are matched to requests by pack_id and may arrive in any
//! order. Totals are kept in lock-free counters and reported after all
//! workers join.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use sgq_core::{Engine, EngineConfig, MemDisk, MemOpener};
//!
//! let opener = MemOpener::new().with_disk("/dev/sg0", MemDisk::new(1024, 512));
//! let config = EngineConfig {
//!     threads: 2,
//!     commands_per_thread: 100,
//!     seed: Some(1),
//!     ..EngineConfig::for_device("/dev/sg0")
//! };
//!
//! let summary = Engine::new(config, Arc::new(opener)).run().unwrap();
//! assert!(summary.all_succeeded());
//! assert_eq!(summary.report.completed, 200);
//! ```

#![deny(missing_docs)]
#![deny(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic))]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]

pub mod buffer;
pub mod cdb;
pub mod complete;
pub mod config;
pub mod engine;
pub mod error;
pub mod inflight;
pub mod policy;
pub mod retry;
pub mod sense;
pub mod session;
pub mod sg;
pub mod stats;
pub mod submit;
pub mod worker;

pub use buffer::{AlignedBuf, BufferPool, BufferPoolStats};
pub use cdb::{Capacity, Command, Direction, OpKind};
pub use complete::{complete, CompleteOutcome, CompletePolicy, Completed};
pub use config::{DeviceTarget, EngineConfig, LbaRange, ResolvedTarget, XferMode};
pub use engine::{Engine, RunSummary};
pub use error::{BufferError, ConfigError, EngineError, SessionError};
pub use inflight::{InFlight, Slot};
pub use policy::{Action, Favor, IdleWait, LoopSnapshot, QueuePolicy};
pub use retry::{Backoff, RetryPolicy};
pub use sense::Category;
pub use session::{DeviceSession, Features, SessionOptions};
pub use sg::{
    format_version, DeviceOpener, FaultPlan, Generation, MemDevice, MemDisk, MemOpener, SgDevice,
    SysOpener,
};
pub use stats::{Console, EntropySource, Report, Shared, Stats, StatsSnapshot};
pub use submit::{submit, CommandFlags, DomainErrorPolicy, Pending, SubmitOutcome, SubmitPolicy};
pub use worker::{run_worker, WorkerContext, WorkerReport};
