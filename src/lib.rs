//! # sgq
//!
//! Asynchronous multi-threaded command engine for Linux SCSI-generic
//! (`/dev/sgN`) devices.
//!
//! This is the workspace root crate that re-exports the engine. The
//! workspace members are:
//!
//! - [`sgq-core`] - session negotiation, submit/receive engines, queue
//!   policy, worker threads and statistics
//! - [`sgq-bench`] - the `sgq-bench` command-line benchmark
//!
//! [`sgq-core`]: sgq_core
//! [`sgq-bench`]: https://docs.rs/sgq-bench

pub use sgq_core::*;
