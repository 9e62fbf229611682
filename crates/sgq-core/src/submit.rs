//! Asynchronous submission engine
//!
//! Hands one command to the driver without waiting for it. Resource
//! pressure is retried in place; a full queue is reported back so the
//! caller can drain and then resubmit the same request unchanged.

use crate::buffer::AlignedBuf;
use crate::cdb::{Command, Direction};
use crate::error::EngineError;
use crate::retry::{Backoff, RetryPolicy, RetryStep};
use crate::session::DeviceSession;
use crate::sg::protocol::Request;
use crate::sg::sys::{SENSE_BUFF_LEN, SG_FLAG_MMAP_IO};
use crate::stats::LocalCounters;
use nix::libc;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

/// Default `ENOMEM` retries per submission.
pub const DEFAULT_PRESSURE_RETRIES: u32 = 16;
/// Default `EAGAIN`/`EBUSY` retries per submission.
pub const DEFAULT_BUSY_RETRIES: u32 = 10_000;

/// What to do when the driver rejects a submission with `EDOM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainErrorPolicy {
    /// Count it and stop the worker.
    #[default]
    Fail,
    /// Count it and retry like `EAGAIN`.
    Retry,
}

/// Retry ceilings for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitPolicy {
    /// `ENOMEM` handling.
    pub pressure: RetryPolicy,
    /// `EAGAIN`/`EBUSY` handling.
    pub busy: RetryPolicy,
    /// `EDOM` handling.
    pub domain: DomainErrorPolicy,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self {
            pressure: RetryPolicy::new(DEFAULT_PRESSURE_RETRIES).with_backoff(Backoff::Yield),
            busy: RetryPolicy::new(DEFAULT_BUSY_RETRIES).with_backoff(Backoff::Yield),
            domain: DomainErrorPolicy::Fail,
        }
    }
}

/// Per-command driver parameters that do not change between commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags {
    /// `SG_FLAG_*` bits.
    pub flags: u32,
    /// Per-command timeout in milliseconds.
    pub timeout_ms: u32,
}

/// A request on its way into the driver.
#[derive(Debug)]
pub struct Pending {
    /// Correlation id.
    pub pack_id: i32,
    /// Buffer the request owns.
    pub buf: AlignedBuf,
    /// Target LBA for read/write.
    pub lba: Option<u64>,
}

/// Result of one submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The driver accepted the request.
    Ok(Pending),
    /// The driver queue is full; drain one completion and resubmit this
    /// request unchanged.
    RetryAfterDrain(Pending),
    /// Unrecoverable; the request never entered the driver.
    Fatal {
        /// The request, so its buffer can go back to the pool.
        pending: Pending,
        /// Why.
        error: EngineError,
    },
}

/// Submit `cmd` for `pending`.
///
/// Only `counters` is updated; shared totals are merged by the caller.
pub fn submit(
    session: &DeviceSession,
    cmd: &Command,
    cmd_flags: &CommandFlags,
    mut pending: Pending,
    policy: &SubmitPolicy,
    counters: &mut LocalCounters,
) -> SubmitOutcome {
    let op = cmd.name();
    let moves_data = cmd.direction() != Direction::None;
    let data = if moves_data && cmd_flags.flags & SG_FLAG_MMAP_IO == 0 {
        pending.buf.as_mut_ptr()
    } else {
        std::ptr::null_mut()
    };
    let req = Request {
        cdb: cmd.as_bytes(),
        pack_id: pending.pack_id,
        direction: cmd.direction(),
        data,
        xfer_len: cmd.xfer_len(),
        sense: pending.buf.sense_ptr(),
        sense_len: SENSE_BUFF_LEN as u8,
        flags: if moves_data { cmd_flags.flags } else { 0 },
        timeout_ms: cmd_flags.timeout_ms,
    };

    let mut pressure = policy.pressure.start();
    let mut busy = policy.busy.start();
    loop {
        let err = match session.submit(&req) {
            Ok(()) => {
                counters.starts += 1;
                trace!(op, pack_id = pending.pack_id, "submitted");
                return SubmitOutcome::Ok(pending);
            }
            Err(e) => e,
        };

        let errno = err.raw_os_error().unwrap_or(0);
        let step = match errno {
            libc::ENOMEM => {
                counters.enomem += 1;
                pressure.step()
            }
            libc::EAGAIN => {
                counters.eagain += 1;
                busy.step()
            }
            libc::EBUSY => {
                counters.ebusy += 1;
                busy.step()
            }
            libc::E2BIG => {
                counters.e2big += 1;
                debug!(op, pack_id = pending.pack_id, "driver queue full, draining before encore");
                return SubmitOutcome::RetryAfterDrain(pending);
            }
            libc::EDOM => {
                counters.edom += 1;
                warn!(op, pack_id = pending.pack_id, policy = ?policy.domain, "submit returned EDOM");
                match policy.domain {
                    DomainErrorPolicy::Retry => busy.step(),
                    DomainErrorPolicy::Fail => RetryStep::Exhausted,
                }
            }
            _ => {
                error!(op, pack_id = pending.pack_id, errno, error = %err, "submit failed");
                let error = EngineError::Submit {
                    op,
                    pack_id: pending.pack_id,
                    source: err,
                };
                return SubmitOutcome::Fatal { pending, error };
            }
        };

        if step == RetryStep::Exhausted {
            let attempts = pressure.attempts() + busy.attempts() + 1;
            error!(op, pack_id = pending.pack_id, errno, attempts, "submit retries exhausted");
            let error = if errno == libc::EDOM && policy.domain == DomainErrorPolicy::Fail {
                EngineError::Submit {
                    op,
                    pack_id: pending.pack_id,
                    source: err,
                }
            } else {
                EngineError::RetriesExhausted { op, attempts }
            };
            return SubmitOutcome::Fatal { pending, error };
        }
    }
}
