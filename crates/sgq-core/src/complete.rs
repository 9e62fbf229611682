//! Asynchronous completion engine
//!
//! Receives one finished command, classifies its SCSI result and records
//! counters. The returned pack_id is whatever the driver handed back, which
//! need not be the one asked for.

use crate::error::EngineError;
use crate::inflight::InFlight;
use crate::retry::{Backoff, RetryPolicy, RetryStep};
use crate::sense::{classify, Category};
use crate::session::DeviceSession;
use crate::sg::Generation;
use crate::stats::LocalCounters;
use nix::libc;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, trace, warn};

/// Default transient-error retries per completion.
pub const DEFAULT_COMPLETE_RETRIES: u32 = 100_000;

/// Retry ceiling and pause for receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletePolicy {
    /// Bound on `EAGAIN`/`EBUSY` (and legacy `ENOMEM`) retries.
    pub retry: RetryPolicy,
}

impl Default for CompletePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(DEFAULT_COMPLETE_RETRIES).with_backoff(Backoff::Yield),
        }
    }
}

/// A successfully finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed {
    /// The pack_id that actually completed.
    pub pack_id: i32,
    /// Duration, driver-measured when nanosecond timing was granted and
    /// wall-clock since submission otherwise.
    pub duration: Duration,
    /// Whether the device reported RECOVERED ERROR.
    pub recovered: bool,
    /// Bytes the device did not transfer.
    pub resid: i32,
}

/// Result of one receive.
#[derive(Debug)]
pub enum CompleteOutcome {
    /// A command finished cleanly or with a recovered error.
    Ok(Completed),
    /// The worker must stop.
    Fatal(EngineError),
}

/// Receive one completion.
///
/// `wanted` is passed through to the driver; it only has an effect when the
/// session forces pack_id matching. The slot for the returned pack_id is left
/// in `inflight` for the caller to remove.
pub fn complete(
    session: &DeviceSession,
    op: &'static str,
    wanted: Option<i32>,
    policy: &CompletePolicy,
    inflight: &InFlight,
    counters: &mut LocalCounters,
) -> CompleteOutcome {
    let legacy = session.generation() == Generation::Legacy;
    let mut retry = policy.retry.start();

    let raw = loop {
        let err = match session.receive(wanted) {
            Ok(raw) => break raw,
            Err(e) => e,
        };
        let errno = err.raw_os_error().unwrap_or(0);
        match errno {
            libc::EAGAIN => counters.eagain += 1,
            libc::EBUSY => counters.ebusy += 1,
            libc::ENOMEM if legacy => counters.enomem += 1,
            _ => {
                error!(op, errno, error = %err, "receive failed");
                return CompleteOutcome::Fatal(EngineError::Receive { op, source: err });
            }
        }
        if retry.step() == RetryStep::Exhausted {
            let attempts = retry.attempts() + 1;
            error!(op, errno, attempts, "receive retries exhausted");
            return CompleteOutcome::Fatal(EngineError::RetriesExhausted { op, attempts });
        }
    };

    let (Some(slot), Some(sense)) = (
        inflight.get(raw.pack_id),
        inflight.sense_of(raw.pack_id, usize::from(raw.sense_len)),
    ) else {
        error!(op, pack_id = raw.pack_id, "completion for a pack_id that is not in flight");
        return CompleteOutcome::Fatal(EngineError::UnknownPackId(raw.pack_id));
    };

    let category = classify(raw.status, raw.host_status, raw.driver_status, sense);
    let recovered = match category {
        Category::Clean => false,
        Category::Recovered => {
            counters.recovered += 1;
            warn!(op, pack_id = raw.pack_id, lba = ?slot.lba, "recovered error");
            true
        }
        category => {
            error!(op, pack_id = raw.pack_id, lba = ?slot.lba, %category, "command failed");
            return CompleteOutcome::Fatal(EngineError::CommandFailed {
                op,
                pack_id: raw.pack_id,
                category,
            });
        }
    };

    let duration = session
        .duration_of(&raw)
        .unwrap_or_else(|| slot.submitted_at.elapsed());
    counters.finishes += 1;
    counters.record_latency(duration);
    trace!(op, pack_id = raw.pack_id, ?duration, "completed");

    CompleteOutcome::Ok(Completed {
        pack_id: raw.pack_id,
        duration,
        recovered,
        resid: raw.resid,
    })
}
