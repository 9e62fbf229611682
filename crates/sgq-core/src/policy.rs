//! Queue/scheduling policy
//!
//! Decides, once per loop iteration, whether a worker submits, drains, waits
//! or stops. The decision is a pure function of a [`LoopSnapshot`], so the
//! policy is tested without a device.

use crate::session::DeviceSession;
use serde::Serialize;
use std::io;
use std::time::Duration;

/// Default per-worker queue depth.
pub const DEFAULT_QUEUE_DEPTH: u32 = 4;

/// Fixed sleep used when readiness polling is off.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Which side of the loop gets priority when completions are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Favor {
    /// Drain everything that is ready.
    Complete,
    /// Drain half of what is ready.
    #[default]
    Balanced,
    /// Keep submitting; drain one at a time until the watermark is crossed.
    Submit,
}

/// Queue depth and favor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueuePolicy {
    /// Most commands outstanding at once.
    pub max_queue_depth: u32,
    /// Drain priority.
    pub favor: Favor,
    /// Outstanding count at which `Favor::Submit` starts draining harder.
    pub watermark: Option<u32>,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_queue_depth: DEFAULT_QUEUE_DEPTH,
            favor: Favor::default(),
            watermark: None,
        }
    }
}

/// Loop state the policy decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSnapshot {
    /// Commands accepted so far (an encore is not counted until accepted).
    pub submitted: u64,
    /// Commands this worker must complete.
    pub target: u64,
    /// Commands in the driver.
    pub outstanding: u32,
    /// Completions ready to receive.
    pub ready: u32,
    /// A queue-full signal is waiting for one completion to be drained.
    pub force_drain: bool,
}

/// What the worker does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Submit one command (or the pending encore).
    Submit,
    /// Receive this many completions.
    Drain(u32),
    /// Nothing to do until a completion arrives.
    Wait,
    /// Target reached and nothing outstanding.
    Done,
}

impl QueuePolicy {
    /// Whether another command may enter the driver.
    pub fn can_submit(&self, s: &LoopSnapshot) -> bool {
        s.submitted < s.target && s.outstanding < self.max_queue_depth
    }

    /// Whether `Favor::Submit` should back off.
    pub fn over_watermark(&self, s: &LoopSnapshot) -> bool {
        self.watermark.is_some_and(|w| s.outstanding >= w)
    }

    /// Completions to receive when `s.ready > 0`.
    pub fn drain_count(&self, s: &LoopSnapshot) -> u32 {
        let half = (s.ready / 2).max(1);
        match (s.ready, self.favor) {
            (0 | 1, _) => 1,
            (ready, Favor::Complete) => ready,
            (_, Favor::Balanced) => half,
            (_, Favor::Submit) if self.over_watermark(s) => half,
            (_, Favor::Submit) => 1,
        }
    }

    /// Choose the next action.
    pub fn next_action(&self, s: &LoopSnapshot) -> Action {
        if s.submitted >= s.target && s.outstanding == 0 {
            return Action::Done;
        }
        if s.force_drain && s.outstanding > 0 {
            // the encore waits for a completion that is actually there
            return if s.ready > 0 { Action::Drain(1) } else { Action::Wait };
        }
        if s.ready > 0 {
            if self.favor == Favor::Submit && self.can_submit(s) && !self.over_watermark(s) {
                return Action::Submit;
            }
            return Action::Drain(self.drain_count(s));
        }
        if self.can_submit(s) {
            Action::Submit
        } else {
            Action::Wait
        }
    }
}

/// How a worker waits when it can neither submit nor drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IdleWait {
    /// Poll the device for readability with this timeout.
    Poll(Duration),
    /// Sleep a fixed time.
    Sleep(Duration),
}

impl Default for IdleWait {
    fn default() -> Self {
        Self::Sleep(DEFAULT_IDLE_SLEEP)
    }
}

impl IdleWait {
    /// Wait once.
    pub fn wait(&self, session: &DeviceSession) -> io::Result<()> {
        match *self {
            Self::Poll(timeout) => session.wait_readable(timeout).map(drop),
            Self::Sleep(d) => {
                std::thread::sleep(d);
                Ok(())
            }
        }
    }
}
