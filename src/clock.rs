//! Monotonic clock and tick interval (C7).
//!
//! Ticks are not a separate thread here: the network loop's bounded read
//! (§5, "the engine's network loop blocks only on the inbound queue with
//! a timeout equal to the tick interval") already produces a tick every
//! time no segment arrives within [`TICK_INTERVAL`]. Retransmission and
//! handshake/termination timeout checks always read [`now`] directly
//! rather than counting ticks, per spec.md §4.7.

use std::time::{Duration, Instant};

use crate::config::TIMER_TICK_MS;

pub const TICK_INTERVAL: Duration = Duration::from_millis(TIMER_TICK_MS);

pub fn now() -> Instant {
    Instant::now()
}

/// A single point in the future, compared against [`now`] on every poll.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(d: Duration) -> Deadline {
        Deadline(now() + d)
    }

    pub fn has_passed(&self) -> bool {
        now() >= self.0
    }
}

/// What to do about a bounded-retry wait (handshake or termination).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Deadline not yet reached; keep waiting.
    Pending,
    /// Deadline reached and attempts remain: resend and rearm.
    Retry,
    /// Deadline reached and the attempt budget is spent.
    Exhausted,
}

/// Drives the bounded-retry loop used by the handshake and termination
/// state transitions (spec.md §9: retries must be bounded, never
/// infinite).
#[derive(Debug, Clone, Copy)]
pub struct RetryTimer {
    deadline: Deadline,
    attempts: u32,
    max_attempts: u32,
}

impl RetryTimer {
    pub fn start(timeout: Duration, max_attempts: u32) -> RetryTimer {
        RetryTimer {
            deadline: Deadline::after(timeout),
            attempts: 0,
            max_attempts,
        }
    }

    pub fn poll(&mut self, timeout: Duration) -> RetryOutcome {
        if !self.deadline.has_passed() {
            return RetryOutcome::Pending;
        }
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return RetryOutcome::Exhausted;
        }
        self.deadline = Deadline::after(timeout);
        RetryOutcome::Retry
    }
}
