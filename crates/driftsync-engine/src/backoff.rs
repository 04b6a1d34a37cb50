//! Back-off timers
//!
//! Blocked nodes are retried on a doubling schedule rather than every
//! tick. The engine's internal clock is deciseconds, matching the scan
//! debounce granularity; the host advances it via
//! [`EngineContext::begin_tick`](crate::engine::EngineContext::begin_tick).

/// Engine time in deciseconds.
pub type Ds = u64;

/// Initial retry delay for a newly blocked node (5 s).
const INITIAL_DELAY_DS: Ds = 50;

/// Retry delays stop growing here (10 min).
const MAX_DELAY_DS: Ds = 6000;

/// A doubling retry timer.
///
/// `armed` flips true once the deadline passes; re-blocking the node
/// calls [`BackoffTimer::rearm`], which doubles the delay up to the
/// cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffTimer {
    deadline: Ds,
    delay: Ds,
}

impl BackoffTimer {
    /// Start a timer with the initial delay.
    #[must_use]
    pub fn new(now: Ds) -> Self {
        Self {
            deadline: now + INITIAL_DELAY_DS,
            delay: INITIAL_DELAY_DS,
        }
    }

    /// True once the deadline has passed.
    #[must_use]
    pub fn armed(&self, now: Ds) -> bool {
        now >= self.deadline
    }

    /// Deciseconds until the deadline (0 if already armed).
    #[must_use]
    pub fn retry_in(&self, now: Ds) -> Ds {
        self.deadline.saturating_sub(now)
    }

    /// Double the delay (capped) and push the deadline out again.
    pub fn rearm(&mut self, now: Ds) {
        self.delay = (self.delay * 2).min(MAX_DELAY_DS);
        self.deadline = now + self.delay;
    }
}
