//! Single-shot cycle timer.
//!
//! The timer holds a deadline rather than a running task. Whoever drives the
//! coordinator (the [`crate::driver`] task, or a test) waits for
//! [`CycleTimer::deadline`] and then calls
//! [`crate::coordinator::ReadCoordinator::handle_timer_expired`]. Nothing
//! outlives the coordinator that owns the timer, so dropping the coordinator
//! stops it.
//!
//! Firing disarms the timer. Only the coordinator rearms it, after a cycle
//! completes, so two cycles can never overlap.

use std::time::Duration;
use tokio::time::Instant;

/// Deadline-based single-shot timer.
#[derive(Debug, Clone, Default)]
pub struct CycleTimer {
    interval: Option<Duration>,
    deadline: Option<Instant>,
}

impl CycleTimer {
    /// Timer with `period_ms` as interval; non-positive periods leave it
    /// without an interval, so it never starts.
    pub fn new(period_ms: i64) -> Self {
        let mut timer = Self::default();
        timer.set_interval(period_ms);
        timer
    }

    /// Change the interval. An armed deadline is left alone.
    pub fn set_interval(&mut self, period_ms: i64) {
        self.interval = u64::try_from(period_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
    }

    /// Current interval.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Arm one shot `interval` after `now`. Returns `false` without an interval.
    pub fn start_at(&mut self, now: Instant) -> bool {
        match self.interval {
            Some(interval) => {
                self.deadline = Some(now + interval);
                true
            }
            None => false,
        }
    }

    /// Arm one shot `interval` from now.
    pub fn start(&mut self) -> bool {
        self.start_at(Instant::now())
    }

    /// Disarm.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Whether a shot is pending.
    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    /// When the pending shot fires.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the shot if it is due at `now`.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
