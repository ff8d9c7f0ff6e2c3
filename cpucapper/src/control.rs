//! Flags shared between signal handlers and the control loop.
//!
//! Every method here is async-signal-safe: plain atomic loads and stores
//! plus bounded compare-exchange loops, no allocation and no blocking
//! locks. The whole surface may therefore be driven from a signal handler
//! while the control loop reads it.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Control plane of a running limiter.
pub struct Controls {
    /// One-shot stop request.
    quit: AtomicBool,
    /// Requested limit, in percent of total CPU (100 = one full core).
    percent: AtomicI32,
    /// Upper clamp for the limit, normally `100 * ncpu`.
    max_percent: AtomicI32,
}

impl Controls {
    pub const fn new() -> Self {
        Self {
            quit: AtomicBool::new(false),
            percent: AtomicI32::new(0),
            max_percent: AtomicI32::new(i32::MAX),
        }
    }

    /// Asks the control loop to wind down after the current period.
    pub fn request_stop(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Sets the ceiling that `raise` and `set_percent` clamp against.
    pub fn set_max_percent(&self, max: i32) {
        self.max_percent.store(max.max(0), Ordering::Relaxed);
    }

    /// Replaces the limit, clamped to `[0, max]`.
    pub fn set_percent(&self, percent: i32) {
        let max = self.max_percent.load(Ordering::Relaxed);
        self.percent.store(percent.clamp(0, max), Ordering::Relaxed);
    }

    pub fn percent(&self) -> i32 {
        self.percent.load(Ordering::Relaxed)
    }

    /// Current limit as a fraction of one core (1.0 = one full CPU).
    pub fn fraction(&self) -> f64 {
        f64::from(self.percent()) / 100.0
    }

    /// Bumps the limit by one percent, up to the ceiling.
    pub fn raise(&self) {
        let max = self.max_percent.load(Ordering::Relaxed);
        let _ = self
            .percent
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(1).min(max))
            });
    }

    /// Drops the limit by one percent, down to zero.
    pub fn lower(&self) {
        let _ = self
            .percent
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1).max(0))
            });
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stop_request_latches() {
        let controls = Controls::new();
        assert!(!controls.should_stop());
        controls.request_stop();
        assert!(controls.should_stop());
        assert!(controls.should_stop());
    }

    #[test]
    fn percent_clamps_to_the_ceiling() {
        let controls = Controls::new();
        controls.set_max_percent(200);

        controls.set_percent(250);
        assert_eq!(controls.percent(), 200);

        controls.set_percent(-5);
        assert_eq!(controls.percent(), 0);

        controls.set_percent(150);
        assert!((controls.fraction() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn raise_and_lower_step_by_one_percent() {
        let controls = Controls::new();
        controls.set_max_percent(101);
        controls.set_percent(100);

        controls.raise();
        assert_eq!(controls.percent(), 101);
        controls.raise();
        assert_eq!(controls.percent(), 101);

        controls.set_percent(1);
        controls.lower();
        assert_eq!(controls.percent(), 0);
        controls.lower();
        assert_eq!(controls.percent(), 0);
    }
}
