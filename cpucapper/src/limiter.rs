//! The closed-loop throttling controller.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::control::Controls;
use crate::error::Result;
use crate::ncpu;
use crate::process_group::{ChildrenMode, ProcessGroup};
use crate::Pid;

/// The granularity of the control slice.
///
/// Every slice splits into a work quantum, in which the members run, and a
/// sleep quantum, in which they are stopped.
pub const SLICE_DURATION: Duration = Duration::from_millis(100);

/// Keeps the duty cycle away from the degenerate endpoints: at exactly 0
/// the members would never run and never produce a fresh sample, at
/// exactly 1 they would never be stopped.
const EPSILON: f64 = 1e-12;

/// One step of the duty-cycle law.
///
/// The update is proportional in log space: when the members consumed the
/// whole work quantum (`pcpu ≈ rate`) the next rate lands on the limit
/// itself, and the dynamics stay stable while the measured usage varies by
/// orders of magnitude. Without a usable sample — first period, or every
/// member replaced since the last refresh — the rate restarts from the
/// limit.
fn next_working_rate(current: Option<f64>, limit: f64, pcpu: Option<f64>) -> f64 {
    let rate = match (current, pcpu) {
        (Some(rate), Some(pcpu)) => rate * limit / pcpu.max(EPSILON),
        _ => limit,
    };
    rate.clamp(EPSILON, 1.0 - EPSILON)
}

/// Relative sleep backing the work and sleep quanta.
///
/// TAI never jumps with wall-clock adjustments; an interrupted sleep is
/// not resumed, the controller absorbs the error in the next samples.
#[cfg(target_os = "linux")]
fn sleep_for(duration: Duration) {
    let ts = libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as _,
    };
    // SAFETY: the timespec is valid and no remainder output is requested.
    unsafe { libc::clock_nanosleep(libc::CLOCK_TAI, 0, &ts, std::ptr::null_mut()) };
}

#[cfg(not(target_os = "linux"))]
fn sleep_for(duration: Duration) {
    thread::sleep(duration);
}

/// Drives the duty cycle until a stop is requested or the group dies.
///
/// Each period refreshes the group, derives the next work/sleep split from
/// the measured usage, then resumes the members for the work quantum and
/// stops them for the sleep quantum. On the way out every remaining member
/// is resumed, so nothing is left frozen behind us.
pub fn run(group: &RwLock<ProcessGroup>, controls: &Controls) -> Result<()> {
    let mut working_rate: Option<f64> = None;
    let mut cycle = 0_u32;

    while !controls.should_stop() {
        let limit = controls.fraction();

        if let Err(err) = group.write().update() {
            group.write().resume();
            return Err(err);
        }
        if group.read().is_empty() {
            debug!("no more processes in the group");
            return Ok(());
        }

        let pcpu = group.read().cpu_usage();
        let rate = next_working_rate(working_rate, limit, pcpu);
        working_rate = Some(rate);

        let work_time = SLICE_DURATION.mul_f64(rate);
        let sleep_time = SLICE_DURATION - work_time;

        if cycle % 10 == 0 {
            debug!(
                limit_pct = limit * 100.0,
                cpu_pct = pcpu.unwrap_or(limit) * 100.0,
                work_us = work_time.as_micros() as u64,
                sleep_us = sleep_time.as_micros() as u64,
                rate_pct = rate * 100.0,
                "control statistics"
            );
        }
        cycle = cycle.wrapping_add(1);

        group.write().resume();
        sleep_for(work_time);

        if sleep_time > Duration::ZERO {
            group.write().suspend();
            sleep_for(sleep_time);
        }
    }

    // a member could still be sitting in SIGSTOP from the last slice
    group.write().resume();
    Ok(())
}

/// A handle to manage the CPU limit enforced on a target process.
///
/// Dropping the handle does not stop the limiter; call [`CpuLimit::stop`]
/// to wind it down and resume the target.
#[derive(Clone)]
pub struct CpuLimit {
    controls: Arc<Controls>,
    group: Arc<RwLock<ProcessGroup>>,
}

impl CpuLimit {
    /// Limits the CPU time of the target process only.
    pub fn new(pid: Pid, percent: u32) -> Result<Self> {
        Self::start_limit(pid, percent, ChildrenMode::Exclude)
    }

    /// Limits the CPU time of the target process and its descendants.
    pub fn new_with_children(pid: Pid, percent: u32) -> Result<Self> {
        Self::start_limit(pid, percent, ChildrenMode::Include)
    }

    fn start_limit(pid: Pid, percent: u32, children_mode: ChildrenMode) -> Result<Self> {
        let controls = Arc::new(Controls::new());
        controls.set_max_percent(100 * ncpu() as i32);
        controls.set_percent(i32::try_from(percent).unwrap_or(i32::MAX));

        let group = Arc::new(RwLock::new(ProcessGroup::new(pid, children_mode)?));

        let thread_group = Arc::clone(&group);
        let thread_controls = Arc::clone(&controls);
        thread::Builder::new()
            .name("cpucap-limiter".into())
            .spawn(move || {
                if let Err(err) = run(&thread_group, &thread_controls) {
                    warn!(%err, "limiter stopped");
                }
            })?;

        Ok(CpuLimit { controls, group })
    }

    /// Updates the limit applied to the target process.
    pub fn set_limit(&self, percent: u32) {
        self.controls
            .set_percent(i32::try_from(percent).unwrap_or(i32::MAX));
    }

    /// Asks the limiting thread to stop and resume the target.
    pub fn stop(&self) {
        self.controls.request_stop();
    }

    /// Smoothed CPU usage of the group, as a fraction of one core, or
    /// `None` before the first sample.
    pub fn cpu_usage(&self) -> Option<f64> {
        self.group.read().cpu_usage()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_period_starts_from_the_limit() {
        assert_eq!(next_working_rate(None, 0.3, None), 0.3);
        // stale rate without a usable sample also restarts from the limit
        assert_eq!(next_working_rate(Some(0.9), 0.3, None), 0.3);
    }

    #[test]
    fn adjustment_is_proportional() {
        // members used exactly the allowed share, the rate converges on it
        let rate = next_working_rate(Some(0.5), 0.25, Some(0.5));
        assert!((rate - 0.25).abs() < 1e-9);

        // overconsumption shrinks the quantum, underconsumption grows it
        assert!(next_working_rate(Some(0.5), 0.25, Some(1.0)) < 0.25);
        assert!(next_working_rate(Some(0.2), 0.25, Some(0.1)) > 0.2);
    }

    #[test]
    fn rate_is_clamped_away_from_the_endpoints() {
        let low = next_working_rate(Some(0.5), 0.0, Some(4.0));
        assert!(low >= EPSILON);

        let high = next_working_rate(Some(0.9), 8.0, Some(1e-30));
        assert!(high <= 1.0 - EPSILON);
    }

    #[test]
    fn quanta_partition_the_slice() {
        for rate in [EPSILON, 0.25, 0.5, 0.99, 1.0 - EPSILON] {
            let work = SLICE_DURATION.mul_f64(rate);
            let sleep = SLICE_DURATION - work;
            assert_eq!(work + sleep, SLICE_DURATION);
        }
    }

    #[test]
    fn full_rate_leaves_no_sleep_quantum() {
        let work = SLICE_DURATION.mul_f64(1.0 - EPSILON);
        assert_eq!(SLICE_DURATION - work, Duration::ZERO);
    }
}
