//! Track the CPU usage of a target process family.
//!
//! The group keeps one record per PID in a fixed bucket table so a process
//! keeps its smoothed usage estimate across refreshes, while the live
//! member list is rebuilt from scratch on every refresh.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::pid::Signal;
use crate::process_iterator::{ProcessIterator, Scope};
use crate::Pid;

/// Indicates whether the child processes should be tracked too.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ChildrenMode {
    Include,
    #[default]
    Exclude,
}

/// Smoothing coefficient of the per-process usage estimate.
///
/// The STOP/CONT cycle itself makes the raw samples oscillate wildly; the
/// moving average is what the controller steers on.
const ALPHA: f64 = 0.08;

/// Refreshes closer together than this keep the previous estimates, so a
/// fast control loop cannot divide CPU time by a near-zero interval.
const MIN_DT: Duration = Duration::from_millis(20);

/// Fixed size of the PID-keyed bucket table.
const PIDHASH_SZ: usize = 1024;

fn pid_hash(pid: Pid) -> usize {
    let pid = u32::from(pid) as usize;
    ((pid >> 8) ^ pid) & (PIDHASH_SZ - 1)
}

/// A process the group has observed at least once.
#[derive(Clone, Debug)]
struct TrackedProcess {
    pid: Pid,
    /// Accumulated CPU time at the last accepted sample.
    cputime: Duration,
    /// Smoothed share of CPU this process is using, `None` until the first
    /// sample lands.
    cpu_usage: Option<f64>,
}

impl TrackedProcess {
    /// Folds a fresh reading into the usage estimate.
    fn observe(&mut self, cputime: Duration, dt: Duration) {
        let consumed = cputime.saturating_sub(self.cputime);
        let sample = consumed.as_secs_f64() / dt.as_secs_f64();
        self.cpu_usage = Some(match self.cpu_usage {
            None => sample,
            Some(usage) => (1.0 - ALPHA) * usage + ALPHA * sample,
        });
        self.cputime = cputime;
    }
}

/// The family of processes a limiter steers: the target plus, optionally,
/// all of its descendants.
pub struct ProcessGroup {
    target: Pid,
    children_mode: ChildrenMode,
    /// Bucketed records, owned here; entries survive refreshes so the
    /// usage estimates keep their history.
    proctable: Vec<Vec<TrackedProcess>>,
    /// PIDs observed by the most recent refresh, in iteration order.
    live: Vec<Pid>,
    last_update: Instant,
}

impl ProcessGroup {
    /// Builds the group and performs the initial refresh.
    pub fn new(target: Pid, children_mode: ChildrenMode) -> Result<Self> {
        let mut group = Self {
            target,
            children_mode,
            proctable: vec![Vec::new(); PIDHASH_SZ],
            live: Vec::new(),
            last_update: Instant::now(),
        };

        group.update()?;
        if group.live.is_empty() {
            return Err(Error::DeadTarget);
        }
        Ok(group)
    }

    fn scope(&self) -> Scope {
        match self.children_mode {
            ChildrenMode::Include => Scope::Family(self.target),
            ChildrenMode::Exclude => Scope::Single(self.target),
        }
    }

    /// Refreshes the member list and the per-process usage estimates.
    ///
    /// New members start without an estimate; existing members fold in a
    /// fresh sample when at least [`MIN_DT`] elapsed since the last
    /// accepted refresh.
    pub fn update(&mut self) -> Result<()> {
        let now = Instant::now();
        let dt = now - self.last_update;

        self.live.clear();
        for snapshot in ProcessIterator::new(self.scope())? {
            self.live.push(snapshot.pid);

            let bucket = &mut self.proctable[pid_hash(snapshot.pid)];
            match bucket.iter_mut().find(|entry| entry.pid == snapshot.pid) {
                None => bucket.push(TrackedProcess {
                    pid: snapshot.pid,
                    cputime: snapshot.cputime,
                    cpu_usage: None,
                }),
                Some(tracked) if dt >= MIN_DT => tracked.observe(snapshot.cputime, dt),
                Some(_) => {}
            }
        }

        if dt >= MIN_DT {
            self.last_update = now;
        }
        Ok(())
    }

    /// Aggregate CPU usage of the live members, as a fraction of one core,
    /// or `None` while no member has produced a sample yet.
    pub fn cpu_usage(&self) -> Option<f64> {
        let mut total = None;
        for &pid in &self.live {
            if let Some(usage) = self.tracked(pid).and_then(|entry| entry.cpu_usage) {
                *total.get_or_insert(0.0) += usage;
            }
        }
        total
    }

    fn tracked(&self, pid: Pid) -> Option<&TrackedProcess> {
        self.proctable[pid_hash(pid)]
            .iter()
            .find(|entry| entry.pid == pid)
    }

    /// Drops the cached record for `pid`, called when signal delivery
    /// proves the process gone.
    pub fn remove(&mut self, pid: Pid) {
        self.proctable[pid_hash(pid)].retain(|entry| entry.pid != pid);
    }

    /// PIDs observed by the most recent refresh.
    pub fn members(&self) -> &[Pid] {
        &self.live
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn target(&self) -> Pid {
        self.target
    }

    /// Resumes the execution of the group.
    pub fn resume(&mut self) {
        self.kill_all(Signal::SIGCONT);
    }

    /// Suspends the execution of the group.
    pub fn suspend(&mut self) {
        self.kill_all(Signal::SIGSTOP);
    }

    /// Sends `signal` to every live member, evicting the ones that no
    /// longer accept signals.
    fn kill_all(&mut self, signal: Signal) {
        let mut live = std::mem::take(&mut self.live);
        live.retain(|&pid| match pid.try_kill(signal) {
            Ok(()) => true,
            Err(_) => {
                debug!(%pid, ?signal, "signal failed, dropping dead member");
                self.remove(pid);
                false
            }
        });
        self.live = live;
    }
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn own_pid() -> Pid {
        Pid::from(std::process::id())
    }

    #[test]
    fn tracks_the_target_alone_when_children_are_excluded() {
        let group = ProcessGroup::new(own_pid(), ChildrenMode::Exclude).unwrap();
        assert_eq!(group.members(), [own_pid()]);
        assert_eq!(group.target(), own_pid());
    }

    #[test]
    fn refuses_a_dead_target() {
        let gone = Pid::from(2_147_483_646);
        assert!(matches!(
            ProcessGroup::new(gone, ChildrenMode::Exclude),
            Err(Error::DeadTarget)
        ));
    }

    #[test]
    fn usage_appears_after_a_spaced_refresh() {
        let mut group = ProcessGroup::new(own_pid(), ChildrenMode::Exclude).unwrap();
        // the initial refresh ran within MIN_DT of creation
        assert_eq!(group.cpu_usage(), None);

        thread::sleep(2 * MIN_DT);
        group.update().unwrap();
        let usage = group.cpu_usage().expect("sampled after MIN_DT");
        assert!(usage >= 0.0);
        // slack for the jiffy granularity of the cputime reads
        assert!(usage <= crate::ncpu() as f64 + 1.0);
    }

    #[test]
    fn estimates_survive_refreshes() {
        let mut group = ProcessGroup::new(own_pid(), ChildrenMode::Exclude).unwrap();
        thread::sleep(2 * MIN_DT);
        group.update().unwrap();
        assert!(group.cpu_usage().is_some());

        // back-to-back refresh is below MIN_DT, the estimate must remain
        group.update().unwrap();
        assert!(group.cpu_usage().is_some());
    }

    #[test]
    fn removal_forgets_the_record() {
        let mut group = ProcessGroup::new(own_pid(), ChildrenMode::Exclude).unwrap();
        thread::sleep(2 * MIN_DT);
        group.update().unwrap();
        assert!(group.cpu_usage().is_some());

        group.remove(own_pid());
        // the live list still names us, but the record (and estimate) is gone
        assert_eq!(group.cpu_usage(), None);

        // a later refresh re-admits the PID as a fresh record
        group.update().unwrap();
        assert_eq!(group.members(), [own_pid()]);
    }

    #[test]
    fn hash_stays_in_table_bounds() {
        for pid in [0_u32, 1, 255, 256, 1023, 1024, 65_535, u32::MAX] {
            assert!(pid_hash(Pid::from(pid)) < PIDHASH_SZ);
        }
    }

    #[test]
    fn ewma_smooths_and_stays_bounded() {
        let mut tracked = TrackedProcess {
            pid: Pid::from(42),
            cputime: Duration::ZERO,
            cpu_usage: None,
        };

        // first sample initializes the estimate directly
        tracked.observe(Duration::from_millis(50), Duration::from_millis(100));
        assert_eq!(tracked.cpu_usage, Some(0.5));

        // a zero sample only pulls the estimate down by ALPHA
        tracked.observe(Duration::from_millis(50), Duration::from_millis(100));
        let smoothed = tracked.cpu_usage.unwrap();
        assert!((smoothed - 0.5 * (1.0 - ALPHA)).abs() < 1e-9);

        // estimates never leave [0, sample_max] for in-range samples
        for _ in 0..100 {
            let next = tracked.cputime + Duration::from_millis(100);
            tracked.observe(next, Duration::from_millis(100));
            let usage = tracked.cpu_usage.unwrap();
            assert!((0.0..=1.0).contains(&usage));
        }
    }

    #[test]
    fn discovers_and_prunes_children() {
        let mut child = std::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .expect("spawn sleep");
        let child_pid = Pid::from(child.id());

        let mut group = ProcessGroup::new(own_pid(), ChildrenMode::Include).unwrap();
        assert!(group.members().contains(&own_pid()));
        assert!(group.members().contains(&child_pid));

        child.kill().ok();
        child.wait().ok();

        group.update().unwrap();
        assert!(!group.members().contains(&child_pid));
    }
}
