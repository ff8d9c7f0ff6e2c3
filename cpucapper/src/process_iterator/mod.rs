//! Enumerate processes and read per-PID snapshots.
//!
//! Each platform backend exposes the same `ProcessIterator` type: a finite
//! stream of [`ProcessSnapshot`]s selected by a [`Scope`]. Per-PID read
//! failures (the process died mid-iteration, permission denied) silently
//! skip that PID; only iteration *setup* failures surface as errors.

use std::time::Duration;

use crate::Pid;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "freebsd")]
mod freebsd;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
use linux as platform;

#[cfg(target_os = "freebsd")]
use freebsd as platform;

#[cfg(target_os = "macos")]
use macos as platform;

pub use platform::ProcessIterator;

#[cfg(target_os = "freebsd")]
pub(crate) use freebsd::ppid_of;

#[cfg(target_os = "macos")]
pub(crate) use macos::ppid_of;

/// Which processes an iteration yields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Every userspace process on the system (kernel threads are skipped).
    All,
    /// The given process alone.
    Single(Pid),
    /// The given process plus all of its descendants.
    Family(Pid),
}

impl Scope {
    /// Whether `pid` belongs to the scope, based on ancestry alone.
    #[cfg_attr(target_os = "freebsd", allow(dead_code))]
    pub(crate) fn admits(&self, pid: Pid) -> bool {
        match *self {
            Scope::All => true,
            Scope::Single(target) => pid == target,
            Scope::Family(target) => pid == target || pid.is_descendant_of(target),
        }
    }
}

/// A point-in-time description of one process.
#[derive(Clone, Debug)]
pub struct ProcessSnapshot {
    pub pid: Pid,
    pub ppid: Pid,
    /// Accumulated user+kernel CPU time since the process started.
    pub cputime: Duration,
    /// Best-effort absolute executable path; empty or truncated on some
    /// platforms.
    pub command: String,
    /// Usable length of `command` for name comparisons, accounting for
    /// platform truncation.
    pub max_cmd_len: usize,
}
