//! A library to limit the CPU usage of a process.
//!
//! The limiter drives its target with POSIX job-control signals: every
//! 100 ms control slice the target family runs for a work quantum, then
//! sits in SIGSTOP for the rest of the slice, with the split steered by
//! the measured CPU usage. It runs as an ordinary user process on Linux,
//! FreeBSD and macOS.
//!
//! # Example
//!
//! ```no_run
//! use cpucapper::{CpuLimit, Pid};
//!
//! // Cap a process at 10% of one core
//! let limit = CpuLimit::new(Pid::from(1048), 10).unwrap();
//! // or also account for its descendants
//! let family = CpuLimit::new_with_children(Pid::from(2096), 42).unwrap();
//!
//! limit.stop();
//! family.stop();
//! ```

mod control;
mod error;
mod limiter;
mod lookup;
mod pid;
mod process_group;
mod process_iterator;
#[cfg(target_os = "linux")]
mod stat_iterator;

pub use control::Controls;
pub use error::{Error, Result};
pub use limiter::{run, CpuLimit, SLICE_DURATION};
pub use lookup::{find_by_name, find_by_pid, Candidate};
pub use pid::{Pid, Signal};
pub use process_group::{ChildrenMode, ProcessGroup};
pub use process_iterator::{ProcessIterator, ProcessSnapshot, Scope};

lazy_static::lazy_static! {
    // SAFETY: inherently unsafe as a syscall, but the parameter is valid.
    static ref NCPU: u32 = {
        match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
            n if n >= 1 => n as u32,
            _ => 1,
        }
    };
}

/// The number of online CPUs, at least 1.
pub fn ncpu() -> u32 {
    *NCPU
}

/// The largest PID the kernel hands out, as an exclusive upper bound for
/// PID arguments. Unreadable on Linux means no practical bound.
#[cfg(target_os = "linux")]
pub fn pid_max() -> u32 {
    std::fs::read_to_string("/proc/sys/kernel/pid_max")
        .ok()
        .and_then(|pid_max| pid_max.trim().parse().ok())
        .unwrap_or(u32::MAX)
}

#[cfg(target_os = "freebsd")]
pub fn pid_max() -> u32 {
    99_999
}

#[cfg(target_os = "macos")]
pub fn pid_max() -> u32 {
    99_998
}

#[cfg(test)]
mod test {
    #[test]
    fn host_constants_are_sane() {
        assert!(super::ncpu() >= 1);
        assert!(super::pid_max() > 300);
    }
}
