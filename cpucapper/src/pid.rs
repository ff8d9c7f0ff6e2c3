//! Handle processes described by their PID.

use std::fmt::Display;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
lazy_static::lazy_static! {
    /// The number of clock ticks per second.
    ///
    /// This is a kernel constant (fixed at compile-time). When `sysconf`
    /// cannot report it, the conversion falls back to 100 Hz.
    // SAFETY: inherently unsafe as a syscall, but the parameter is valid.
    pub(crate) static ref CLOCK_TICKS: u64 = {
        match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
            ticks if ticks > 0 => ticks as u64,
            _ => 100,
        }
    };
}

/// PID of `init`, the floor of every ancestry walk.
pub(crate) const INIT: Pid = Pid(1);

/// Upper bound on ancestry walks.
///
/// A parent chain longer than this is treated as unrelated instead of
/// being followed forever when `/proc` reports inconsistent parents.
const MAX_ANCESTRY_DEPTH: usize = 512;

/// Job-control signals the limiter dispatches.
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Freeze the process where it stands.
    SIGSTOP,
    /// Let the process run again.
    SIGCONT,
}

/// A process on the system, identified by PID.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Pid(u32);

impl FromStr for Pid {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        Ok(Pid(s.parse::<u32>()?))
    }
}

impl TryFrom<&str> for Pid {
    type Error = core::num::ParseIntError;

    fn try_from(value: &str) -> core::result::Result<Self, Self::Error> {
        Pid::from_str(value)
    }
}

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

impl From<Pid> for u32 {
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

impl Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Pid {
    /// Retrieves the parent process identifier (`ppid`), or `None` when the
    /// process is gone or unreadable.
    #[cfg(target_os = "linux")]
    pub fn get_ppid(&self) -> Option<Pid> {
        crate::stat_iterator::StatFile::open(*self)
            .ok()?
            .parse()
            .map(|stat| stat.ppid)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn get_ppid(&self) -> Option<Pid> {
        crate::process_iterator::ppid_of(*self)
    }

    /// Indicates whether `ancestor` appears in the parent chain of `self`.
    ///
    /// The walk stops at init (or below) and after a fixed number of hops;
    /// it never recurses.
    pub fn is_descendant_of(&self, ancestor: Pid) -> bool {
        let mut current = *self;
        let mut hops = 0;

        while current > INIT && current != ancestor {
            if hops == MAX_ANCESTRY_DEPTH {
                return false;
            }
            hops += 1;
            current = match current.get_ppid() {
                Some(ppid) => ppid,
                None => return false,
            };
        }

        current == ancestor
    }

    /// Retrieves the accumulated CPU time, sum of the user and kernel modes.
    ///
    /// Returns zero when the process is gone.
    #[cfg(target_os = "linux")]
    pub fn get_cputime(&self) -> Duration {
        crate::stat_iterator::StatFile::open(*self)
            .ok()
            .and_then(|stat| stat.parse())
            .map(|stat| stat.cputime())
            .unwrap_or(Duration::ZERO)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn get_cputime(&self) -> Duration {
        use crate::process_iterator::{ProcessIterator, Scope};

        ProcessIterator::new(Scope::Single(*self))
            .ok()
            .and_then(|mut processes| processes.next())
            .map(|snapshot| snapshot.cputime)
            .unwrap_or(Duration::ZERO)
    }

    /// Sends `signal` to the process, reporting delivery failures.
    pub fn try_kill(&self, signal: Signal) -> Result<()> {
        self.send(match signal {
            Signal::SIGSTOP => libc::SIGSTOP,
            Signal::SIGCONT => libc::SIGCONT,
        })
    }

    /// Probes the process with the null signal: no signal is delivered but
    /// existence and permission are checked.
    pub fn check(&self) -> Result<()> {
        self.send(0)
    }

    fn send(&self, signal: libc::c_int) -> Result<()> {
        // SAFETY: inherently unsafe as a syscall, but the PID and the signal
        // are valid values.
        if unsafe { libc::kill(self.0 as _, signal) } == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(Error::NotFound(*self)),
            Some(libc::EPERM) => Err(Error::Forbidden(*self)),
            _ => Err(Error::Signal(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn own_pid() -> Pid {
        Pid::from(std::process::id())
    }

    #[test]
    fn parses_and_displays() {
        let pid = Pid::from_str("1234").unwrap();
        assert_eq!(pid, Pid::from(1234));
        assert_eq!(pid.to_string(), "1234");
        assert!(Pid::from_str("woof").is_err());
    }

    #[test]
    fn knows_its_parent() {
        let ppid = own_pid().get_ppid().unwrap();
        assert_eq!(u32::from(ppid), std::os::unix::process::parent_id());
    }

    #[test]
    fn every_process_descends_from_init() {
        assert!(own_pid().is_descendant_of(INIT));
        assert!(own_pid().is_descendant_of(own_pid()));
    }

    #[test]
    fn cputime_is_monotonic() {
        let pid = own_pid();
        let before = pid.get_cputime();
        // burn a little CPU so the counter has a chance to move
        let mut acc = 0_u64;
        for i in 0..5_000_000_u64 {
            acc = acc.wrapping_add(i);
        }
        std::hint::black_box(acc);
        assert!(pid.get_cputime() >= before);
    }

    #[test]
    fn null_signal_checks_existence() {
        assert!(own_pid().check().is_ok());
        // largest positive pid_t, far above any kernel's pid_max
        assert!(matches!(
            Pid::from(2_147_483_646).check(),
            Err(Error::NotFound(_))
        ));
    }
}
