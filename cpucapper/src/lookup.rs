//! Locate a target process by PID or by executable name.

use crate::error::{Error, Result};
use crate::process_iterator::{ProcessIterator, Scope};
use crate::Pid;

/// Outcome of a target search.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
    /// The process exists and accepts our signals.
    Found(Pid),
    /// The process exists but we are not allowed to control it.
    Forbidden(Pid),
    /// No such process.
    NotFound,
}

/// Probes `pid` without iterating anything.
pub fn find_by_pid(pid: Pid) -> Candidate {
    match pid.check() {
        Ok(()) => Candidate::Found(pid),
        Err(Error::Forbidden(_)) => Candidate::Forbidden(pid),
        Err(_) => Candidate::NotFound,
    }
}

/// Searches every process for an executable matching `name`.
///
/// `name` may be a bare file name or a full path; only basenames are
/// compared. When several processes match, the one that is an ancestor of
/// the others wins (a wrapper script launching a binary of the same name
/// should resolve to the wrapper); unrelated matches tie-break on the
/// lowest PID.
pub fn find_by_name(name: &str) -> Result<Candidate> {
    let needle = basename(name);
    let mut best: Option<Pid> = None;

    for snapshot in ProcessIterator::new(Scope::All)? {
        let hay = basename(&snapshot.command);
        if hay.is_empty() {
            continue;
        }
        // the platform may have truncated the command, compare only over
        // the usable tail
        let cmp_len = snapshot
            .max_cmd_len
            .saturating_sub(snapshot.command.len() - hay.len());
        if cmp_len == 0 || !bounded_eq(hay, needle, cmp_len) {
            continue;
        }

        best = Some(match best {
            None => snapshot.pid,
            Some(prev) if prev.is_descendant_of(snapshot.pid) => snapshot.pid,
            Some(prev) if snapshot.pid.is_descendant_of(prev) => prev,
            Some(prev) => prev.min(snapshot.pid),
        });
    }

    Ok(match best {
        Some(pid) => find_by_pid(pid),
        None => Candidate::NotFound,
    })
}

/// Final path component, like `basename(3)`.
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `strncmp`-style equality over at most `n` bytes, where the end of a
/// string compares like a NUL.
fn bounded_eq(a: &str, b: &str, n: usize) -> bool {
    let la = a.len().min(n);
    let lb = b.len().min(n);
    la == lb && a.as_bytes()[..la] == b.as_bytes()[..lb]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/usr/bin/rsync"), "rsync");
        assert_eq!(basename("rsync"), "rsync");
        assert_eq!(basename(""), "");
    }

    #[test]
    fn bounded_eq_matches_strncmp() {
        assert!(bounded_eq("abc", "abc", 16));
        assert!(bounded_eq("abcde", "abcxx", 3));
        assert!(!bounded_eq("abc", "abcd", 5));
        assert!(bounded_eq("abc", "abcd", 3));
        assert!(!bounded_eq("abc", "abd", 3));
        assert!(bounded_eq("", "", 4));
    }

    #[test]
    fn finds_the_running_test_by_pid() {
        let own = Pid::from(std::process::id());
        assert_eq!(find_by_pid(own), Candidate::Found(own));
    }

    #[test]
    fn rejects_a_free_pid() {
        assert_eq!(find_by_pid(Pid::from(2_147_483_646)), Candidate::NotFound);
    }

    #[test]
    fn finds_the_running_test_by_name() {
        let exe = std::env::current_exe().unwrap();
        let found = find_by_name(&exe.to_string_lossy()).unwrap();
        assert!(matches!(found, Candidate::Found(_)));
    }

    #[test]
    fn misses_a_fictional_name() {
        let found = find_by_name("surely-nobody-runs-this-binary").unwrap();
        assert_eq!(found, Candidate::NotFound);
    }
}
