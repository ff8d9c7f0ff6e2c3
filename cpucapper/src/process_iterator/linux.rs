//! Linux backend, walking the `/proc` filesystem.

use std::fs::{self, ReadDir};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::stat_iterator::StatFile;
use crate::Pid;

use super::{ProcessSnapshot, Scope};

/// `statfs` magic number of a procfs mount.
const PROC_SUPER_MAGIC: i64 = 0x9fa0;

/// An iterator over the processes selected by a [`Scope`].
///
/// Owns the `/proc` directory stream, released when the iterator is
/// exhausted or dropped.
pub struct ProcessIterator {
    scope: Scope,
    entries: Option<ReadDir>,
}

impl ProcessIterator {
    pub fn new(scope: Scope) -> Result<Self> {
        check_proc()?;
        let entries = fs::read_dir("/proc").map_err(Error::Enumerate)?;
        Ok(Self {
            scope,
            entries: Some(entries),
        })
    }
}

impl Iterator for ProcessIterator {
    type Item = ProcessSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        if let Scope::Single(target) = self.scope {
            // no directory scan needed, one stat read settles it
            self.entries.take()?;
            return read_snapshot(target);
        }

        loop {
            let entry = match self.entries.as_mut()?.next() {
                Some(Ok(entry)) => entry,
                Some(Err(_)) => continue,
                None => {
                    self.entries = None;
                    return None;
                }
            };

            // process entries are the pure-digit directories
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(pid) = Pid::from_str(name) else { continue };

            if !self.scope.admits(pid) {
                continue;
            }
            if self.scope == Scope::All && is_kernel_thread(pid) {
                continue;
            }
            if let Some(snapshot) = read_snapshot(pid) {
                return Some(snapshot);
            }
        }
    }
}

/// Refuses to iterate when `/proc` is not an actual procfs mount.
fn check_proc() -> Result<()> {
    // SAFETY: statfs only writes into the provided struct; the path is a
    // valid NUL-terminated string.
    let mut mnt: libc::statfs = unsafe { std::mem::zeroed() };
    let mounted = unsafe { libc::statfs(c"/proc".as_ptr(), &mut mnt) } == 0;
    if !mounted || mnt.f_type as i64 != PROC_SUPER_MAGIC {
        return Err(Error::ProcfsNotMounted);
    }
    Ok(())
}

/// Kernel threads have no userspace address space: their `statm` reads all
/// zeroes. Unreadable means gone, which is skipped too.
fn is_kernel_thread(pid: Pid) -> bool {
    fs::read_to_string(format!("/proc/{pid}/statm"))
        .map(|statm| statm.starts_with("0 0 0"))
        .unwrap_or(true)
}

/// First NUL-delimited argument of `/proc/<pid>/cmdline`.
///
/// Best-effort: kernel threads and processes that blanked their argv
/// expose an empty file, which reads as `None` here and becomes an empty
/// command in the snapshot.
fn read_command(pid: Pid) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let first = raw.split(|&byte| byte == 0).next()?;
    if first.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(first).into_owned())
}

/// Only a failed stat read or a zombie/dead state drops the PID; a
/// missing command does not, the process is still throttleable.
fn read_snapshot(pid: Pid) -> Option<ProcessSnapshot> {
    let stat = StatFile::open(pid).ok()?.parse()?;
    if matches!(stat.state, b'Z' | b'X') {
        return None;
    }

    Some(ProcessSnapshot {
        pid,
        ppid: stat.ppid,
        cputime: stat.cputime(),
        command: read_command(pid).unwrap_or_default(),
        max_cmd_len: libc::PATH_MAX as usize,
    })
}

#[cfg(test)]
mod test {
    use std::process::{Command, Stdio};

    use super::*;

    fn own_pid() -> Pid {
        Pid::from(std::process::id())
    }

    #[test]
    fn single_scope_yields_exactly_the_target() {
        let mut processes = ProcessIterator::new(Scope::Single(own_pid())).unwrap();
        let snapshot = processes.next().unwrap();
        assert_eq!(snapshot.pid, own_pid());
        assert_eq!(
            u32::from(snapshot.ppid),
            std::os::unix::process::parent_id()
        );
        assert!(!snapshot.command.is_empty());
        assert!(processes.next().is_none());
    }

    #[test]
    fn single_scope_on_a_free_pid_is_empty() {
        let mut processes = ProcessIterator::new(Scope::Single(Pid::from(2_147_483_646))).unwrap();
        assert!(processes.next().is_none());
    }

    #[test]
    fn a_blank_cmdline_does_not_drop_the_process() {
        // kthreadd exposes an empty cmdline; absent (containers) or
        // populated (pid namespaces) means there is nothing to check here
        let pid = Pid::from(2);
        match fs::read(format!("/proc/{pid}/cmdline")) {
            Ok(raw) if raw.is_empty() => {}
            _ => return,
        }

        let snapshot = read_snapshot(pid).expect("a live kernel thread still has a stat file");
        assert_eq!(snapshot.pid, pid);
        assert_eq!(snapshot.command, "");
    }

    #[test]
    fn all_scope_contains_the_test_runner() {
        let mut processes = ProcessIterator::new(Scope::All).unwrap();
        assert!(processes.any(|snapshot| snapshot.pid == own_pid()));
    }

    #[test]
    fn family_scope_discovers_spawned_children() {
        let mut child = Command::new("sleep")
            .arg("10")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let child_pid = Pid::from(child.id());

        let family: Vec<Pid> = ProcessIterator::new(Scope::Family(own_pid()))
            .unwrap()
            .map(|snapshot| snapshot.pid)
            .collect();
        assert!(family.contains(&own_pid()));
        assert!(family.contains(&child_pid));

        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn procfs_is_recognized() {
        assert!(check_proc().is_ok());
    }
}
