//! FreeBSD backend over the kvm(3) interface.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::Pid;

use super::{ProcessSnapshot, Scope};

// Minimal kvm(3) surface; libkvm is not covered by the libc crate.
#[link(name = "kvm")]
extern "C" {
    fn kvm_openfiles(
        execfile: *const c_char,
        corefile: *const c_char,
        swapfile: *const c_char,
        flags: c_int,
        errbuf: *mut c_char,
    ) -> *mut c_void;
    fn kvm_getprocs(
        kd: *mut c_void,
        op: c_int,
        arg: c_int,
        cnt: *mut c_int,
    ) -> *mut libc::kinfo_proc;
    fn kvm_getargv(
        kd: *mut c_void,
        p: *const libc::kinfo_proc,
        nchr: c_int,
    ) -> *mut *mut c_char;
    fn kvm_close(kd: *mut c_void) -> c_int;
}

/// Size of the kvm error buffer, `_POSIX2_LINE_MAX`.
const ERRBUF_LEN: usize = 2048;

/// Same hop bound as the generic ancestry walk.
const MAX_ANCESTRY_DEPTH: usize = 512;

/// An iterator over the processes selected by a [`Scope`].
///
/// Holds the kvm descriptor and the process table fetched at creation;
/// both are released on drop, the table being owned by the descriptor.
pub struct ProcessIterator {
    kd: *mut c_void,
    procs: *mut libc::kinfo_proc,
    count: usize,
    index: usize,
    scope: Scope,
}

impl ProcessIterator {
    pub fn new(scope: Scope) -> Result<Self> {
        let mut errbuf = [0 as c_char; ERRBUF_LEN];
        // SAFETY: a NULL execfile selects the running kernel; the /dev/null
        // corefile restricts kvm to live sysctl data.
        let kd = unsafe {
            kvm_openfiles(
                std::ptr::null(),
                c"/dev/null".as_ptr(),
                std::ptr::null(),
                libc::O_RDONLY,
                errbuf.as_mut_ptr(),
            )
        };
        if kd.is_null() {
            // SAFETY: kvm_openfiles NUL-terminates its error buffer.
            let reason = unsafe { CStr::from_ptr(errbuf.as_ptr()) };
            return Err(Error::Kvm(reason.to_string_lossy().into_owned()));
        }

        let mut count: c_int = 0;
        // SAFETY: kd was just opened; the returned table stays valid until
        // the next kvm_getprocs call on this descriptor.
        let procs = unsafe { kvm_getprocs(kd, libc::KERN_PROC_PROC, 0, &mut count) };
        if procs.is_null() {
            unsafe { kvm_close(kd) };
            return Err(Error::Kvm("kvm_getprocs failed".into()));
        }

        Ok(Self {
            kd,
            procs,
            count: count.max(0) as usize,
            index: 0,
            scope,
        })
    }
}

impl Iterator for ProcessIterator {
    type Item = ProcessSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        if let Scope::Single(target) = self.scope {
            if self.index == self.count {
                return None;
            }
            self.index = self.count;
            return single_snapshot(self.kd, target);
        }

        while self.index < self.count {
            // SAFETY: index is bounded by the count kvm_getprocs reported.
            let kproc = unsafe { &*self.procs.add(self.index) };
            self.index += 1;

            if kproc.ki_flag as c_int & libc::P_SYSTEM != 0 {
                // kernel process
                continue;
            }
            let pid = Pid::from(kproc.ki_pid as u32);
            if let Scope::Family(target) = self.scope {
                if pid != target && !is_child_of(self.kd, pid, target) {
                    continue;
                }
            }
            return Some(snapshot_from(self.kd, kproc));
        }
        None
    }
}

impl Drop for ProcessIterator {
    fn drop(&mut self) {
        // SAFETY: kd is open; closing it also frees the process table.
        unsafe { kvm_close(self.kd) };
    }
}

fn snapshot_from(kd: *mut c_void, kproc: &libc::kinfo_proc) -> ProcessSnapshot {
    // ki_runtime holds combined user+system time in microseconds
    let cputime = Duration::from_micros(kproc.ki_runtime.max(0) as u64);

    // SAFETY: kproc points into the live table of this descriptor and the
    // argv array is NULL-terminated.
    let args = unsafe { kvm_getargv(kd, kproc, libc::PATH_MAX) };
    let command = if args.is_null() {
        String::new()
    } else {
        let argv0 = unsafe { *args };
        if argv0.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(argv0) }
                .to_string_lossy()
                .into_owned()
        }
    };

    ProcessSnapshot {
        pid: Pid::from(kproc.ki_pid as u32),
        ppid: Pid::from(kproc.ki_ppid as u32),
        cputime,
        command,
        max_cmd_len: libc::PATH_MAX as usize,
    }
}

fn single_snapshot(kd: *mut c_void, pid: Pid) -> Option<ProcessSnapshot> {
    let mut count: c_int = 0;
    // SAFETY: kd is open; a KERN_PROC_PID query returns zero or one entry.
    let kproc = unsafe { kvm_getprocs(kd, libc::KERN_PROC_PID, u32::from(pid) as c_int, &mut count) };
    if kproc.is_null() || count == 0 {
        return None;
    }
    Some(snapshot_from(kd, unsafe { &*kproc }))
}

fn ppid_via(kd: *mut c_void, pid: Pid) -> Option<Pid> {
    let mut count: c_int = 0;
    // SAFETY: same contract as single_snapshot.
    let kproc = unsafe { kvm_getprocs(kd, libc::KERN_PROC_PID, u32::from(pid) as c_int, &mut count) };
    if kproc.is_null() || count == 0 {
        return None;
    }
    Some(Pid::from(unsafe { (*kproc).ki_ppid } as u32))
}

/// Ancestry walk reusing the already-open descriptor.
fn is_child_of(kd: *mut c_void, child: Pid, parent: Pid) -> bool {
    let mut current = child;
    let mut hops = 0;

    while current > crate::pid::INIT && current != parent {
        if hops == MAX_ANCESTRY_DEPTH {
            return false;
        }
        hops += 1;
        current = match ppid_via(kd, current) {
            Some(ppid) => ppid,
            None => return false,
        };
    }

    current == parent
}

/// One-shot parent lookup, opening and closing its own descriptor.
pub(crate) fn ppid_of(pid: Pid) -> Option<Pid> {
    let mut errbuf = [0 as c_char; ERRBUF_LEN];
    // SAFETY: see ProcessIterator::new.
    let kd = unsafe {
        kvm_openfiles(
            std::ptr::null(),
            c"/dev/null".as_ptr(),
            std::ptr::null(),
            libc::O_RDONLY,
            errbuf.as_mut_ptr(),
        )
    };
    if kd.is_null() {
        return None;
    }
    let ppid = ppid_via(kd, pid);
    // SAFETY: kd is open.
    unsafe { kvm_close(kd) };
    ppid
}
