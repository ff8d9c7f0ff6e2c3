//! macOS backend over libproc.

use std::io;
use std::os::raw::{c_int, c_void};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::Pid;

use super::{ProcessSnapshot, Scope};

// libproc.h surface; not exposed by the libc crate.
extern "C" {
    fn proc_listpids(kind: u32, typeinfo: u32, buffer: *mut c_void, buffersize: c_int) -> c_int;
    fn proc_pidinfo(
        pid: c_int,
        flavor: c_int,
        arg: u64,
        buffer: *mut c_void,
        buffersize: c_int,
    ) -> c_int;
}

const PROC_ALL_PIDS: u32 = 1;
const PROC_PIDTASKALLINFO: c_int = 2;
/// `pbi_flags` bit marking a kernel-internal process.
const PROC_FLAG_SYSTEM: u32 = 2;

/// `struct proc_bsdinfo` from `sys/proc_info.h`; most fields only matter
/// for layout.
#[repr(C)]
#[derive(Copy, Clone)]
#[allow(dead_code)]
struct ProcBsdInfo {
    pbi_flags: u32,
    pbi_status: u32,
    pbi_xstatus: u32,
    pbi_pid: u32,
    pbi_ppid: u32,
    pbi_uid: u32,
    pbi_gid: u32,
    pbi_ruid: u32,
    pbi_rgid: u32,
    pbi_svuid: u32,
    pbi_svgid: u32,
    rfu_1: u32,
    pbi_comm: [u8; 16],
    pbi_name: [u8; 32],
    pbi_nfiles: u32,
    pbi_pgid: u32,
    pbi_pjobc: u32,
    e_tdev: u32,
    e_tpgid: u32,
    pbi_nice: i32,
    pbi_start_tvsec: u64,
    pbi_start_tvusec: u64,
}

/// `struct proc_taskinfo` from `sys/proc_info.h`; ditto on layout.
#[repr(C)]
#[derive(Copy, Clone)]
#[allow(dead_code)]
struct ProcTaskInfo {
    pti_virtual_size: u64,
    pti_resident_size: u64,
    pti_total_user: u64,
    pti_total_system: u64,
    pti_threads_user: u64,
    pti_threads_system: u64,
    pti_policy: i32,
    pti_faults: i32,
    pti_pageins: i32,
    pti_cow_faults: i32,
    pti_messages_sent: i32,
    pti_messages_received: i32,
    pti_syscalls_mach: i32,
    pti_syscalls_unix: i32,
    pti_csw: i32,
    pti_threadnum: i32,
    pti_numrunning: i32,
    pti_priority: i32,
}

/// `struct proc_taskallinfo`, the `PROC_PIDTASKALLINFO` payload.
#[repr(C)]
#[derive(Copy, Clone)]
struct ProcTaskAllInfo {
    pbsd: ProcBsdInfo,
    ptinfo: ProcTaskInfo,
}

/// An iterator over the processes selected by a [`Scope`].
///
/// The PID table is fetched once at creation; per-PID info is read lazily
/// as the iteration advances.
pub struct ProcessIterator {
    pids: Vec<c_int>,
    index: usize,
    scope: Scope,
    done: bool,
}

impl ProcessIterator {
    pub fn new(scope: Scope) -> Result<Self> {
        let pids = match scope {
            Scope::Single(_) => Vec::new(),
            Scope::All | Scope::Family(_) => list_pids()?,
        };
        Ok(Self {
            pids,
            index: 0,
            scope,
            done: false,
        })
    }
}

impl Iterator for ProcessIterator {
    type Item = ProcessSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        if let Scope::Single(target) = self.scope {
            if self.done {
                return None;
            }
            self.done = true;
            return task_all_info(target).map(|info| snapshot_from(target, &info));
        }

        while self.index < self.pids.len() {
            let raw = self.pids[self.index];
            self.index += 1;
            if raw <= 0 {
                // proc_listpids pads its buffer with zeroes
                continue;
            }
            let pid = Pid::from(raw as u32);

            let Some(info) = task_all_info(pid) else {
                continue;
            };
            if info.pbsd.pbi_flags & PROC_FLAG_SYSTEM != 0 {
                continue;
            }
            if !self.scope.admits(pid) {
                continue;
            }
            return Some(snapshot_from(pid, &info));
        }
        None
    }
}

fn list_pids() -> Result<Vec<c_int>> {
    // SAFETY: a NULL buffer asks for the byte count only.
    let bytes = unsafe { proc_listpids(PROC_ALL_PIDS, 0, std::ptr::null_mut(), 0) };
    if bytes <= 0 {
        return Err(Error::Enumerate(io::Error::last_os_error()));
    }

    // headroom for processes spawned between the two calls
    let capacity = bytes as usize / std::mem::size_of::<c_int>() + 16;
    let mut pids = vec![0 as c_int; capacity];
    // SAFETY: the buffer length matches what we pass in.
    let bytes = unsafe {
        proc_listpids(
            PROC_ALL_PIDS,
            0,
            pids.as_mut_ptr().cast(),
            (pids.len() * std::mem::size_of::<c_int>()) as c_int,
        )
    };
    if bytes <= 0 {
        return Err(Error::Enumerate(io::Error::last_os_error()));
    }

    pids.truncate(bytes as usize / std::mem::size_of::<c_int>());
    Ok(pids)
}

fn task_all_info(pid: Pid) -> Option<ProcTaskAllInfo> {
    let size = std::mem::size_of::<ProcTaskAllInfo>() as c_int;
    // SAFETY: all-zeroes is a valid representation of the C struct, and
    // proc_pidinfo writes at most `size` bytes into it.
    let mut info: ProcTaskAllInfo = unsafe { std::mem::zeroed() };
    let written = unsafe {
        proc_pidinfo(
            u32::from(pid) as c_int,
            PROC_PIDTASKALLINFO,
            0,
            (&mut info as *mut ProcTaskAllInfo).cast(),
            size,
        )
    };
    // a short read means the process vanished or denied access
    (written == size).then_some(info)
}

fn snapshot_from(pid: Pid, info: &ProcTaskAllInfo) -> ProcessSnapshot {
    // task times are reported in nanoseconds
    let cputime =
        Duration::from_nanos(info.ptinfo.pti_total_user + info.ptinfo.pti_total_system);

    // prefer the long name, fall back to the 16-byte comm
    let (command, max_cmd_len) = if info.pbsd.pbi_name[0] != 0 {
        (buffer_str(&info.pbsd.pbi_name), info.pbsd.pbi_name.len() - 1)
    } else {
        (buffer_str(&info.pbsd.pbi_comm), info.pbsd.pbi_comm.len() - 1)
    };

    ProcessSnapshot {
        pid,
        ppid: Pid::from(info.pbsd.pbi_ppid),
        cputime,
        command,
        max_cmd_len,
    }
}

/// Contents of a fixed NUL-padded byte field.
fn buffer_str(buffer: &[u8]) -> String {
    let len = buffer.iter().position(|&byte| byte == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..len]).into_owned()
}

/// Parent lookup backing the generic ancestry walk.
pub(crate) fn ppid_of(pid: Pid) -> Option<Pid> {
    task_all_info(pid).map(|info| Pid::from(info.pbsd.pbi_ppid))
}
