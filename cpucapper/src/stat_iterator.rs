//! Parse `/proc/<pid>/stat` files.
//!
//! The second stat field (`comm`) is an arbitrary string that may embed
//! whitespace and parentheses, so the line cannot be split naively.
//! Everything the limiter needs sits *after* the comm field, and the
//! kernel writes no `)` past it, so parsing anchors on the last closing
//! parenthesis and splits the remainder on whitespace.
//!
//! See `man proc` for the list of fields.

use std::fs;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use crate::pid::CLOCK_TICKS;
use crate::Pid;

/// The content of a `/proc/<pid>/stat` file.
pub(crate) struct StatFile(String);

/// The handful of stat fields the limiter consumes.
pub(crate) struct ProcStat {
    /// Single-character process state (`R`, `S`, `Z`, ...).
    pub state: u8,
    pub ppid: Pid,
    /// Time spent in user mode, in clock ticks.
    pub utime: u64,
    /// Time spent in kernel mode, in clock ticks.
    pub stime: u64,
}

impl ProcStat {
    /// Accumulated CPU time, user plus kernel.
    pub fn cputime(&self) -> Duration {
        Duration::from_millis((self.utime + self.stime) * 1000 / *CLOCK_TICKS)
    }
}

impl StatFile {
    /// Opens the `/proc/<pid>/stat` file.
    pub fn open(pid: Pid) -> io::Result<Self> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
        Ok(Self(stat))
    }

    /// Extracts the fields the limiter cares about, or `None` when the
    /// file is malformed (e.g. the process died mid-read).
    pub fn parse(&self) -> Option<ProcStat> {
        // the comm field ends at the last ')' of the line
        let (_, tail) = self.0.rsplit_once(')')?;
        let mut fields = tail.split_ascii_whitespace();

        let state = *fields.next()?.as_bytes().first()?;
        let ppid = Pid::from_str(fields.next()?).ok()?;
        // skip the nine fields from pgrp through cmajflt
        let utime = fields.nth(9)?.parse().ok()?;
        let stime = fields.next()?.parse().ok()?;

        Some(ProcStat {
            state,
            ppid,
            utime,
            stime,
        })
    }
}
