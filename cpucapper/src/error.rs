use thiserror::Error;

use crate::Pid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("the target process is dead")]
    DeadTarget,
    #[error("no process {0} found")]
    NotFound(Pid),
    #[error("not allowed to control process {0}")]
    Forbidden(Pid),
    #[error("procfs is not mounted on /proc")]
    ProcfsNotMounted,
    #[error("kvm interface unavailable: {0}")]
    Kvm(String),
    #[error("couldn't enumerate processes: {0}")]
    Enumerate(std::io::Error),
    #[error("signal delivery failed: {0}")]
    Signal(std::io::Error),
    #[error("couldn't spawn the limiting thread")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
