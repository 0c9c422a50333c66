//! Process lifecycle: fork, CPU pinning and child reaping.

use std::fmt;

use nix::errno::Errno;
use nix::sched::{CpuSet, sched_setaffinity};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, wait, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::error::{PoolError, Result};

/// Which side of a fork the caller is on.
///
/// The two arms are disjoint continuations: the child never resumes the
/// parent's loop, so callers must match and return from the `Worker` arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spawned {
    Parent { child: Pid },
    Worker,
}

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    /// Shell-style exit code: signals map to 128 + signal number.
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => 128 + *sig as i32,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    fn from_wait(status: WaitStatus) -> Option<(Pid, Self)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, Self::Exited(code))),
            WaitStatus::Signaled(pid, sig, _) => Some((pid, Self::Signaled(sig))),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig.as_str()),
        }
    }
}

/// A reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: Pid,
    pub status: ExitStatus,
}

/// Duplicate the calling process.
///
/// Must be called while the process is single-threaded (before any runtime or
/// helper threads start): only the calling thread survives in the child, and
/// locks held by other threads would stay locked there forever.
pub fn spawn_child() -> Result<Spawned> {
    // SAFETY: the child only touches memory owned by the calling thread and
    // state that is valid to use after fork (descriptors, atomics).
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Spawned::Parent { child }),
        Ok(ForkResult::Child) => Ok(Spawned::Worker),
        Err(errno) => Err(PoolError::Spawn(errno)),
    }
}

/// Restrict the calling process to a single CPU.
pub fn pin_to_cpu(cpu: usize) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)
        .map_err(|source| PoolError::Affinity { cpu, source })?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|source| PoolError::Affinity { cpu, source })
}

/// Block until any direct child terminates.
///
/// Stop/continue notifications are skipped. `ECHILD` is reported as an error:
/// waiting without children is a caller bug.
pub fn wait_any_child() -> Result<ChildExit> {
    loop {
        match wait() {
            Ok(status) => {
                if let Some((pid, status)) = ExitStatus::from_wait(status) {
                    return Ok(ChildExit { pid, status });
                }
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(PoolError::Wait(errno)),
        }
    }
}

/// Reap one terminated child if any is ready, without blocking.
pub fn try_wait_any_child() -> Result<Option<ChildExit>> {
    try_wait(Pid::from_raw(-1))
}

/// Reap `pid` if it has terminated, without blocking.
pub fn try_wait_child(pid: Pid) -> Result<Option<ExitStatus>> {
    Ok(try_wait(pid)?.map(|exit| exit.status))
}

fn try_wait(pid: Pid) -> Result<Option<ChildExit>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => {
                if let Some((pid, status)) = ExitStatus::from_wait(status) {
                    return Ok(Some(ChildExit { pid, status }));
                }
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(PoolError::Wait(errno)),
        }
    }
}

/// The process operations the worker pool depends on.
///
/// [`SystemProcess`] is the real implementation; the seam lets callers wrap
/// it, e.g. to inject a spawn failure at a given index.
pub trait ProcessOps {
    fn spawn_child(&mut self) -> Result<Spawned>;
    fn pin_to_cpu(&mut self, cpu: usize) -> Result<()>;
}

/// [`ProcessOps`] backed by `fork(2)` and `sched_setaffinity(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcess;

impl ProcessOps for SystemProcess {
    fn spawn_child(&mut self) -> Result<Spawned> {
        spawn_child()
    }

    fn pin_to_cpu(&mut self, cpu: usize) -> Result<()> {
        pin_to_cpu(cpu)
    }
}
