use nix::errno::Errno;

use crate::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cpu query failed: {0}")]
    CpuQuery(String),

    #[error("process spawn failed: {0}")]
    Spawn(#[source] Errno),

    #[error("failed to pin process to cpu {cpu}: {source}")]
    Affinity {
        cpu: usize,
        #[source]
        source: Errno,
    },

    #[error("readiness handshake failed: {0}")]
    Sync(#[from] std::io::Error),

    #[error("worker {index} (pid {pid}) {status} before signalling readiness")]
    WorkerDied {
        index: usize,
        pid: i32,
        status: ExitStatus,
    },

    #[error("wait for child failed: {0}")]
    Wait(#[source] Errno),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, PoolError>;
