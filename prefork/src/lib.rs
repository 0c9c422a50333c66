//! Pre-forked, CPU-pinned worker processes.
//!
//! A parent forks one worker per CPU, pins each to its core, and waits for a
//! readiness handshake from every worker before forking the next. Afterwards
//! the parent supervises: any worker exit is treated as fatal. Signal
//! handlers only set flags that both sides poll.

pub mod cpu;
pub mod error;
pub mod pool;
pub mod process;
pub mod readiness;
pub mod signals;

pub use error::{PoolError, Result};
pub use pool::{PoolConfig, PoolState, Role, WorkerExit, WorkerPool, WorkerSlot};
pub use process::{ExitStatus, ProcessOps, Spawned, SystemProcess};
pub use readiness::ReadinessChannel;
pub use signals::{
    SignalCallback, SignalConfig, SignalCoordinator, SignalError, SignalEvent, SignalKind,
    SignalState,
};
