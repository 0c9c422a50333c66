//! Worker pool coordinator.
//!
//! Forks one worker per configured slot, in index order, and waits for each
//! worker's readiness handshake before forking the next one. After
//! [`WorkerPool::fork_workers`] returns, the same pool value exists in every
//! process; [`WorkerPool::role`] says which side this one is.

use std::fmt;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::cpu;
use crate::error::{PoolError, Result};
use crate::process::{self, ChildExit, ExitStatus, ProcessOps, Spawned, SystemProcess};
use crate::readiness::ReadinessChannel;

/// Slice length while the parent waits for a readiness signal; between slices
/// it checks whether the worker has already died.
const HANDSHAKE_POLL: Duration = Duration::from_millis(100);
/// Poll interval while reaping workers during teardown.
const REAP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub worker_count: usize,
    /// CPU for each worker slot; `cpu_ids.len()` must equal `worker_count`.
    pub cpu_ids: Vec<usize>,
    pub enable_affinity: bool,
}

impl PoolConfig {
    /// One worker per listed CPU.
    pub fn new(cpu_ids: Vec<usize>, enable_affinity: bool) -> Self {
        Self {
            worker_count: cpu_ids.len(),
            cpu_ids,
            enable_affinity,
        }
    }

    /// One pinned worker per CPU in the process's affinity mask.
    pub fn from_online_cpus() -> Result<Self> {
        Ok(Self::new(cpu::online_cpus()?, true))
    }

    /// Resize to `count` workers, cycling through the current CPU list.
    pub fn with_workers(mut self, count: usize) -> Self {
        self.cpu_ids = self.cpu_ids.iter().copied().cycle().take(count).collect();
        self.worker_count = count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(PoolError::InvalidConfig(
                "worker_count must be greater than zero".into(),
            ));
        }
        if self.cpu_ids.len() != self.worker_count {
            return Err(PoolError::InvalidConfig(format!(
                "worker_count is {} but {} cpu ids were given",
                self.worker_count,
                self.cpu_ids.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Worker(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Initialized,
    ParentWaiting,
    WorkerRunning,
    Terminated,
}

#[derive(Debug)]
pub struct WorkerSlot {
    index: usize,
    cpu_id: usize,
    /// Only ever set in the worker that owns this slot, until it signals.
    readiness: Option<ReadinessChannel>,
    /// Set by the parent after fork; cleared once reaped. Always `None` in a
    /// worker's own view.
    pid: Option<Pid>,
}

impl WorkerSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn has_open_readiness(&self) -> bool {
        self.readiness.is_some()
    }
}

/// A worker the parent has reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub index: usize,
    pub pid: Pid,
    pub status: ExitStatus,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} (pid {}) {}", self.index, self.pid, self.status)
    }
}

#[derive(Debug)]
pub struct WorkerPool<P = SystemProcess> {
    config: PoolConfig,
    slots: Vec<WorkerSlot>,
    role: Role,
    state: PoolState,
    ops: P,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_ops(config, SystemProcess)
    }
}

impl<P: ProcessOps> WorkerPool<P> {
    /// Validate `config` and allocate one slot per worker. No OS resources
    /// are touched.
    pub fn with_ops(config: PoolConfig, ops: P) -> Result<Self> {
        config.validate()?;
        let slots = config
            .cpu_ids
            .iter()
            .enumerate()
            .map(|(index, &cpu_id)| WorkerSlot {
                index,
                cpu_id,
                readiness: None,
                pid: None,
            })
            .collect();
        Ok(Self {
            config,
            slots,
            role: Role::Parent,
            state: PoolState::Initialized,
            ops,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    /// `Some(i)` in the process running `Worker(i)`.
    pub fn worker_index(&self) -> Option<usize> {
        match self.role {
            Role::Worker(index) => Some(index),
            Role::Parent => None,
        }
    }

    pub fn cpu_id_of_current_worker(&self) -> Option<usize> {
        self.worker_index()
            .and_then(|index| self.slots.get(index))
            .map(WorkerSlot::cpu_id)
    }

    /// `(index, pid)` of every worker the parent has not reaped yet.
    pub fn worker_pids(&self) -> Vec<(usize, Pid)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.pid.map(|pid| (slot.index, pid)))
            .collect()
    }

    /// Fork every worker.
    ///
    /// Returns `Role::Parent` in the parent once all handshakes completed, and
    /// `Role::Worker(i)` in worker `i`, which must go on to call
    /// [`signal_ready`](Self::signal_ready). Any failure is fatal to the whole
    /// startup: already-forked workers keep running and the caller is expected
    /// to tear them down with [`terminate_workers`](Self::terminate_workers).
    ///
    /// There is no handshake timeout. A worker that stays alive without ever
    /// signalling blocks this call indefinitely; one that exits is detected.
    pub fn fork_workers(&mut self) -> Result<Role> {
        if self.role != Role::Parent || self.state != PoolState::Initialized {
            return Err(PoolError::InvalidState(
                "workers can only be forked once, from an initialized pool",
            ));
        }

        for index in 0..self.slots.len() {
            let channel = match ReadinessChannel::new() {
                Ok(channel) => channel,
                Err(e) => return Err(self.abort_startup(index, e.into())),
            };
            match self.ops.spawn_child() {
                Ok(Spawned::Parent { child }) => {
                    if let Err(e) = self.handshake(index, child, channel) {
                        return Err(self.abort_startup(index, e));
                    }
                }
                Ok(Spawned::Worker) => return self.enter_worker(index, channel),
                Err(e) => return Err(self.abort_startup(index, e)),
            }
        }

        self.state = PoolState::ParentWaiting;
        info!(workers = self.slots.len(), "worker pool running");
        Ok(Role::Parent)
    }

    fn abort_startup(&mut self, index: usize, err: PoolError) -> PoolError {
        error!(worker = index, error = %err, "worker pool startup failed");
        self.state = PoolState::Terminated;
        err
    }

    fn handshake(&mut self, index: usize, child: Pid, channel: ReadinessChannel) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(PoolError::InvalidState("worker slot out of range"))?;
        slot.pid = Some(child);
        let cpu = slot.cpu_id;

        debug!(worker = index, pid = child.as_raw(), "waiting for worker readiness");
        while !channel.poll_ready(HANDSHAKE_POLL)? {
            if let Some(status) = process::try_wait_child(child)? {
                slot.pid = None;
                return Err(PoolError::WorkerDied {
                    index,
                    pid: child.as_raw(),
                    status,
                });
            }
        }
        channel.wait()?;

        info!(worker = index, cpu, pid = child.as_raw(), "worker running");
        Ok(())
    }

    /// Worker continuation of the fork loop; never resumes the loop.
    fn enter_worker(&mut self, index: usize, channel: ReadinessChannel) -> Result<Role> {
        self.role = Role::Worker(index);
        self.state = PoolState::WorkerRunning;
        for slot in &mut self.slots {
            slot.pid = None;
        }

        if self.config.enable_affinity
            && let Some(cpu) = self.slots.get(index).map(WorkerSlot::cpu_id)
        {
            self.ops.pin_to_cpu(cpu)?;
        }

        // Earlier workers' handles were consumed by their handshakes before
        // this fork, so this is the only one the worker holds.
        if let Some(slot) = self.slots.get_mut(index) {
            slot.readiness = Some(channel);
        }

        Ok(Role::Worker(index))
    }

    /// Tell the parent this worker finished starting up.
    ///
    /// Fails with [`PoolError::InvalidState`] in the parent or when called a
    /// second time.
    pub fn signal_ready(&mut self) -> Result<()> {
        let Role::Worker(index) = self.role else {
            return Err(PoolError::InvalidState(
                "only a worker can signal readiness",
            ));
        };
        let channel = self
            .slots
            .get_mut(index)
            .and_then(|slot| slot.readiness.take())
            .ok_or(PoolError::InvalidState("readiness already signalled"))?;
        channel.signal()?;
        Ok(())
    }

    /// Block until any worker exits. Every exit is unexpected: the pool has
    /// no retirement protocol, so this is the parent's cue to shut down.
    pub fn wait_for_any_worker_exit(&mut self) -> Result<WorkerExit> {
        self.require_waiting_parent()?;
        loop {
            let exit = process::wait_any_child()?;
            if let Some(exit) = self.record_exit(exit) {
                error!(
                    worker = exit.index,
                    pid = exit.pid.as_raw(),
                    status = %exit.status,
                    "worker process exited unexpectedly"
                );
                return Ok(exit);
            }
        }
    }

    /// Non-blocking variant of
    /// [`wait_for_any_worker_exit`](Self::wait_for_any_worker_exit).
    pub fn try_wait_for_worker_exit(&mut self) -> Result<Option<WorkerExit>> {
        self.require_waiting_parent()?;
        while let Some(exit) = process::try_wait_any_child()? {
            if let Some(exit) = self.record_exit(exit) {
                error!(
                    worker = exit.index,
                    pid = exit.pid.as_raw(),
                    status = %exit.status,
                    "worker process exited unexpectedly"
                );
                return Ok(Some(exit));
            }
        }
        Ok(None)
    }

    /// Send `signal` to every live worker. Returns how many were signalled.
    pub fn terminate_workers(&self, signal: Signal) -> usize {
        if self.role != Role::Parent {
            return 0;
        }
        let mut signalled = 0;
        for (index, pid) in self.worker_pids() {
            match kill(pid, signal) {
                Ok(()) => signalled += 1,
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(worker = index, pid = pid.as_raw(), error = %e, "failed to signal worker"),
            }
        }
        debug!(signal = signal.as_str(), signalled, "signalled workers");
        signalled
    }

    /// Reap every live worker, escalating to `SIGKILL` for those still
    /// running after `grace`.
    pub fn reap_workers(&mut self, grace: Duration) -> Result<Vec<WorkerExit>> {
        if self.role != Role::Parent {
            return Err(PoolError::InvalidState("only the parent can reap workers"));
        }
        let deadline = Instant::now() + grace;
        let mut escalated = false;
        let mut reaped = Vec::new();

        while !self.worker_pids().is_empty() {
            match process::try_wait_any_child() {
                Ok(Some(exit)) => {
                    if let Some(exit) = self.record_exit(exit) {
                        debug!(worker = exit.index, status = %exit.status, "worker reaped");
                        reaped.push(exit);
                    }
                }
                Ok(None) => {
                    if !escalated && Instant::now() >= deadline {
                        warn!(
                            remaining = self.worker_pids().len(),
                            "workers still running after grace period, killing"
                        );
                        self.terminate_workers(Signal::SIGKILL);
                        escalated = true;
                    }
                    std::thread::sleep(REAP_POLL);
                }
                Err(PoolError::Wait(Errno::ECHILD)) => {
                    warn!("worker processes were reaped elsewhere");
                    for slot in &mut self.slots {
                        slot.pid = None;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Release slots and configuration, closing any handshake handle still
    /// open. Safe to call in any state, any number of times.
    pub fn cleanup(&mut self) {
        for slot in &mut self.slots {
            if slot.readiness.take().is_some() {
                debug!(worker = slot.index, "closed unused readiness handle");
            }
        }
        self.slots.clear();
        self.config.cpu_ids.clear();
        self.state = PoolState::Terminated;
    }

    fn require_waiting_parent(&self) -> Result<()> {
        if self.role != Role::Parent || self.state != PoolState::ParentWaiting {
            return Err(PoolError::InvalidState(
                "only the parent of a running pool can wait for workers",
            ));
        }
        Ok(())
    }

    fn record_exit(&mut self, exit: ChildExit) -> Option<WorkerExit> {
        let Some(slot) = self.slots.iter_mut().find(|s| s.pid == Some(exit.pid)) else {
            warn!(pid = exit.pid.as_raw(), status = %exit.status, "reaped a child that is not a pool worker");
            return None;
        };
        slot.pid = None;
        Some(WorkerExit {
            index: slot.index,
            pid: exit.pid,
            status: exit.status,
        })
    }
}
