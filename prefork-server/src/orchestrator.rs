//! Ties the pool, the signal flags and a per-worker event loop together.
//!
//! The parent never serves traffic: after startup it only watches for a
//! worker exit or a shutdown request, then stops every worker. Any worker
//! exit is fatal; there is no restart.

use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use prefork::{Role, SignalCoordinator, SignalState, WorkerExit, WorkerPool};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::http::{Request, Responder};
use crate::reactor::{LoopExit, Reactor};
use crate::socket;

/// Parent loop interval; bounds how long a shutdown request or a worker exit
/// goes unnoticed.
pub const PARENT_POLL: Duration = Duration::from_millis(100);
/// How long workers get to exit after `SIGTERM` before they are killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    WorkerExited(WorkerExit),
    ShutdownSignal,
}

/// How [`Server::run`] ended, in whichever process it returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Parent {
        reason: ShutdownReason,
        reaped: Vec<WorkerExit>,
    },
    Worker {
        index: usize,
        exit: LoopExit,
    },
}

impl Outcome {
    /// A parent that stopped because a worker died did not shut down cleanly.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Parent { reason, .. } => *reason == ShutdownReason::ShutdownSignal,
            Self::Worker { .. } => true,
        }
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Fork the workers and run until shutdown.
    ///
    /// Returns in the parent and, separately, in every worker. `make_reactor`
    /// is only called inside workers, after fork, with the flags the event
    /// loop should poll for shutdown.
    pub fn run<R, F>(&self, make_reactor: F) -> ServerResult<Outcome>
    where
        R: Reactor,
        F: FnOnce(&'static SignalState) -> R,
    {
        let mut pool = WorkerPool::new(self.config.pool_config()?)?;
        // Installed before fork so workers inherit the dispositions.
        let signals = SignalCoordinator::install(self.config.signals)?;

        info!(
            port = self.config.port,
            workers = pool.config().worker_count,
            affinity = pool.config().enable_affinity,
            cpus = %prefork::cpu::affinity_string().unwrap_or_default(),
            "starting server"
        );

        match pool.fork_workers() {
            Ok(Role::Parent) => self.run_parent(&mut pool, &signals),
            Ok(Role::Worker(index)) => {
                self.run_worker(&mut pool, index, make_reactor(signals.state()))
            }
            Err(e) => {
                if pool.role() == Role::Parent {
                    teardown(&mut pool);
                }
                Err(e.into())
            }
        }
    }

    fn run_parent(&self, pool: &mut WorkerPool, signals: &SignalCoordinator) -> ServerResult<Outcome> {
        let reason = match supervise(pool, signals) {
            Ok(reason) => reason,
            Err(e) => {
                teardown(pool);
                return Err(e);
            }
        };
        match reason {
            ShutdownReason::WorkerExited(exit) => {
                error!(%exit, "worker exited, shutting down the pool");
            }
            ShutdownReason::ShutdownSignal => info!("shutdown requested, stopping workers"),
        }
        let reaped = teardown(pool);
        Ok(Outcome::Parent { reason, reaped })
    }

    fn run_worker<R: Reactor>(
        &self,
        pool: &mut WorkerPool,
        index: usize,
        mut reactor: R,
    ) -> ServerResult<Outcome> {
        let responder = Responder::new(&self.config.response)
            .map_err(|e| ServerError::Config(format!("json response body: {e}")))?;
        reactor.set_request_handler(Arc::new(move |request: &Request<'_>| {
            responder.respond(request)
        }));

        let listener = reactor.open_listener(self.config.port)?;
        if let Err(e) = socket::apply_tuning(listener.as_fd(), &self.config.socket) {
            warn!(worker = index, error = %e, "socket tuning failed, continuing untuned");
        }

        pool.signal_ready()?;
        info!(
            worker = index,
            cpu = ?pool.cpu_id_of_current_worker(),
            "worker accepting connections"
        );

        let exit = reactor.run_until_stopped(listener)?;
        info!(worker = index, ?exit, "worker event loop finished");
        pool.cleanup();
        Ok(Outcome::Worker { index, exit })
    }
}

/// Wait for a worker exit or a shutdown request, whichever comes first.
fn supervise(pool: &mut WorkerPool, signals: &SignalCoordinator) -> ServerResult<ShutdownReason> {
    loop {
        if signals.shutdown_requested() {
            return Ok(ShutdownReason::ShutdownSignal);
        }
        if signals.reload_requested() {
            info!("reload requested; configuration is fixed at start-up, ignoring");
            signals.reset_reload();
        }
        if let Some(exit) = pool.try_wait_for_worker_exit()? {
            return Ok(ShutdownReason::WorkerExited(exit));
        }
        std::thread::sleep(PARENT_POLL);
    }
}

/// Stop and reap every remaining worker; returns what was reaped.
fn teardown(pool: &mut WorkerPool) -> Vec<WorkerExit> {
    let signalled = pool.terminate_workers(Signal::SIGTERM);
    let reaped = match pool.reap_workers(SHUTDOWN_GRACE) {
        Ok(reaped) => reaped,
        Err(e) => {
            error!(error = %e, "failed to reap workers");
            Vec::new()
        }
    };
    info!(signalled, reaped = reaped.len(), "workers stopped");
    pool.cleanup();
    reaped
}

#[cfg(test)]
mod tests {
    use nix::unistd::Pid;
    use prefork::ExitStatus;

    use super::*;

    #[test]
    fn outcome_success() {
        let died = WorkerExit {
            index: 0,
            pid: Pid::from_raw(10),
            status: ExitStatus::Signaled(Signal::SIGKILL),
        };
        assert!(
            Outcome::Parent {
                reason: ShutdownReason::ShutdownSignal,
                reaped: vec![],
            }
            .is_success()
        );
        assert!(
            !Outcome::Parent {
                reason: ShutdownReason::WorkerExited(died),
                reaped: vec![],
            }
            .is_success()
        );
        assert!(
            Outcome::Worker {
                index: 2,
                exit: LoopExit::ShutdownSignal,
            }
            .is_success()
        );
    }

    #[test]
    fn invalid_config_fails_before_forking() {
        let server = Server::new(ServerConfig {
            cpus: Some("x".into()),
            ..ServerConfig::default()
        });
        let result = server.run(|_| -> crate::reactor::TokioReactor {
            panic!("no worker should start")
        });
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
