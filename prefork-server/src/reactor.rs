//! The per-worker event loop.
//!
//! [`Reactor`] is what the orchestrator needs from an event loop; the pool
//! itself knows nothing about sockets. [`TokioReactor`] runs a current-thread
//! tokio runtime that is created inside the worker, after fork: a runtime
//! started before fork would leave its threads behind in the parent.

use std::io;
use std::net::TcpListener;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use prefork::SignalState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::http::{self, Request, Response};
use crate::socket;

/// How often the loop checks for a stop request or a shutdown signal.
pub const STOP_POLL: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 4096;
/// Largest request head accepted before the connection is refused.
const MAX_HEAD: usize = 16 * 1024;

pub type RequestHandler = Arc<dyn Fn(&Request<'_>) -> Response + Send + Sync>;

/// Why [`Reactor::run_until_stopped`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    ShutdownSignal,
}

/// Requests a running loop to return. Cloneable and usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait Reactor {
    type Listener: AsFd;

    /// Open this worker's listening endpoint on `port`.
    fn open_listener(&mut self, port: u16) -> ServerResult<Self::Listener>;

    fn set_request_handler(&mut self, handler: RequestHandler);

    /// Serve connections until stopped or a shutdown signal is observed.
    fn run_until_stopped(&mut self, listener: Self::Listener) -> ServerResult<LoopExit>;

    fn stop_handle(&self) -> StopHandle;

    fn stop(&self) {
        self.stop_handle().stop();
    }
}

#[derive(Debug, Clone)]
struct HeaderSettings {
    server_name: Arc<str>,
    date_header: bool,
}

pub struct TokioReactor {
    handler: RequestHandler,
    headers: HeaderSettings,
    shutdown: Option<&'static SignalState>,
    stop: StopHandle,
}

impl TokioReactor {
    /// `shutdown`, when given, is polled alongside the stop handle.
    pub fn new(server_name: &str, date_header: bool, shutdown: Option<&'static SignalState>) -> Self {
        Self {
            handler: Arc::new(|_: &Request<'_>| Response::not_found()),
            headers: HeaderSettings {
                server_name: server_name.into(),
                date_header,
            },
            shutdown,
            stop: StopHandle::default(),
        }
    }

    fn should_exit(&self) -> Option<LoopExit> {
        if self.stop.is_stopped() {
            return Some(LoopExit::Stopped);
        }
        if self.shutdown.is_some_and(SignalState::shutdown_requested) {
            return Some(LoopExit::ShutdownSignal);
        }
        None
    }
}

impl Reactor for TokioReactor {
    type Listener = TcpListener;

    fn open_listener(&mut self, port: u16) -> ServerResult<TcpListener> {
        socket::bind_reuseport(port).map_err(|source| ServerError::Listen { port, source })
    }

    fn set_request_handler(&mut self, handler: RequestHandler) {
        self.handler = handler;
    }

    fn run_until_stopped(&mut self, listener: TcpListener) -> ServerResult<LoopExit> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| ServerError::EventLoop(format!("build runtime: {e}")))?;

        let exit = runtime.block_on(async {
            listener.set_nonblocking(true)?;
            let listener = tokio::net::TcpListener::from_std(listener)?;
            let mut ticker = tokio::time::interval(STOP_POLL);
            info!(addr = ?listener.local_addr().ok(), "event loop started");

            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&self.handler);
                            let headers = self.headers.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, handler, headers).await {
                                    debug!(%peer, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Some(exit) = self.should_exit() {
                            return Ok::<_, io::Error>(exit);
                        }
                    }
                }
            }
        })?;

        // Dropping the runtime cancels in-flight connections.
        drop(runtime);
        info!(?exit, "event loop stopped");
        Ok(exit)
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }
}

/// Serve pipelined requests on one connection until the peer closes it.
async fn serve_connection(
    mut stream: TcpStream,
    handler: RequestHandler,
    headers: HeaderSettings,
) -> io::Result<()> {
    let mut pending = Vec::with_capacity(READ_CHUNK);
    let mut out = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(chunk.get(..n).unwrap_or_default());

        let date = headers.date_header.then(http::http_date);
        let mut consumed = 0;
        loop {
            match http::parse_head(pending.get(consumed..).unwrap_or_default()) {
                Ok(Some((request, used))) => {
                    handler(&request).encode(&headers.server_name, date.as_deref(), &mut out);
                    consumed += used;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "rejecting request");
                    Response::bad_request().encode(&headers.server_name, date.as_deref(), &mut out);
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
        pending.drain(..consumed);

        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
        if pending.len() > MAX_HEAD {
            Response::bad_request().encode(&headers.server_name, date.as_deref(), &mut out);
            stream.write_all(&out).await?;
            return Ok(());
        }
    }
}
