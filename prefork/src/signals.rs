//! Process-wide signal coordination.
//!
//! Installs `sigaction` handlers (not `signal`, whose semantics vary and may
//! reset after the first delivery) that only touch atomics and, optionally, a
//! registered callback. Ordinary code polls the flags.
//!
//! A handler receives nothing but the signal number, so the coordinator's
//! state is reached through one process-wide slot. Only one coordinator is the
//! dispatch target at a time; installing another one replaces it.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Poll interval of [`SignalCoordinator::wait_blocking`].
pub const WAIT_POLL: Duration = Duration::from_millis(100);

/// Callback run inside the signal handler.
///
/// It executes in signal context: it must not allocate, block, log through
/// `tracing`, or take locks that ordinary code may hold.
pub type SignalCallback = fn(Signal);

/// The dispatch target of the handler. Holds null or a pointer obtained from
/// `Box::leak`; pointees are never freed, so a handler that loaded the pointer
/// just before `cleanup` still reads valid memory.
static ACTIVE: AtomicPtr<SignalState> = AtomicPtr::new(ptr::null_mut());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Terminate,
    Interrupt,
    Reload,
    User1,
    User2,
    BrokenPipe,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        Self::Terminate,
        Self::Interrupt,
        Self::Reload,
        Self::User1,
        Self::User2,
        Self::BrokenPipe,
    ];

    pub fn signal(self) -> Signal {
        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::Interrupt => Signal::SIGINT,
            Self::Reload => Signal::SIGHUP,
            Self::User1 => Signal::SIGUSR1,
            Self::User2 => Signal::SIGUSR2,
            Self::BrokenPipe => Signal::SIGPIPE,
        }
    }

    fn from_signal(signal: Signal) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.signal() == signal)
    }

    /// Index into [`SignalState::callbacks`]; `SIGPIPE` takes no callback.
    fn callback_slot(self) -> Option<usize> {
        match self {
            Self::Terminate => Some(0),
            Self::Interrupt => Some(1),
            Self::Reload => Some(2),
            Self::User1 => Some(3),
            Self::User2 => Some(4),
            Self::BrokenPipe => None,
        }
    }

    fn notice(self) -> &'static [u8] {
        match self {
            Self::Terminate => b"SIGTERM received, initiating graceful shutdown\n",
            Self::Interrupt => b"SIGINT received, initiating graceful shutdown\n",
            Self::Reload => b"SIGHUP received, configuration reload requested\n",
            Self::User1 | Self::User2 | Self::BrokenPipe => b"",
        }
    }
}

/// Which signals get a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub terminate: bool,
    pub interrupt: bool,
    pub reload: bool,
    pub user1: bool,
    pub user2: bool,
    /// Handle `SIGPIPE` so writes to closed connections do not kill the process.
    pub broken_pipe: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            terminate: true,
            interrupt: true,
            reload: false,
            user1: false,
            user2: false,
            broken_pipe: true,
        }
    }
}

impl SignalConfig {
    pub fn is_enabled(&self, kind: SignalKind) -> bool {
        match kind {
            SignalKind::Terminate => self.terminate,
            SignalKind::Interrupt => self.interrupt,
            SignalKind::Reload => self.reload,
            SignalKind::User1 => self.user1,
            SignalKind::User2 => self.user2,
            SignalKind::BrokenPipe => self.broken_pipe,
        }
    }

    fn enabled_kinds(self) -> impl Iterator<Item = SignalKind> {
        SignalKind::ALL
            .into_iter()
            .filter(move |&kind| self.is_enabled(kind))
    }
}

/// Flags written by the signal handler and read by ordinary code.
#[derive(Debug)]
pub struct SignalState {
    shutdown: AtomicBool,
    reload: AtomicBool,
    /// `SignalCallback` pointers stored as `usize`; 0 means none.
    callbacks: [AtomicUsize; 5],
}

impl SignalState {
    fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            reload: AtomicBool::new(false),
            callbacks: Default::default(),
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn reload_requested(&self) -> bool {
        self.reload.load(Ordering::SeqCst)
    }

    fn set_callback(&self, kind: SignalKind, callback: Option<SignalCallback>) -> bool {
        let Some(slot) = kind.callback_slot().and_then(|i| self.callbacks.get(i)) else {
            return false;
        };
        slot.store(callback.map_or(0, |f| f as usize), Ordering::SeqCst);
        true
    }

    /// Runs in signal context. Returns whether a callback was registered.
    fn invoke(&self, kind: SignalKind) -> bool {
        let Some(slot) = kind.callback_slot().and_then(|i| self.callbacks.get(i)) else {
            return false;
        };
        let raw = slot.load(Ordering::SeqCst);
        if raw == 0 {
            return false;
        }
        // SAFETY: non-zero values are only ever stored from a `SignalCallback`
        // by `set_callback`.
        let callback = unsafe { std::mem::transmute::<usize, SignalCallback>(raw) };
        callback(kind.signal());
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("failed to set disposition of {signal}: {source}")]
    Install {
        signal: &'static str,
        #[source]
        source: Errno,
    },

    #[error("{0:?} does not accept a callback")]
    Unsupported(SignalKind),
}

/// What ended [`SignalCoordinator::wait_blocking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

#[derive(Debug)]
pub struct SignalCoordinator {
    config: SignalConfig,
    state: &'static SignalState,
    active: bool,
}

impl SignalCoordinator {
    /// Install handlers for every kind enabled in `config` and make this
    /// coordinator the process-wide dispatch target.
    ///
    /// If any handler cannot be installed, the ones already installed get
    /// their previous disposition back and the previous dispatch target stays
    /// in place.
    pub fn install(config: SignalConfig) -> Result<Self, SignalError> {
        let state: &'static SignalState = Box::leak(Box::new(SignalState::new()));
        let target = ptr::from_ref(state).cast_mut();
        let replaced = ACTIVE.swap(target, Ordering::SeqCst);

        if let Err(e) = install_all(config.enabled_kinds(), |kind| {
            set_disposition(kind, SigHandler::Handler(dispatch))
        }) {
            let _ = ACTIVE.compare_exchange(target, replaced, Ordering::SeqCst, Ordering::SeqCst);
            return Err(e);
        }

        debug!(?config, "signal handlers installed");
        Ok(Self {
            config,
            state,
            active: true,
        })
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The flags, for code that outlives a borrow of the coordinator (e.g. an
    /// event loop polling for shutdown).
    pub fn state(&self) -> &'static SignalState {
        self.state
    }

    /// Register or clear the callback for `kind`.
    pub fn set_handler(
        &self,
        kind: SignalKind,
        callback: Option<SignalCallback>,
    ) -> Result<(), SignalError> {
        if self.state.set_callback(kind, callback) {
            Ok(())
        } else {
            Err(SignalError::Unsupported(kind))
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    pub fn reload_requested(&self) -> bool {
        self.state.reload_requested()
    }

    pub fn reset_shutdown(&self) {
        self.state.shutdown.store(false, Ordering::SeqCst);
    }

    pub fn reset_reload(&self) {
        self.state.reload.store(false, Ordering::SeqCst);
    }

    /// Sleep in [`WAIT_POLL`] steps until shutdown or reload is requested.
    ///
    /// Fallback primitive; event loops should poll
    /// [`shutdown_requested`](Self::shutdown_requested) themselves.
    pub fn wait_blocking(&self) -> SignalEvent {
        loop {
            if self.shutdown_requested() {
                return SignalEvent::Shutdown;
            }
            if self.reload_requested() {
                return SignalEvent::Reload;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Restore default dispositions for every enabled kind and stop being the
    /// dispatch target. Idempotent.
    pub fn cleanup(&mut self) {
        if !self.active {
            return;
        }
        for kind in self.config.enabled_kinds() {
            if let Err(e) = set_disposition(kind, SigHandler::SigDfl) {
                warn!(error = %e, "failed to restore default signal disposition");
            }
        }
        let _ = ACTIVE.compare_exchange(
            ptr::from_ref(self.state).cast_mut(),
            ptr::null_mut(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.active = false;
        debug!("signal handlers restored to defaults");
    }
}

impl Drop for SignalCoordinator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Run `install` for each kind in order. On the first failure every kind
/// installed so far is put back to the action `install` returned for it, and
/// the remaining kinds are never touched.
fn install_all(
    kinds: impl Iterator<Item = SignalKind>,
    mut install: impl FnMut(SignalKind) -> Result<SigAction, SignalError>,
) -> Result<(), SignalError> {
    let mut installed = Vec::new();
    for kind in kinds {
        match install(kind) {
            Ok(previous) => installed.push((kind, previous)),
            Err(e) => {
                for (kind, previous) in installed.into_iter().rev() {
                    if let Err(restore) = restore_disposition(kind, &previous) {
                        warn!(?kind, error = %restore, "failed to restore signal disposition");
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

fn restore_disposition(kind: SignalKind, previous: &SigAction) -> Result<(), SignalError> {
    let signal = kind.signal();
    // SAFETY: `previous` was in place for this signal before we replaced it.
    unsafe { sigaction(signal, previous) }
        .map(drop)
        .map_err(|source| SignalError::Install {
            signal: signal.as_str(),
            source,
        })
}

/// Returns the action that was in place before.
fn set_disposition(kind: SignalKind, handler: SigHandler) -> Result<SigAction, SignalError> {
    let installing = matches!(handler, SigHandler::Handler(_));
    let mut mask = SigSet::empty();
    let mut flags = SaFlags::empty();
    if installing {
        for blocked in [
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGHUP,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
        ] {
            mask.add(blocked);
        }
        flags = SaFlags::SA_RESTART;
    }
    let action = SigAction::new(handler, flags, mask);
    let signal = kind.signal();
    // SAFETY: `dispatch` only performs async-signal-safe operations.
    unsafe { sigaction(signal, &action) }.map_err(|source| SignalError::Install {
        signal: signal.as_str(),
        source,
    })
}

extern "C" fn dispatch(signum: libc::c_int) {
    let active = ACTIVE.load(Ordering::SeqCst);
    // SAFETY: ACTIVE holds null or a leaked `SignalState` that is never freed.
    let Some(state) = (unsafe { active.as_ref() }) else {
        return;
    };
    let Some(kind) = Signal::try_from(signum)
        .ok()
        .and_then(SignalKind::from_signal)
    else {
        return;
    };

    match kind {
        SignalKind::Terminate | SignalKind::Interrupt => {
            state.shutdown.store(true, Ordering::SeqCst);
            if !state.invoke(kind) {
                write_stderr(kind.notice());
            }
        }
        SignalKind::Reload => {
            state.reload.store(true, Ordering::SeqCst);
            if !state.invoke(kind) {
                write_stderr(kind.notice());
            }
        }
        SignalKind::User1 | SignalKind::User2 => {
            state.invoke(kind);
        }
        SignalKind::BrokenPipe => {}
    }
}

/// Async-signal-safe diagnostic output.
fn write_stderr(message: &[u8]) {
    // SAFETY: write(2) is async-signal-safe and `message` outlives the call.
    let _ = unsafe { libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len()) };
}
