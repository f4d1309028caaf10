//! Graceful shutdown on SIGINT / SIGTERM
//!
//! The coordinator turns OS signals into a cancelled [`CancellationToken`]
//! and runs a state-saver callback. Signals are not forwarded: the process
//! keeps running until the batch loop notices the token and returns.
//!
//! While no coordinator is listening, SIGINT and SIGTERM fall back to their
//! default action and terminate the process.

use crate::state::StateSaver;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the signal listener for the lifetime of a batch
pub struct ShutdownCoordinator {
    token: CancellationToken,
    saver: StateSaver,
    listener: Option<JoinHandle<()>>,
}

impl ShutdownCoordinator {
    /// Starts listening for SIGINT and SIGTERM
    ///
    /// Must be called from within a tokio runtime. A signal that cannot be
    /// registered on this platform is skipped.
    pub fn install(token: CancellationToken, saver: StateSaver) -> io::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        disposition::hold();
        let signals = SignalSet::register();
        let listener = {
            let token = token.clone();
            let saver = saver.clone();
            runtime.spawn(async move {
                let mut signals = signals;
                while let Some(name) = signals.next().await {
                    trigger(&token, &saver, name);
                }
                tracing::debug!("signal streams closed; listener exiting");
            })
        };

        tracing::debug!("shutdown signal handlers installed");
        Ok(Self {
            token,
            saver,
            listener: Some(listener),
        })
    }

    /// Requests shutdown as if a signal had arrived
    pub fn request(&self, reason: &str) {
        trigger(&self.token, &self.saver, reason);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops listening for signals. Safe to call more than once.
    ///
    /// Once the last coordinator has stopped, SIGINT and SIGTERM terminate
    /// the process again.
    pub fn restore_handlers(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            disposition::release();
            tracing::debug!("shutdown signal handlers removed");
        }
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        self.restore_handlers();
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("shutdown_requested", &self.shutdown_requested())
            .field("listening", &self.listener.is_some())
            .finish()
    }
}

fn trigger(token: &CancellationToken, saver: &StateSaver, reason: &str) {
    if token.is_cancelled() {
        tracing::info!(reason, "shutdown already requested");
    } else {
        tracing::warn!(reason, "shutdown requested; stopping after the current URL");
        token.cancel();
    }

    match catch_unwind(AssertUnwindSafe(|| saver())) {
        Ok(Ok(())) => tracing::debug!("progress saved on shutdown"),
        Ok(Err(e)) => tracing::warn!(error = %e, "failed to save progress on shutdown"),
        Err(_) => tracing::error!("state saver panicked during shutdown"),
    }
}

/// Tracks live coordinators and applies the default signal action when
/// there are none.
///
/// tokio never unregisters its own handler, so a conditional handler is
/// registered next to it on first use and switched on by the flag.
#[cfg(unix)]
mod disposition {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, OnceLock, PoisonError};

    struct Fallback {
        listening: Mutex<usize>,
        default_action: Arc<AtomicBool>,
    }

    static FALLBACK: OnceLock<Fallback> = OnceLock::new();

    fn fallback() -> &'static Fallback {
        FALLBACK.get_or_init(|| {
            let default_action = Arc::new(AtomicBool::new(false));
            for (signal, name) in [(SIGINT, "SIGINT"), (SIGTERM, "SIGTERM")] {
                if let Err(e) =
                    signal_hook::flag::register_conditional_default(signal, default_action.clone())
                {
                    tracing::warn!(signal = name, error = %e, "cannot register default signal action");
                }
            }
            Fallback {
                listening: Mutex::new(0),
                default_action,
            }
        })
    }

    pub(super) fn hold() {
        let fallback = fallback();
        let mut listening = fallback.listening.lock().unwrap_or_else(PoisonError::into_inner);
        *listening += 1;
        fallback.default_action.store(false, Ordering::SeqCst);
    }

    pub(super) fn release() {
        let fallback = fallback();
        let mut listening = fallback.listening.lock().unwrap_or_else(PoisonError::into_inner);
        *listening = listening.saturating_sub(1);
        if *listening == 0 {
            fallback.default_action.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(not(unix))]
mod disposition {
    pub(super) fn hold() {}

    pub(super) fn release() {}
}

#[cfg(unix)]
struct SignalSet {
    interrupt: Option<tokio::signal::unix::Signal>,
    terminate: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl SignalSet {
    fn register() -> Self {
        use tokio::signal::unix::SignalKind;

        Self {
            interrupt: Self::listen(SignalKind::interrupt(), "SIGINT"),
            terminate: Self::listen(SignalKind::terminate(), "SIGTERM"),
        }
    }

    fn listen(kind: tokio::signal::unix::SignalKind, name: &str) -> Option<tokio::signal::unix::Signal> {
        match tokio::signal::unix::signal(kind) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(signal = name, error = %e, "cannot listen for signal; skipping");
                None
            }
        }
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::select! {
            Some(()) = recv(&mut self.interrupt) => Some("SIGINT"),
            Some(()) = recv(&mut self.terminate) => Some("SIGTERM"),
            else => None,
        }
    }
}

#[cfg(unix)]
async fn recv(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => None,
    }
}

#[cfg(not(unix))]
struct SignalSet;

#[cfg(not(unix))]
impl SignalSet {
    fn register() -> Self {
        Self
    }

    async fn next(&mut self) -> Option<&'static str> {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some("ctrl-c"),
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for ctrl-c; skipping");
                None
            }
        }
    }
}
