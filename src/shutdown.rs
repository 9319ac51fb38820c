//! Graceful shutdown coordination
//!
//! One coordinator per process. Long-running loops hold an `Arc` to it
//! and block on [`ShutdownCoordinator::wait`]; teardown callbacks
//! register with a priority (lower runs first, so the IMAP poll stops
//! before the store clients close). A SIGINT/SIGTERM listener or a
//! programmatic [`ShutdownCoordinator::initiate`] moves the lifecycle
//! out of `Running`; callbacks then run sequentially under one bounded
//! deadline, and whatever exceeds it is abandoned.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    ShuttingDown,
    Stopped,
}

type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Callback = Box<dyn FnOnce() -> CallbackFuture + Send>;

struct Registration {
    priority: i32,
    name: String,
    callback: Callback,
}

/// Coordinates orderly teardown of one process.
pub struct ShutdownCoordinator {
    state: watch::Sender<Lifecycle>,
    callbacks: Mutex<Vec<Registration>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(Lifecycle::Running);
        Arc::new(Self {
            state,
            callbacks: Mutex::new(Vec::new()),
            timeout,
        })
    }

    /// Register a teardown callback. Lower priorities run first.
    pub fn register<F, Fut>(&self, priority: i32, name: &str, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        callbacks.push(Registration {
            priority,
            name: name.to_string(),
            callback: Box::new(move || Box::pin(callback())),
        });
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// A receiver that observes lifecycle transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.state.subscribe()
    }

    /// Block until the lifecycle leaves `Running`.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        while *rx.borrow() == Lifecycle::Running {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Block until teardown has fully finished.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        while *rx.borrow() != Lifecycle::Stopped {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep that returns early when shutdown begins.
    ///
    /// Returns `true` if the full duration elapsed while still running.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.wait() => false,
        }
    }

    /// Begin teardown: run registered callbacks in priority order under
    /// the configured deadline, then mark the process `Stopped`.
    ///
    /// Safe to call more than once; only the first call runs callbacks.
    pub async fn initiate(&self) {
        let first = self.state.send_if_modified(|state| {
            if *state == Lifecycle::Running {
                *state = Lifecycle::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        info!(timeout_secs = self.timeout.as_secs(), "shutdown initiated");

        let mut registrations = {
            let mut callbacks = self
                .callbacks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *callbacks)
        };
        registrations.sort_by_key(|r| r.priority);

        let deadline = tokio::time::Instant::now() + self.timeout;
        for registration in registrations {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                error!(
                    callback = %registration.name,
                    "shutdown deadline exhausted, abandoning remaining callbacks"
                );
                break;
            }
            let ran = tokio::time::timeout(remaining, (registration.callback)()).await;
            match ran {
                Ok(()) => info!(callback = %registration.name, "teardown callback finished"),
                Err(_) => {
                    warn!(callback = %registration.name, "teardown callback exceeded deadline");
                }
            }
        }

        let _ = self.state.send(Lifecycle::Stopped);
        info!("shutdown complete");
    }

    /// Spawn a background task that turns SIGINT/SIGTERM into
    /// [`ShutdownCoordinator::initiate`].
    pub fn listen_for_signals(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let sigint = tokio::signal::ctrl_c();

            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to install SIGTERM handler: {e}");
                        return;
                    }
                };
                tokio::select! {
                    _ = sigint => info!("SIGINT received"),
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
            }

            #[cfg(not(unix))]
            {
                let _ = sigint.await;
                info!("SIGINT received");
            }

            coordinator.initiate().await;
        });
    }
}
