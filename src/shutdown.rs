//! Graceful shutdown coordination.
//!
//! One [`ShutdownSignal`] is created in `main` and cloned into both workers
//! and the health endpoint. It fires on SIGINT/SIGTERM, or from `main` when a
//! worker exits on its own. Once fired it stays fired: a task that starts
//! waiting afterwards returns immediately.
//!
//! ```rust,ignore
//! use keybridge::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let stop = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     tokio::select! {
//!         _ = stop.notified() => {}
//!         _ = consume_next_delivery() => {}
//!     }
//! });
//!
//! shutdown.wait().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Seconds allowed for in-flight deliveries to settle.
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct ShutdownSignal {
    notify: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl ShutdownSignal {
    /// Create a signal with the default 30 second drain timeout.
    pub fn new() -> Self {
        Self::with_drain_timeout(Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS))
    }

    /// Create a signal with a custom drain timeout.
    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            notify,
            fired: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    /// How long `main` waits for workers once shutdown begins.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Block until SIGINT, SIGTERM or a programmatic trigger.
    ///
    /// A signal fires the shutdown for every clone. A failed handler install
    /// is logged and that source is ignored.
    pub async fn wait(&self) {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Could not listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Could not listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => info!(signal = "SIGINT", "Stopping consumers"),
            _ = terminate => info!(signal = "SIGTERM", "Stopping consumers"),
            _ = self.notified() => return,
        }

        self.fire();
    }

    /// Raw receiver, for APIs that take a future built from a receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Resolve once shutdown has fired, including before this call.
    pub async fn notified(&self) {
        // Subscribe before checking the flag so a concurrent fire is not missed
        let mut receiver = self.notify.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Non-blocking check whether shutdown has fired.
    pub fn is_shutdown(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Fire shutdown from inside the process.
    pub fn trigger(&self) {
        info!("Shutdown requested");
        self.fire();
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
