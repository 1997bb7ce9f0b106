//! Graceful shutdown support for the gateway.
//!
//! Once shutdown is triggered the server stops accepting connections, new
//! verb requests are rejected with `UNAVAILABLE`, and in-flight requests
//! (including open Listen streams) get up to [`ShutdownConfig::timeout`] to
//! finish before they are dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! use grpc_stitch_gateway::{Gateway, ShutdownConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! Gateway::builder()
//!     // ... services and relations ...
//!     .with_graceful_shutdown(ShutdownConfig {
//!         timeout: Duration::from_secs(30),
//!         ..Default::default()
//!     })
//!     .serve("0.0.0.0:8080")
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Configuration for graceful shutdown behavior.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Maximum time in-flight requests get to complete (default: 30 seconds)
    pub timeout: Duration,
    /// Whether SIGTERM and SIGINT trigger shutdown (default: true)
    pub handle_signals: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            handle_signals: true,
        }
    }
}

/// Tracks in-flight requests and the shutdown trigger.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    triggered: Arc<watch::Sender<bool>>,
    in_flight: Arc<AtomicUsize>,
    config: ShutdownConfig,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        let (triggered, _) = watch::channel(false);
        Self {
            triggered: Arc::new(triggered),
            in_flight: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Whether shutdown has been triggered.
    pub fn is_draining(&self) -> bool {
        *self.triggered.borrow()
    }

    /// Number of requests currently being served.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Count a request as in flight until the guard is dropped.
    pub fn track(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            counter: self.in_flight.clone(),
        }
    }

    /// Start draining. Repeated calls are no-ops.
    pub fn trigger(&self) {
        if !self.triggered.send_replace(true) {
            info!(in_flight = self.in_flight(), "Initiating graceful shutdown");
        }
    }

    /// Completes once shutdown has been triggered.
    pub fn triggered(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.triggered.subscribe();
        async move {
            // An error means the sender is gone, which only happens on drop.
            let _ = rx.wait_for(|triggered| *triggered).await;
        }
    }

    /// Completes `timeout` after shutdown was triggered.
    pub fn deadline(&self) -> impl Future<Output = ()> + Send + 'static {
        let triggered = self.triggered();
        let timeout = self.config.timeout;
        async move {
            triggered.await;
            tokio::time::sleep(timeout).await;
        }
    }

    /// Trigger shutdown on SIGTERM or SIGINT.
    pub fn listen_for_signals(&self) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            signal_shutdown().await;
            coordinator.trigger();
        });
    }
}

/// RAII guard returned by [`ShutdownCoordinator::track`].
pub struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let previous = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug!(in_flight = previous - 1, "Request completed");
    }
}

/// Completes on SIGTERM or SIGINT (Ctrl+C).
#[cfg(unix)]
pub async fn signal_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT (Ctrl+C)"),
    }
}

/// Completes on Ctrl+C.
#[cfg(not(unix))]
pub async fn signal_shutdown() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("Received Ctrl+C");
}

/// Serve `app` until `coordinator` is triggered and the in-flight requests
/// drain, or the shutdown timeout elapses.
pub async fn run_with_graceful_shutdown(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    coordinator: ShutdownCoordinator,
) -> Result<()> {
    if coordinator.config().handle_signals {
        coordinator.listen_for_signals();
    }

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(coordinator.triggered())
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = coordinator.deadline() => {
            warn!(
                in_flight = coordinator.in_flight(),
                "Shutdown timeout reached, dropping in-flight requests"
            );
        }
    }

    info!("Graceful shutdown complete");
    Ok(())
}
