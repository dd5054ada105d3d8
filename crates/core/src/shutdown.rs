//! Cross-component shutdown coordination.
//!
//! Components register with a [`ShutdownCoordinator`] in start order; the
//! coordinator tears them down in reverse order exactly once, so schedulers
//! stop feeding pools before those pools drain.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, PoolState, ShutdownMode};

/// Anything that can be wound down by a [`ShutdownCoordinator`].
#[async_trait]
pub trait Shutdown: Send + Sync {
    /// Name used in shutdown logs.
    fn name(&self) -> &str;

    /// Drain or abort, resolving once the component has fully stopped.
    async fn shutdown(&self, mode: ShutdownMode);
}

#[async_trait]
impl<T: Shutdown + ?Sized> Shutdown for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn shutdown(&self, mode: ShutdownMode) {
        (**self).shutdown(mode).await
    }
}

/// Ensures a set of components is drained or aborted consistently, once.
pub struct ShutdownCoordinator {
    components: Mutex<Vec<Arc<dyn Shutdown>>>,
    lifecycle: Lifecycle<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(Vec::new()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Register a component. Fails once shutdown has begun.
    pub fn register(&self, component: Arc<dyn Shutdown>) -> Result<()> {
        let mut components = self.components.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.lifecycle.is_running() {
            return Err(Error::ShuttingDown);
        }
        info!(component = %component.name(), "Registered for shutdown");
        components.push(component);
        Ok(())
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle.state()
    }

    /// Shut every registered component down in reverse registration order.
    ///
    /// Only the first call performs the work; concurrent and later calls wait
    /// for it to finish.
    pub async fn shutdown_all(&self, mode: ShutdownMode) {
        if !self.lifecycle.begin_shutdown() {
            self.lifecycle.stopped().await;
            return;
        }

        let components = {
            let mut guard = self.components.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        info!(count = components.len(), ?mode, "Shutting down components");
        for component in components.iter().rev() {
            info!(component = %component.name(), ?mode, "Stopping component");
            component.shutdown(mode).await;
        }

        self.lifecycle.finish(());
        info!("All components stopped");
    }

    /// Wait for SIGINT/SIGTERM (Ctrl-C off Unix), then run [`shutdown_all`](Self::shutdown_all).
    pub async fn shutdown_on_signal(&self, mode: ShutdownMode) {
        wait_for_signal().await;
        info!("Shutdown signal received");
        self.shutdown_all(mode).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
///
/// If no handler can be installed this never resolves.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to register unix signal handlers, falling back to ctrl-c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
