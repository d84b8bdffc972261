//! Signal handling for the daemon.
//!
//! SIGINT and SIGTERM flip a shared shutdown flag that every long-running
//! task watches. SIGHUP re-reads the target list.

use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::targets::TargetRegistry;

/// Receiver side of the shutdown flag.
pub type ShutdownToken = watch::Receiver<bool>;

/// Resolve once shutdown has been requested (or the guard is gone).
pub async fn cancelled(token: &mut ShutdownToken) {
    let _ = token.wait_for(|stop| *stop).await;
}

/// Owns the shutdown flag and the task listening for termination signals.
pub struct ShutdownGuard {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownGuard {
    /// Create a guard and start listening for SIGINT and SIGTERM.
    ///
    /// If handlers cannot be registered (restricted environments) the guard
    /// still works, it just only fires through [`request_shutdown`](Self::request_shutdown).
    pub fn new() -> Self {
        let guard = Self::detached();
        let tx = Arc::clone(&guard.tx);

        tokio::spawn(async move {
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGINT handler: {}", e);
                    None
                }
            };

            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    None
                }
            };

            match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => info!("Received SIGINT, shutting down..."),
                        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    info!("Received SIGINT, shutting down...");
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    info!("Received SIGTERM, shutting down...");
                }
                (None, None) => {
                    warn!("No signal handlers registered - graceful shutdown disabled");
                    return;
                }
            }
            tx.send_replace(true);
        });

        guard
    }

    /// A guard with no signal listener attached.
    pub fn detached() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn token(&self) -> ShutdownToken {
        self.tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Reload the target list on every SIGHUP until shutdown.
///
/// A failed reload keeps the previous list.
pub fn spawn_reload_on_hangup(
    registry: Arc<TargetRegistry>,
    mut token: ShutdownToken,
) -> Option<JoinHandle<()>> {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to register SIGHUP handler: {}", e);
            return None;
        }
    };

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, reloading targets...");
                    match registry.reload() {
                        Ok(count) => info!("Loaded {} target(s)", count),
                        Err(e) => error!("Target reload failed, keeping previous list: {:#}", e),
                    }
                }
                _ = cancelled(&mut token) => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_request_shutdown() {
        let guard = ShutdownGuard::detached();
        assert!(!guard.is_shutdown_requested());
        guard.request_shutdown();
        assert!(guard.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_token_observes_shutdown() {
        let guard = ShutdownGuard::detached();
        let mut token = guard.token();

        let waiter = tokio::spawn(async move {
            cancelled(&mut token).await;
        });
        guard.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_created_after_shutdown() {
        let guard = ShutdownGuard::detached();
        guard.request_shutdown();
        let mut token = guard.token();
        tokio::time::timeout(Duration::from_secs(1), cancelled(&mut token))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_waiters() {
        let guard = ShutdownGuard::detached();
        let mut token = guard.token();
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), cancelled(&mut token))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reload_task_stops_on_shutdown() {
        let guard = ShutdownGuard::detached();
        let registry = Arc::new(TargetRegistry::from_targets(Vec::new()));
        if let Some(handle) = spawn_reload_on_hangup(registry, guard.token()) {
            guard.request_shutdown();
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
