use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{error, info};

/// Graceful shutdown handler using tokio broadcast channel.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    is_shutting_down: AtomicBool,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx: tx,
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Resolve once shutdown has been requested, including before this call.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Request graceful shutdown.
    pub fn request_shutdown(&self) {
        if !self.is_shutting_down.swap(true, Ordering::Relaxed) {
            info!("Shutdown requested, draining connections");
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Wait for SIGINT / SIGTERM, then request shutdown.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            } else {
                info!("Received Ctrl+C");
            }
        }
        self.request_shutdown();
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_initially_not_shutting_down() {
        let gs = GracefulShutdown::new();
        assert!(!gs.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_broadcast_to_subscribers() {
        let gs = GracefulShutdown::new();
        let mut rx = gs.subscribe();

        gs.request_shutdown();

        assert!(rx.recv().await.is_ok());
        assert!(gs.is_shutting_down());
    }

    #[tokio::test]
    async fn wait_returns_after_earlier_request() {
        let gs = GracefulShutdown::new();
        gs.request_shutdown();
        gs.request_shutdown();
        tokio::time::timeout(Duration::from_millis(100), gs.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_wakes_on_later_request() {
        let gs = Arc::new(GracefulShutdown::new());
        let waiter = {
            let gs = gs.clone();
            tokio::spawn(async move { gs.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gs.request_shutdown();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
