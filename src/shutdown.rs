//! Graceful shutdown handling for flowerloop services.
//!
//! HTTP servers stop accepting connections and the modeller finishes its
//! current tick before the process exits.

use crate::error::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Maximum time to wait for services to stop before they are aborted.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown coordinator shared by every service of a node.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Watch channel observed by services.
    shutdown_watch: watch::Receiver<bool>,
    /// Internal sender for the watch channel.
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    /// Flag indicating if shutdown has been initiated.
    is_shutting_down: Arc<AtomicBool>,
    /// Grace period for services.
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Create a coordinator with a custom grace period.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Get a watch receiver for shutdown status.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.shutdown_watch.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.shutdown_watch_tx.send(true);
        }
    }

    /// Resolve once shutdown has been initiated.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns OS signals into a coordinated shutdown.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Wait for SIGTERM, SIGINT or SIGQUIT, then initiate shutdown.
    #[cfg(unix)]
    pub async fn run(self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
            _ = self.coordinator.wait_for_shutdown() => return Ok(()),
        }

        self.coordinator.shutdown();
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn run(self) -> Result<()> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C");
            }
            _ = self.coordinator.wait_for_shutdown() => return Ok(()),
        }
        self.coordinator.shutdown();
        Ok(())
    }
}

/// Spawned services of a node, awaited together on shutdown.
#[derive(Default)]
pub struct ServiceSet {
    services: Vec<(String, JoinHandle<Result<()>>)>,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named service onto the runtime.
    pub fn spawn<S, F>(&mut self, name: S, service: F)
    where
        S: Into<String>,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        info!(service = %name, "Starting service");
        self.services.push((name, tokio::spawn(service)));
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Wait for every service to stop, aborting stragglers after `timeout`.
    pub async fn join(self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;

        for (name, mut handle) in self.services {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => info!(service = %name, "Service stopped"),
                Ok(Ok(Err(e))) => error!(service = %name, error = %e, "Service failed"),
                Ok(Err(e)) => error!(service = %name, error = %e, "Service panicked"),
                Err(_) => {
                    warn!(service = %name, "Service did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

/// Extension trait for futures to make them shutdown-aware.
pub trait ShutdownAware: Sized {
    /// Run until completion or shutdown signal.
    fn with_shutdown(
        self,
        coordinator: &ShutdownCoordinator,
    ) -> impl Future<Output = Option<Self::Output>> + Send
    where
        Self: Future + Send,
        Self::Output: Send;
}

impl<F> ShutdownAware for F
where
    F: Future + Send,
    F::Output: Send,
{
    async fn with_shutdown(self, coordinator: &ShutdownCoordinator) -> Option<F::Output> {
        tokio::select! {
            result = self => Some(result),
            _ = coordinator.wait_for_shutdown() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_coordinator_shutdown() {
        let coordinator = ShutdownCoordinator::new();

        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_watch() {
        let coordinator = ShutdownCoordinator::new();
        let mut watch = coordinator.watch();

        assert!(!*watch.borrow());

        coordinator.shutdown();

        watch.changed().await.unwrap();
        assert!(*watch.borrow());
    }

    #[tokio::test]
    async fn test_signal_handler_returns_on_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let handler = SignalHandler::new(coordinator.clone());
        coordinator.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(200), handler.run()).await;
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_service_set_join() {
        let coordinator = ShutdownCoordinator::new();
        let mut services = ServiceSet::new();

        let c = coordinator.clone();
        services.spawn("waits", async move {
            c.wait_for_shutdown().await;
            Ok(())
        });
        services.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert_eq!(services.len(), 2);

        coordinator.shutdown();
        let joined = tokio::time::timeout(Duration::from_secs(5), services.join(Duration::from_millis(100))).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_aware() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(async { 42 }.with_shutdown(&coordinator).await, Some(42));
    }

    #[tokio::test]
    async fn test_shutdown_aware_cancelled() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();

        let task = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        };

        assert_eq!(task.with_shutdown(&coordinator).await, None);
    }
}
