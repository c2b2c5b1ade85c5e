//! Common test utilities for integration tests.

pub mod fixtures;

use axum::Router;
use flowerloop::config::{ModelConfig, StorageConfig};
use flowerloop::model::ModelRegistry;
use flowerloop::queue::FsQueue;
use flowerloop::shutdown::ShutdownCoordinator;
use flowerloop::storage::FsBlobStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

// Re-export common types
pub use fixtures::*;

/// Test environment with filesystem-backed blob storage and queue.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub storage: StorageConfig,
    pub blobs: Arc<FsBlobStore>,
    pub queue: Arc<FsQueue>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let storage = StorageConfig {
            root: temp_dir.path().join("storage"),
            ..StorageConfig::default()
        };
        let blobs = Arc::new(FsBlobStore::open(storage.container_dir()).expect("Failed to open blob store"));
        let queue = Arc::new(FsQueue::open(storage.queue_dir()).expect("Failed to open queue"));

        Self {
            temp_dir,
            storage,
            blobs,
            queue,
        }
    }

    /// Creates a sub-directory in the temp dir
    pub fn subdir(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create subdir");
        path
    }

    /// Registry over this environment's blob store.
    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::new(self.blobs.clone(), small_model_config(), 4))
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A model small enough to train quickly in tests.
pub fn small_model_config() -> ModelConfig {
    ModelConfig {
        input_res: 16,
        pool_grid: 4,
        ..ModelConfig::default()
    }
}

/// A router served on an ephemeral local port.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: ShutdownCoordinator,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start(app: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Listener has no address");
        let shutdown = ShutdownCoordinator::new();

        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.wait_for_shutdown().await })
                .await
                .expect("Test server failed");
        });

        assert!(wait_for_server(&addr.to_string(), 5).await, "server did not become ready");
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(self) {
        self.shutdown.shutdown();
        let _ = self.handle.await;
    }
}

/// Wait for a server to be ready by polling a health endpoint.
pub async fn wait_for_server(addr: &str, timeout_secs: u64) -> bool {
    let client = reqwest::Client::new();
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if let Ok(response) = client.get(format!("http://{}/health", addr)).send().await {
            if response.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}

/// Find an address nothing is listening on.
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port");
    listener.local_addr().unwrap()
}
