use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::scheduler::engine::DispatchEngine;
use crate::store::{MemoryStore, ResultStore, SqliteStore};
use crate::transport::{self, AppState, AuthState, Mailbox};

/// Dispatch server: the engine, its background loops and the HTTP
/// control plane.
pub struct FabricServer {
    config: ServerConfig,
    engine: Arc<DispatchEngine>,
}

impl FabricServer {
    /// Build a server backed by SQLite when a database path is configured,
    /// in memory otherwise.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn ResultStore> = match &config.database_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Opening result store");
                Arc::new(SqliteStore::open(path)?)
            }
            None => {
                tracing::warn!("No database configured, results are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn ResultStore>) -> Self {
        let engine = Arc::new(DispatchEngine::new(
            config.dispatch.clone(),
            store,
            Arc::new(Mailbox::new()),
        ));
        Self { config, engine }
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            poll_interval: self.config.poll_interval,
        };
        transport::router(state, AuthState::new(self.config.token.clone()))
    }

    /// Bind the configured address and run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    pub async fn run_with_listener(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        self.engine.spawn_loops(&tracker, shutdown.clone());
        tracker.close();

        let served = transport::serve(listener, self.router(), shutdown.clone()).await;
        // Stop the loops even when the listener failed on its own
        shutdown.cancel();
        tracker.wait().await;
        tracing::info!("Dispatch server stopped");
        served
    }
}
