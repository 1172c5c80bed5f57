use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::adapters;
use crate::config::AppConfig;
use crate::core::{
    ConnectivitySource, ExecutorOptions, NetworkMonitor, StatusUpdater, TransferCoordinator,
};
use crate::db::{self, RecordStore, SqliteRecordStore};
use crate::store::{LocalDirStore, RemoteStore};

/// Everything a running hauler process shares.
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub records: Arc<dyn RecordStore>,
    /// Present when the records live in SQLite; gives access to the audit log.
    pub sqlite: Option<Arc<SqliteRecordStore>>,
    pub store: Arc<dyn RemoteStore>,
    pub monitor: Arc<NetworkMonitor>,
    pub coordinator: TransferCoordinator,
}

impl AppContext {
    /// SQLite records, a directory-backed object store and the platform
    /// connectivity source.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let conn = db::init(&config.database_path)
            .await
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
        let sqlite = Arc::new(SqliteRecordStore::new(conn));
        let store: Arc<dyn RemoteStore> = Arc::new(LocalDirStore::new(&config.storage_root));
        let source = adapters::get_source(
            config.simulation,
            Duration::from_millis(config.network.poll_interval_ms),
        );

        let mut ctx = Self::with_parts(config, sqlite.clone(), store, source);
        ctx.sqlite = Some(sqlite);
        Ok(ctx)
    }

    /// Wires the core around the given collaborators and starts the network
    /// monitor. Must be called from within a Tokio runtime.
    pub fn with_parts(
        config: AppConfig,
        records: Arc<dyn RecordStore>,
        store: Arc<dyn RemoteStore>,
        source: Arc<dyn ConnectivitySource>,
    ) -> Self {
        let monitor = Arc::new(NetworkMonitor::new(source));
        monitor.init();

        let updater = Arc::new(StatusUpdater::new(
            Arc::clone(&records),
            config.transfer.callback_lanes,
        ));
        let coordinator = TransferCoordinator::new(
            Arc::clone(&store),
            updater,
            Arc::clone(&monitor),
            ExecutorOptions::from(&config.transfer),
            config.transfer.default_network,
        );

        Self {
            config: Arc::new(config),
            records,
            sqlite: None,
            store,
            monitor,
            coordinator,
        }
    }

    /// Stops transfers and the network monitor. Persisted state is kept.
    pub async fn shutdown(&self, timeout: Duration) {
        self.coordinator.shutdown(timeout).await;
        self.monitor.teardown();
    }
}
