use std::path::Path;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio_rusqlite::Connection;

use crate::core::models::{RecordUpdate, TransferId, TransferRecord};

pub mod memory;
pub mod transfers;

pub use memory::MemoryRecordStore;
pub use transfers::{SqliteRecordStore, StatusLogEntry};

/// Durable table of transfer records.
///
/// Only the status updater writes through this trait; everything else reads.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stores a new record and returns the id assigned to it.
    async fn insert(&self, record: &TransferRecord) -> Result<TransferId>;

    async fn update_fields(&self, id: TransferId, update: &RecordUpdate) -> Result<()>;

    async fn get(&self, id: TransferId) -> Result<Option<TransferRecord>>;

    /// Non-terminal transfers, excluding part records.
    async fn query_non_terminal(&self) -> Result<Vec<TransferRecord>>;

    /// Part records of a multipart transfer, ordered by part number.
    async fn query_parts(&self, main_id: TransferId) -> Result<Vec<TransferRecord>>;

    /// Every transfer, excluding part records.
    async fn list(&self) -> Result<Vec<TransferRecord>>;

    /// Removes a record together with its parts.
    async fn delete(&self, id: TransferId) -> Result<()>;
}

pub async fn init(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let conn = Connection::open(&path).await?;
    prepare(&conn).await?;
    Ok(conn)
}

pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    prepare(&conn).await?;
    Ok(conn)
}

async fn prepare(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        // Enable foreign keys (SQLite disables them by default!)
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to prepare database: {}", e))
}
