use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use super::RecordStore;
use crate::core::models::{ObjectMetadata, RecordUpdate, TransferId, TransferRecord};
use crate::core::network::NetworkClass;
use crate::core::state::TransferState;

const COLUMNS: &str = "id, main_transfer_id, direction, state, bucket, key, file,
    is_multipart, is_last_part, part_number, multipart_id, bytes_total, bytes_current,
    range_start, range_end, file_offset, etag, network, retry_count, last_error, metadata,
    created_at, updated_at";

/// One row of the status audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLogEntry {
    pub id: String,
    pub state: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn history(&self, id: TransferId) -> Result<Vec<StatusLogEntry>> {
        history(&self.conn, id).await
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert(&self, record: &TransferRecord) -> Result<TransferId> {
        create(&self.conn, record.clone()).await
    }

    async fn update_fields(&self, id: TransferId, update: &RecordUpdate) -> Result<()> {
        update_fields(&self.conn, id, update.clone()).await
    }

    async fn get(&self, id: TransferId) -> Result<Option<TransferRecord>> {
        get(&self.conn, id).await
    }

    async fn query_non_terminal(&self) -> Result<Vec<TransferRecord>> {
        query(
            &self.conn,
            "WHERE main_transfer_id IS NULL
             AND state NOT IN ('COMPLETED', 'FAILED', 'CANCELED')
             ORDER BY rowid",
            None,
        )
        .await
    }

    async fn query_parts(&self, main_id: TransferId) -> Result<Vec<TransferRecord>> {
        query(
            &self.conn,
            "WHERE main_transfer_id = ?1 ORDER BY part_number",
            Some(main_id),
        )
        .await
    }

    async fn list(&self) -> Result<Vec<TransferRecord>> {
        query(&self.conn, "WHERE main_transfer_id IS NULL ORDER BY id", None).await
    }

    async fn delete(&self, id: TransferId) -> Result<()> {
        delete(&self.conn, id).await
    }
}

pub async fn create(conn: &Connection, record: TransferRecord) -> Result<TransferId> {
    let metadata = serde_json::to_string(&record.metadata)?;

    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO transfers (main_transfer_id, direction, state, bucket, key, file,
                is_multipart, is_last_part, part_number, multipart_id, bytes_total, bytes_current,
                range_start, range_end, file_offset, etag, network, retry_count, last_error,
                metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                record.main_transfer_id,
                record.direction.as_str(),
                record.state.as_str(),
                &record.bucket,
                &record.key,
                record.file.to_string_lossy().into_owned(),
                record.is_multipart,
                record.is_last_part,
                record.part_number,
                &record.multipart_id,
                record.bytes_total as i64,
                record.bytes_current as i64,
                record.range_start as i64,
                record.range_end.map(|end| end as i64),
                record.file_offset as i64,
                &record.etag,
                record.network.as_str(),
                record.retry_count,
                &record.last_error,
                metadata,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();

        let log_id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO transfer_status_log (id, transfer_id, state, description)
             VALUES (?1, ?2, ?3, 'Transfer created')",
            params![log_id, id, record.state.as_str()],
        )?;

        tx.commit()?;
        Ok::<TransferId, rusqlite::Error>(id)
    })
    .await
    .map_err(|e| anyhow!("Failed to create transfer: {}", e))
}

pub async fn update_fields(conn: &Connection, id: TransferId, update: RecordUpdate) -> Result<()> {
    use rusqlite::types::Value;

    let mut assignments: Vec<(&'static str, Value)> = Vec::new();
    if let Some(state) = update.state {
        assignments.push(("state", Value::Text(state.as_str().to_string())));
    }
    if let Some(bytes) = update.bytes_current {
        assignments.push(("bytes_current", Value::Integer(bytes as i64)));
    }
    if let Some(total) = update.bytes_total {
        assignments.push(("bytes_total", Value::Integer(total as i64)));
    }
    if let Some(offset) = update.file_offset {
        assignments.push(("file_offset", Value::Integer(offset as i64)));
    }
    if let Some(upload_id) = &update.multipart_id {
        assignments.push(("multipart_id", Value::Text(upload_id.clone())));
    }
    if let Some(etag) = &update.etag {
        assignments.push(("etag", Value::Text(etag.clone())));
    }
    if let Some(count) = update.retry_count {
        assignments.push(("retry_count", Value::Integer(i64::from(count))));
    }
    if let Some(error) = &update.last_error {
        assignments.push(("last_error", Value::Text(error.clone())));
    }
    if assignments.is_empty() {
        return Ok(());
    }
    assignments.push(("updated_at", Value::Text(Utc::now().to_rfc3339())));

    let set_clause = assignments
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE transfers SET {set_clause} WHERE id = ?{}",
        assignments.len() + 1
    );
    let mut values: Vec<Value> = assignments.into_iter().map(|(_, value)| value).collect();
    values.push(Value::Integer(id));

    conn.call(move |c| {
        let tx = c.transaction()?;
        let changed = tx.execute(&sql, rusqlite::params_from_iter(values))?;

        if changed > 0 {
            if let Some(state) = update.state {
                let log_id = Uuid::now_v7().to_string();
                tx.execute(
                    "INSERT INTO transfer_status_log (id, transfer_id, state, description)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![log_id, id, state.as_str(), update.last_error],
                )?;
            }
        }

        tx.commit()?;
        Ok::<usize, rusqlite::Error>(changed)
    })
    .await
    .map_err(|e| anyhow!("Failed to update transfer {}: {}", id, e))
    .and_then(|changed| {
        if changed == 0 {
            Err(anyhow!("Transfer {} does not exist", id))
        } else {
            Ok(())
        }
    })
}

pub async fn get(conn: &Connection, id: TransferId) -> Result<Option<TransferRecord>> {
    let mut found = query(conn, "WHERE id = ?1", Some(id)).await?;
    Ok(found.pop())
}

pub async fn delete(conn: &Connection, id: TransferId) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;
        tx.execute(
            "DELETE FROM transfer_status_log WHERE transfer_id IN
                (SELECT id FROM transfers WHERE id = ?1 OR main_transfer_id = ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM transfers WHERE main_transfer_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM transfers WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to delete transfer {}: {}", id, e))
}

pub async fn history(conn: &Connection, id: TransferId) -> Result<Vec<StatusLogEntry>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT id, state, description, COALESCE(created_at, '')
             FROM transfer_status_log
             WHERE transfer_id = ?1
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(StatusLogEntry {
                id: row.get(0)?,
                state: row.get(1)?,
                description: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to read history of transfer {}: {}", id, e))
}

async fn query(
    conn: &Connection,
    clause: &'static str,
    param: Option<TransferId>,
) -> Result<Vec<TransferRecord>> {
    conn.call(move |c| {
        let sql = format!("SELECT {COLUMNS} FROM transfers {clause}");
        let mut stmt = c.prepare(&sql)?;
        let rows = match param {
            Some(id) => stmt.query_map(params![id], record_from_row)?,
            None => stmt.query_map([], record_from_row)?,
        };
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to query transfers: {}", e))
}

fn conversion_error(idx: usize, e: impl Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        e.to_string().into(),
    )
}

fn parsed<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRecord> {
    let network: String = row.get(17)?;
    let metadata: String = row.get(20)?;

    Ok(TransferRecord {
        id: row.get(0)?,
        main_transfer_id: row.get(1)?,
        direction: parsed(row, 2)?,
        state: parsed::<TransferState>(row, 3)?,
        bucket: row.get(4)?,
        key: row.get(5)?,
        file: PathBuf::from(row.get::<_, String>(6)?),
        is_multipart: row.get(7)?,
        is_last_part: row.get(8)?,
        part_number: row.get(9)?,
        multipart_id: row.get(10)?,
        bytes_total: row.get::<_, i64>(11)? as u64,
        bytes_current: row.get::<_, i64>(12)? as u64,
        range_start: row.get::<_, i64>(13)? as u64,
        range_end: row.get::<_, Option<i64>>(14)?.map(|end| end as u64),
        file_offset: row.get::<_, i64>(15)? as u64,
        etag: row.get(16)?,
        network: NetworkClass::parse(&network)
            .ok_or_else(|| conversion_error(17, format!("unknown network class {network}")))?,
        retry_count: row.get(18)?,
        last_error: row.get(19)?,
        metadata: serde_json::from_str::<ObjectMetadata>(&metadata)
            .map_err(|e| conversion_error(20, e))?,
        created_at: timestamp(row, 21)?,
        updated_at: timestamp(row, 22)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_in_memory;

    async fn store() -> SqliteRecordStore {
        SqliteRecordStore::new(init_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let store = store().await;
        let record = TransferRecord::upload("b", "k", "/tmp/k", 10, NetworkClass::Any);
        let first = store.insert(&record).await.unwrap();
        let second = store.insert(&record).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn state_changes_are_logged() {
        let store = store().await;
        let record = TransferRecord::upload("b", "k", "/tmp/k", 10, NetworkClass::Any);
        let id = store.insert(&record).await.unwrap();

        store
            .update_fields(id, &RecordUpdate::state(TransferState::InProgress))
            .await
            .unwrap();
        store
            .update_fields(id, &RecordUpdate::progress(5, 10))
            .await
            .unwrap();

        let history = store.history(id).await.unwrap();
        let states: Vec<_> = history.iter().map(|h| h.state.as_str()).collect();
        assert_eq!(states, vec!["WAITING", "IN_PROGRESS"]);
    }

    #[tokio::test]
    async fn update_of_missing_record_fails() {
        let store = store().await;
        let result = store
            .update_fields(99, &RecordUpdate::state(TransferState::Paused))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn parts_are_listed_separately_and_deleted_with_parent() {
        let store = store().await;
        let mut parent = TransferRecord::upload("b", "k", "/tmp/k", 10, NetworkClass::Any);
        parent.is_multipart = true;
        parent.id = store.insert(&parent).await.unwrap();
        for (n, range) in [(2u32, 5..10), (1, 0..5)] {
            store.insert(&parent.part(n, range, n == 2)).await.unwrap();
        }

        let parts = store.query_parts(parent.id).await.unwrap();
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.query_non_terminal().await.unwrap().len(), 1);

        store.delete(parent.id).await.unwrap();
        assert!(store.get(parent.id).await.unwrap().is_none());
        assert!(store.query_parts(parent.id).await.unwrap().is_empty());
    }
}
