//! Record store kept in memory. Used by tests and simulation runs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;

use super::RecordStore;
use crate::core::models::{RecordUpdate, TransferId, TransferRecord};
use crate::utils::lock_mutex;

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<TransferId, TransferRecord>>,
    last_id: AtomicI64,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("record store is read-only");
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &TransferRecord) -> Result<TransferId> {
        self.check_writable()?;
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = record.clone();
        stored.id = id;
        lock_mutex(&self.records).insert(id, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn update_fields(&self, id: TransferId, update: &RecordUpdate) -> Result<()> {
        self.check_writable()?;
        let mut records = lock_mutex(&self.records);
        let Some(record) = records.get_mut(&id) else {
            bail!("Transfer {} does not exist", id);
        };
        update.apply_to(record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: TransferId) -> Result<Option<TransferRecord>> {
        Ok(lock_mutex(&self.records).get(&id).cloned())
    }

    async fn query_non_terminal(&self) -> Result<Vec<TransferRecord>> {
        Ok(lock_mutex(&self.records)
            .values()
            .filter(|r| r.main_transfer_id.is_none() && !r.is_terminal())
            .cloned()
            .collect())
    }

    async fn query_parts(&self, main_id: TransferId) -> Result<Vec<TransferRecord>> {
        let mut parts: Vec<_> = lock_mutex(&self.records)
            .values()
            .filter(|r| r.main_transfer_id == Some(main_id))
            .cloned()
            .collect();
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn list(&self) -> Result<Vec<TransferRecord>> {
        Ok(lock_mutex(&self.records)
            .values()
            .filter(|r| r.main_transfer_id.is_none())
            .cloned()
            .collect())
    }

    async fn delete(&self, id: TransferId) -> Result<()> {
        self.check_writable()?;
        lock_mutex(&self.records).retain(|key, r| *key != id && r.main_transfer_id != Some(id));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
