//! Caller-side handle on one transfer.
//!
//! A [`TransferObserver`] keeps a cached copy of its record up to date through
//! an internal listener. That listener is always registered ahead of the
//! caller's, so by the time a caller callback runs the cache already reflects
//! the notification being delivered.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use super::error::TransferError;
use super::models::{TransferDirection, TransferId, TransferRecord};
use super::state::TransferState;
use super::status::{StatusUpdater, TransferListener};
use crate::utils::{lock_mutex, read_lock, write_lock};

struct CacheListener {
    record: RwLock<TransferRecord>,
    state_tx: watch::Sender<TransferState>,
}

impl CacheListener {
    fn replace(&self, record: TransferRecord) {
        let state = record.state;
        *write_lock(&self.record) = record;
        self.state_tx.send_replace(state);
    }
}

impl TransferListener for CacheListener {
    fn on_state_changed(&self, _id: TransferId, state: TransferState) {
        let mut record = write_lock(&self.record);
        // A terminal record only moves again when a part sub-ledger is
        // settled, which the observer does not track.
        if record.state.is_terminal() {
            return;
        }
        record.state = state;
        drop(record);
        self.state_tx.send_replace(state);
    }

    fn on_progress_changed(&self, _id: TransferId, bytes_current: u64, bytes_total: u64) {
        let mut record = write_lock(&self.record);
        record.bytes_current = bytes_current;
        record.bytes_total = bytes_total;
    }
}

pub struct TransferObserver {
    id: TransferId,
    updater: Arc<StatusUpdater>,
    cache: Arc<CacheListener>,
    attached: Mutex<bool>,
    listener: Mutex<Option<Arc<dyn TransferListener>>>,
}

impl TransferObserver {
    /// Attaches to a tracked transfer. Everything already queued for the
    /// transfer is delivered before the cache is filled, so the cache never
    /// starts out behind a notification that is still in flight.
    pub async fn attach(updater: Arc<StatusUpdater>, id: TransferId) -> Result<Self, TransferError> {
        let record = updater
            .snapshot(id)
            .await
            .ok_or(TransferError::NotFound(id))?;
        let (state_tx, _) = watch::channel(record.state);
        let observer = Self {
            id,
            updater,
            cache: Arc::new(CacheListener {
                record: RwLock::new(record),
                state_tx,
            }),
            attached: Mutex::new(false),
            listener: Mutex::new(None),
        };
        observer.attach_cache();
        observer.refresh().await?;
        Ok(observer)
    }

    fn cache_listener(&self) -> Arc<dyn TransferListener> {
        self.cache.clone()
    }

    fn attach_cache(&self) {
        let mut attached = lock_mutex(&self.attached);
        if !*attached {
            self.updater.register_listener(self.id, self.cache_listener());
            *attached = true;
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn state(&self) -> TransferState {
        read_lock(&self.cache.record).state
    }

    pub fn bytes_transferred(&self) -> u64 {
        read_lock(&self.cache.record).bytes_current
    }

    pub fn bytes_total(&self) -> u64 {
        read_lock(&self.cache.record).bytes_total
    }

    pub fn direction(&self) -> TransferDirection {
        read_lock(&self.cache.record).direction
    }

    /// Copy of the cached record.
    pub fn record(&self) -> TransferRecord {
        read_lock(&self.cache.record).clone()
    }

    /// Replaces the caller's listener. Callbacks are delivered after the
    /// cache has been updated.
    pub fn set_listener(&self, listener: Arc<dyn TransferListener>) {
        self.attach_cache();
        let mut current = lock_mutex(&self.listener);
        if let Some(previous) = current.take() {
            self.updater.unregister_listener(self.id, &previous);
        }
        self.updater.register_listener(self.id, listener.clone());
        *current = Some(listener);
    }

    /// Re-reads the record, from the updater while it is tracked and from
    /// storage once it has been released.
    pub async fn refresh(&self) -> Result<TransferRecord, TransferError> {
        self.updater.flush().await;
        let record = match self.updater.snapshot(self.id).await {
            Some(record) => record,
            None => self
                .updater
                .store()
                .get(self.id)
                .await
                .map_err(TransferError::persistence)?
                .ok_or(TransferError::NotFound(self.id))?,
        };
        self.cache.replace(record.clone());
        Ok(record)
    }

    /// Unregisters the caller's listener and stops updating the cache.
    /// `refresh` still works afterwards.
    pub fn clean_listener(&self) {
        if let Some(listener) = lock_mutex(&self.listener).take() {
            self.updater.unregister_listener(self.id, &listener);
        }
        let mut attached = lock_mutex(&self.attached);
        if *attached {
            self.updater.unregister_listener(self.id, &self.cache_listener());
            *attached = false;
        }
    }

    /// Waits up to `timeout` for a terminal state. Timing out leaves the
    /// transfer alone and returns `None`.
    pub async fn wait_for_terminal(&self, timeout: Duration) -> Option<TransferState> {
        self.attach_cache();
        let mut rx = self.cache.state_tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal())).await {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        }
    }
}

impl Drop for TransferObserver {
    fn drop(&mut self) {
        if *lock_mutex(&self.attached) {
            self.updater
                .unregister_listener(self.id, &self.cache_listener());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::NetworkClass;
    use crate::db::MemoryRecordStore;

    struct SeesCache {
        observer_state: Arc<Mutex<Vec<(TransferState, TransferState)>>>,
        cache: Arc<CacheListener>,
    }

    impl TransferListener for SeesCache {
        fn on_state_changed(&self, _id: TransferId, state: TransferState) {
            let cached = self.cache.record.read().unwrap().state;
            self.observer_state.lock().unwrap().push((state, cached));
        }
    }

    async fn setup() -> (Arc<StatusUpdater>, TransferRecord) {
        let updater = Arc::new(StatusUpdater::new(Arc::new(MemoryRecordStore::new()), 1));
        let record = updater
            .insert(TransferRecord::upload("b", "k", "/tmp/k", 10, NetworkClass::Any))
            .await
            .unwrap();
        (updater, record)
    }

    #[tokio::test]
    async fn cache_is_updated_before_caller_listener() {
        let (updater, record) = setup().await;
        let observer = TransferObserver::attach(updater.clone(), record.id).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        observer.set_listener(Arc::new(SeesCache {
            observer_state: seen.clone(),
            cache: observer.cache.clone(),
        }));

        updater.update_state(record.id, TransferState::InProgress).await.unwrap();
        updater.update_progress(record.id, 4, 10).await.unwrap();
        updater.flush().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(TransferState::InProgress, TransferState::InProgress)]
        );
        assert_eq!(observer.state(), TransferState::InProgress);
        assert_eq!(observer.bytes_transferred(), 4);
        assert_eq!(observer.bytes_total(), 10);
    }

    #[tokio::test]
    async fn wait_for_terminal_times_out_without_side_effects() {
        let (updater, record) = setup().await;
        let observer = TransferObserver::attach(updater.clone(), record.id).await.unwrap();

        assert_eq!(observer.wait_for_terminal(Duration::from_millis(20)).await, None);
        assert_eq!(observer.state(), TransferState::Waiting);

        updater.update_state(record.id, TransferState::InProgress).await.unwrap();
        updater.update_state(record.id, TransferState::Completed).await.unwrap();
        assert_eq!(
            observer.wait_for_terminal(Duration::from_secs(1)).await,
            Some(TransferState::Completed)
        );
    }

    #[tokio::test]
    async fn clean_listener_detaches_everything() {
        let (updater, record) = setup().await;
        let observer = TransferObserver::attach(updater.clone(), record.id).await.unwrap();
        observer.set_listener(Arc::new(SeesCache {
            observer_state: Arc::default(),
            cache: observer.cache.clone(),
        }));
        assert_eq!(updater.listener_count(record.id), 2);

        observer.clean_listener();
        assert_eq!(updater.listener_count(record.id), 0);

        updater.update_state(record.id, TransferState::InProgress).await.unwrap();
        assert_eq!(observer.state(), TransferState::Waiting);
        observer.refresh().await.unwrap();
        assert_eq!(observer.state(), TransferState::InProgress);
    }

    #[tokio::test]
    async fn refresh_falls_back_to_storage_after_release() {
        let (updater, record) = setup().await;
        let observer = TransferObserver::attach(updater.clone(), record.id).await.unwrap();
        updater.update_state(record.id, TransferState::Failed).await.unwrap();
        updater.release(record.id).await;

        let refreshed = observer.refresh().await.unwrap();
        assert_eq!(refreshed.state, TransferState::Failed);
    }
}
