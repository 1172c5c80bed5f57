//! Single writer for transfer records.
//!
//! Every mutation of a record goes through [`StatusUpdater`]. Mutations of one
//! record are serialized by a per-record async mutex, persisted first and only
//! then announced to listeners. Notifications are delivered by
//! [`CallbackDispatcher`] lanes: a transfer id always maps to the same lane, so
//! listeners never race themselves for one transfer while different transfers
//! are delivered concurrently.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::models::{RecordUpdate, TransferId, TransferRecord};
use super::state::{TransferEvent, TransferState};
use crate::db::RecordStore;
use crate::utils::{read_lock, write_lock};

/// Prefix of `last_error` when a transfer ran out of local disk or quota.
pub const OUT_OF_SPACE: &str = "out of local storage";

/// Receives state, progress and error notifications for one transfer.
///
/// Callbacks run on a dispatcher lane, not on the worker that caused them,
/// and must not block for long.
pub trait TransferListener: Send + Sync {
    fn on_state_changed(&self, id: TransferId, state: TransferState);

    fn on_progress_changed(&self, _id: TransferId, _bytes_current: u64, _bytes_total: u64) {}

    /// Called before the `FAILED` state notification. Never called for
    /// cancellation.
    fn on_error(&self, _id: TransferId, _error: &TransferError) {}
}

type ListenerMap = Arc<RwLock<HashMap<TransferId, Vec<Arc<dyn TransferListener>>>>>;

enum Notification {
    State {
        id: TransferId,
        state: TransferState,
    },
    Progress {
        id: TransferId,
        current: u64,
        total: u64,
    },
    Error {
        id: TransferId,
        error: TransferError,
    },
    Flush(oneshot::Sender<()>),
}

const MAX_BATCH: usize = 256;

/// Fixed set of delivery lanes, each drained by its own task.
pub struct CallbackDispatcher {
    lanes: Vec<mpsc::UnboundedSender<Notification>>,
}

impl CallbackDispatcher {
    fn new(lanes: usize, listeners: ListenerMap) -> Self {
        let lanes = (0..lanes.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_lane(rx, Arc::clone(&listeners)));
                tx
            })
            .collect();
        Self { lanes }
    }

    fn lane(&self, id: TransferId) -> &mpsc::UnboundedSender<Notification> {
        let index = id.rem_euclid(self.lanes.len() as i64) as usize;
        &self.lanes[index]
    }

    fn send(&self, id: TransferId, notification: Notification) {
        if self.lane(id).send(notification).is_err() {
            debug!(transfer_id = id, "Callback lane closed, dropping notification");
        }
    }

    /// Waits until everything enqueued so far has been delivered.
    async fn flush(&self) {
        let mut waits = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            let (tx, rx) = oneshot::channel();
            if lane.send(Notification::Flush(tx)).is_ok() {
                waits.push(rx);
            }
        }
        for wait in waits {
            let _ = wait.await;
        }
    }
}

async fn run_lane(mut rx: mpsc::UnboundedReceiver<Notification>, listeners: ListenerMap) {
    let mut batch = Vec::new();
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        let superseded = superseded_progress(&batch);
        for (index, notification) in batch.drain(..).enumerate() {
            if superseded.contains(&index) {
                continue;
            }
            deliver(notification, &listeners);
        }
    }
}

/// Indexes of progress ticks followed by a newer tick for the same transfer
/// with no state change or error in between.
fn superseded_progress(batch: &[Notification]) -> HashSet<usize> {
    let mut newer = HashSet::new();
    let mut superseded = HashSet::new();
    for (index, notification) in batch.iter().enumerate().rev() {
        match notification {
            Notification::Progress { id, .. } => {
                if !newer.insert(*id) {
                    superseded.insert(index);
                }
            }
            Notification::State { id, .. } | Notification::Error { id, .. } => {
                newer.remove(id);
            }
            Notification::Flush(_) => {}
        }
    }
    superseded
}

fn deliver(notification: Notification, listeners: &ListenerMap) {
    let id = match notification {
        Notification::Flush(done) => {
            let _ = done.send(());
            return;
        }
        Notification::State { id, .. }
        | Notification::Progress { id, .. }
        | Notification::Error { id, .. } => id,
    };

    let targets = read_lock(listeners).get(&id).cloned().unwrap_or_default();
    for listener in targets {
        let outcome = catch_unwind(AssertUnwindSafe(|| match &notification {
            Notification::State { id, state } => listener.on_state_changed(*id, *state),
            Notification::Progress { id, current, total } => {
                listener.on_progress_changed(*id, *current, *total)
            }
            Notification::Error { id, error } => listener.on_error(*id, error),
            Notification::Flush(_) => {}
        }));
        if outcome.is_err() {
            warn!(transfer_id = id, "Transfer listener panicked");
        }
    }
}

type RecordCell = Arc<Mutex<TransferRecord>>;

pub struct StatusUpdater {
    store: Arc<dyn RecordStore>,
    records: RwLock<HashMap<TransferId, RecordCell>>,
    listeners: ListenerMap,
    dispatcher: CallbackDispatcher,
}

impl StatusUpdater {
    /// Must be called from within a Tokio runtime; spawns the callback lanes.
    pub fn new(store: Arc<dyn RecordStore>, callback_lanes: usize) -> Self {
        let listeners: ListenerMap = Arc::new(RwLock::new(HashMap::new()));
        Self {
            store,
            records: RwLock::new(HashMap::new()),
            dispatcher: CallbackDispatcher::new(callback_lanes, Arc::clone(&listeners)),
            listeners,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    fn cell(&self, id: TransferId) -> Result<RecordCell, TransferError> {
        read_lock(&self.records)
            .get(&id)
            .cloned()
            .ok_or(TransferError::NotFound(id))
    }

    fn track(&self, record: TransferRecord) -> TransferRecord {
        let mut records = write_lock(&self.records);
        let snapshot = record.clone();
        records
            .entry(record.id)
            .or_insert_with(|| Arc::new(Mutex::new(record)));
        snapshot
    }


    /// Ids of tracked transfers, parts excluded.
    pub async fn transfer_ids(&self) -> Vec<TransferId> {
        let cells: Vec<(TransferId, RecordCell)> = read_lock(&self.records)
            .iter()
            .map(|(id, cell)| (*id, Arc::clone(cell)))
            .collect();
        let mut ids = Vec::new();
        for (id, cell) in cells {
            if !cell.lock().await.is_part() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids
    }

    /// Persists a new record, assigns its id and starts tracking it.
    pub async fn insert(&self, mut record: TransferRecord) -> Result<TransferRecord, TransferError> {
        record.id = self
            .store
            .insert(&record)
            .await
            .map_err(TransferError::persistence)?;
        debug!(transfer_id = record.id, direction = %record.direction, "Tracking new transfer");
        Ok(self.track(record))
    }

    /// Copy of the current record.
    pub async fn snapshot(&self, id: TransferId) -> Option<TransferRecord> {
        let cell = self.cell(id).ok()?;
        let record = cell.lock().await;
        Some(record.clone())
    }

    pub async fn update_state(
        &self,
        id: TransferId,
        next: TransferState,
    ) -> Result<bool, TransferError> {
        self.transition(id, |current| current.can_transition_to(next).then_some(next))
            .await
            .map(|applied| applied.is_some())
    }

    /// Applies a state machine event. Returns the new state, or `None` when
    /// the event is not valid in the current state.
    pub async fn apply_event(
        &self,
        id: TransferId,
        event: TransferEvent,
    ) -> Result<Option<TransferState>, TransferError> {
        self.transition(id, |current| current.apply(event)).await
    }

    async fn transition<F>(&self, id: TransferId, decide: F) -> Result<Option<TransferState>, TransferError>
    where
        F: FnOnce(TransferState) -> Option<TransferState>,
    {
        let cell = self.cell(id)?;
        let mut record = cell.lock().await;
        let current = record.state;
        let Some(next) = decide(current) else {
            debug!(transfer_id = id, state = %current, "Transition rejected");
            return Ok(None);
        };

        let update = RecordUpdate::state(next);
        self.commit(&mut record, &update).await?;
        debug!(transfer_id = id, from = %current, to = %next, "State changed");
        self.dispatcher
            .send(id, Notification::State { id, state: next });
        Ok(Some(next))
    }

    /// Records progress. Ticks behind the stored value are dropped so that
    /// listeners only ever see non-decreasing byte counts.
    pub async fn update_progress(
        &self,
        id: TransferId,
        bytes_current: u64,
        bytes_total: u64,
    ) -> Result<bool, TransferError> {
        let cell = self.cell(id)?;
        let mut record = cell.lock().await;
        if record.is_terminal() || bytes_current < record.bytes_current {
            return Ok(false);
        }

        let total = if bytes_total > 0 {
            bytes_total
        } else {
            record.bytes_total
        };
        let current = if total > 0 {
            bytes_current.min(total)
        } else {
            bytes_current
        };
        if current == record.bytes_current && total == record.bytes_total {
            return Ok(false);
        }

        self.commit(&mut record, &RecordUpdate::progress(current, total))
            .await?;
        self.dispatcher.send(
            id,
            Notification::Progress {
                id,
                current,
                total,
            },
        );
        Ok(true)
    }

    /// Applies a partial update. A state change in `update` is validated
    /// against the transition table; `None` means it was rejected and nothing
    /// was written.
    pub async fn update_record(
        &self,
        id: TransferId,
        update: RecordUpdate,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let cell = self.cell(id)?;
        let mut record = cell.lock().await;
        if let Some(next) = update.state {
            if !record.state.can_transition_to(next) {
                debug!(transfer_id = id, state = %record.state, to = %next, "Update rejected");
                return Ok(None);
            }
        }
        if update.is_empty() {
            return Ok(Some(record.clone()));
        }

        let before = (record.bytes_current, record.bytes_total);
        self.commit(&mut record, &update).await?;

        if let Some(state) = update.state {
            self.dispatcher.send(id, Notification::State { id, state });
        }
        if (record.bytes_current, record.bytes_total) != before {
            self.dispatcher.send(
                id,
                Notification::Progress {
                    id,
                    current: record.bytes_current,
                    total: record.bytes_total,
                },
            );
        }
        Ok(Some(record.clone()))
    }

    /// Moves a record to `FAILED`, announcing the error first.
    pub async fn fail(&self, id: TransferId, error: &TransferError) -> Result<bool, TransferError> {
        let cell = self.cell(id)?;
        let mut record = cell.lock().await;
        if !record.state.can_transition_to(TransferState::Failed) {
            return Ok(false);
        }

        let out_of_space = error.is_out_of_space();
        let last_error = if out_of_space {
            format!("{OUT_OF_SPACE}: {error}")
        } else {
            error.to_string()
        };
        let update = RecordUpdate {
            state: Some(TransferState::Failed),
            last_error: Some(last_error),
            ..Default::default()
        };
        self.commit(&mut record, &update).await?;
        if out_of_space {
            warn!(
                transfer_id = id,
                path = %record.file.display(),
                error = %error,
                "Transfer failed, local disk is full"
            );
        } else {
            warn!(transfer_id = id, error = %error, "Transfer failed");
        }
        self.dispatcher.send(
            id,
            Notification::Error {
                id,
                error: error.clone(),
            },
        );
        self.dispatcher.send(
            id,
            Notification::State {
                id,
                state: TransferState::Failed,
            },
        );
        Ok(true)
    }

    /// Persists `update` and only then applies it to the in-memory record.
    async fn commit(
        &self,
        record: &mut TransferRecord,
        update: &RecordUpdate,
    ) -> Result<(), TransferError> {
        let mut next = record.clone();
        update.apply_to(&mut next);
        self.store
            .update_fields(record.id, update)
            .await
            .map_err(TransferError::persistence)?;
        *record = next;
        Ok(())
    }

    pub fn register_listener(&self, id: TransferId, listener: Arc<dyn TransferListener>) {
        let mut listeners = write_lock(&self.listeners);
        let entry = listeners.entry(id).or_default();
        match entry.iter().position(|l| same_listener(l, &listener)) {
            Some(index) => entry[index] = listener,
            None => entry.push(listener),
        }
    }

    pub fn unregister_listener(&self, id: TransferId, listener: &Arc<dyn TransferListener>) {
        let mut listeners = write_lock(&self.listeners);
        if let Some(entry) = listeners.get_mut(&id) {
            entry.retain(|l| !same_listener(l, listener));
            if entry.is_empty() {
                listeners.remove(&id);
            }
        }
    }

    pub fn listener_count(&self, id: TransferId) -> usize {
        read_lock(&self.listeners).get(&id).map_or(0, Vec::len)
    }

    /// Loads non-terminal transfers from the store, normalizing in-flight
    /// states left behind by a previous process. Already tracked records keep
    /// their in-memory state.
    pub async fn load_non_terminal(&self) -> Result<Vec<TransferRecord>, TransferError> {
        let stored = self
            .store
            .query_non_terminal()
            .await
            .map_err(TransferError::persistence)?;

        let mut loaded = Vec::with_capacity(stored.len());
        for record in stored {
            loaded.push(self.adopt(record).await?);
        }
        info!(count = loaded.len(), "Loaded pending transfers");
        Ok(loaded)
    }

    /// Loads (or returns the tracked) part records of a multipart transfer.
    pub async fn load_parts(&self, main_id: TransferId) -> Result<Vec<TransferRecord>, TransferError> {
        let stored = self
            .store
            .query_parts(main_id)
            .await
            .map_err(TransferError::persistence)?;

        let mut parts = Vec::with_capacity(stored.len());
        for record in stored {
            parts.push(self.adopt(record).await?);
        }
        Ok(parts)
    }

    async fn adopt(&self, mut record: TransferRecord) -> Result<TransferRecord, TransferError> {
        if let Some(tracked) = self.snapshot(record.id).await {
            return Ok(tracked);
        }

        let normalized = record.state.normalized_on_reload();
        if normalized != record.state {
            let update = RecordUpdate::state(normalized);
            self.store
                .update_fields(record.id, &update)
                .await
                .map_err(TransferError::persistence)?;
            debug!(transfer_id = record.id, from = %record.state, to = %normalized, "Normalized reloaded state");
            update.apply_to(&mut record);
        }
        Ok(self.track(record))
    }

    /// Tracked part records of `main_id`, ordered by part number.
    pub async fn parts_of(&self, main_id: TransferId) -> Vec<TransferRecord> {
        let cells: Vec<RecordCell> = read_lock(&self.records).values().cloned().collect();
        let mut parts = Vec::new();
        for cell in cells {
            let record = cell.lock().await;
            if record.main_transfer_id == Some(main_id) {
                parts.push(record.clone());
            }
        }
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// Brings the parts of a multipart transfer in line with the state its
    /// parent settled in.
    ///
    /// Parts are a sub-ledger of the parent: they follow it without going
    /// through the pending states. A canceled parent cancels every part,
    /// completed ones included, since the remote session is gone.
    pub async fn settle_parts(
        &self,
        main_id: TransferId,
        target: TransferState,
    ) -> Result<(), TransferError> {
        let ids: Vec<TransferId> = self
            .parts_of(main_id)
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();

        for id in ids {
            let cell = self.cell(id)?;
            let mut part = cell.lock().await;
            let applies = match target {
                TransferState::Canceled => part.state != TransferState::Canceled,
                TransferState::Paused
                | TransferState::WaitingForNetwork
                | TransferState::Waiting
                | TransferState::Failed => !part.is_terminal() && part.state != target,
                _ => false,
            };
            if !applies {
                continue;
            }

            self.commit(&mut part, &RecordUpdate::state(target)).await?;
            self.dispatcher
                .send(id, Notification::State { id, state: target });
        }
        Ok(())
    }

    /// Stops tracking a transfer and its parts. The stored rows stay.
    pub async fn release(&self, id: TransferId) {
        let parts: Vec<TransferId> = self.parts_of(id).await.iter().map(|p| p.id).collect();
        let mut records = write_lock(&self.records);
        let mut listeners = write_lock(&self.listeners);
        for key in parts.into_iter().chain(std::iter::once(id)) {
            records.remove(&key);
            listeners.remove(&key);
        }
    }

    /// Removes a transfer and its parts from the store and stops tracking it.
    pub async fn delete(&self, id: TransferId) -> Result<(), TransferError> {
        self.store
            .delete(id)
            .await
            .map_err(TransferError::persistence)?;
        self.release(id).await;
        Ok(())
    }

    /// Waits until every notification enqueued so far has been delivered.
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }
}

fn same_listener(a: &Arc<dyn TransferListener>, b: &Arc<dyn TransferListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::NetworkClass;
    use crate::db::MemoryRecordStore;

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TransferListener for Recorder {
        fn on_state_changed(&self, _id: TransferId, state: TransferState) {
            self.events.lock().unwrap().push(state.to_string());
        }

        fn on_progress_changed(&self, _id: TransferId, current: u64, _total: u64) {
            self.events.lock().unwrap().push(format!("progress {current}"));
        }

        fn on_error(&self, _id: TransferId, _error: &TransferError) {
            self.events.lock().unwrap().push("error".into());
        }
    }

    async fn updater() -> (Arc<MemoryRecordStore>, StatusUpdater, TransferRecord) {
        let store = Arc::new(MemoryRecordStore::new());
        let updater = StatusUpdater::new(store.clone(), 2);
        let record = updater
            .insert(TransferRecord::upload("b", "k", "/tmp/k", 100, NetworkClass::Any))
            .await
            .unwrap();
        (store, updater, record)
    }

    #[tokio::test]
    async fn state_changes_are_persisted_then_delivered() {
        let (store, updater, record) = updater().await;
        let recorder = Arc::new(Recorder::default());
        updater.register_listener(record.id, recorder.clone());

        assert!(updater.update_state(record.id, TransferState::InProgress).await.unwrap());
        assert!(!updater.update_state(record.id, TransferState::Paused).await.unwrap());
        updater.flush().await;

        assert_eq!(recorder.events(), vec!["IN_PROGRESS"]);
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::InProgress);
    }

    #[tokio::test]
    async fn progress_never_goes_backwards() {
        let (_store, updater, record) = updater().await;
        updater.update_progress(record.id, 50, 100).await.unwrap();
        assert!(!updater.update_progress(record.id, 20, 100).await.unwrap());
        updater.update_progress(record.id, 500, 100).await.unwrap();

        let snapshot = updater.snapshot(record.id).await.unwrap();
        assert_eq!(snapshot.bytes_current, 100);
    }

    #[tokio::test]
    async fn failed_persistence_means_no_notification() {
        let (store, updater, record) = updater().await;
        let recorder = Arc::new(Recorder::default());
        updater.register_listener(record.id, recorder.clone());

        store.set_fail_writes(true);
        let result = updater.update_state(record.id, TransferState::InProgress).await;
        assert!(matches!(result, Err(TransferError::Persistence(_))));
        updater.flush().await;

        assert!(recorder.events().is_empty());
        let snapshot = updater.snapshot(record.id).await.unwrap();
        assert_eq!(snapshot.state, TransferState::Waiting);
    }

    #[tokio::test]
    async fn error_is_announced_before_failed() {
        let (_store, updater, record) = updater().await;
        let recorder = Arc::new(Recorder::default());
        updater.register_listener(record.id, recorder.clone());

        updater.update_state(record.id, TransferState::InProgress).await.unwrap();
        let error = TransferError::InvalidRecord("broken".into());
        assert!(updater.fail(record.id, &error).await.unwrap());
        updater.flush().await;

        assert_eq!(recorder.events(), vec!["IN_PROGRESS", "error", "FAILED"]);
        let snapshot = updater.snapshot(record.id).await.unwrap();
        assert_eq!(snapshot.last_error.as_deref(), Some("invalid transfer: broken"));
    }

    #[tokio::test]
    async fn disk_full_is_called_out_in_last_error() {
        let (_store, updater, record) = updater().await;
        updater.update_state(record.id, TransferState::InProgress).await.unwrap();

        let error = TransferError::local("/tmp/k", std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(updater.fail(record.id, &error).await.unwrap());

        let snapshot = updater.snapshot(record.id).await.unwrap();
        let last_error = snapshot.last_error.unwrap();
        assert!(last_error.starts_with(OUT_OF_SPACE), "{last_error}");
        assert!(last_error.contains("/tmp/k"));
    }

    #[tokio::test]
    async fn duplicate_registration_replaces() {
        let (_store, updater, record) = updater().await;
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let first_dyn: Arc<dyn TransferListener> = first.clone();

        updater.register_listener(record.id, first_dyn.clone());
        updater.register_listener(record.id, second.clone());
        updater.register_listener(record.id, first_dyn.clone());
        assert_eq!(updater.listener_count(record.id), 2);

        updater.update_state(record.id, TransferState::InProgress).await.unwrap();
        updater.flush().await;
        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);

        updater.unregister_listener(record.id, &first_dyn);
        assert_eq!(updater.listener_count(record.id), 1);
    }

    #[tokio::test]
    async fn reload_normalizes_in_flight_states() {
        let store = Arc::new(MemoryRecordStore::new());
        let mut record = TransferRecord::upload("b", "k", "/tmp/k", 100, NetworkClass::Any);
        record.state = TransferState::InProgress;
        record.bytes_current = 40;
        let id = store.insert(&record).await.unwrap();

        let updater = StatusUpdater::new(store.clone(), 1);
        let loaded = updater.load_non_terminal().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, TransferState::Waiting);
        assert_eq!(loaded[0].bytes_current, 40);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().state,
            TransferState::Waiting
        );
    }

    #[tokio::test]
    async fn canceled_parent_cancels_every_part() {
        let (_store, updater, mut parent) = updater().await;
        parent.is_multipart = true;
        let done = updater.insert(parent.part(1, 0..50, false)).await.unwrap();
        let running = updater.insert(parent.part(2, 50..100, true)).await.unwrap();
        updater.update_state(done.id, TransferState::InProgress).await.unwrap();
        updater.update_state(done.id, TransferState::Completed).await.unwrap();
        updater.update_state(running.id, TransferState::InProgress).await.unwrap();

        updater.settle_parts(parent.id, TransferState::Canceled).await.unwrap();

        for part in updater.parts_of(parent.id).await {
            assert_eq!(part.state, TransferState::Canceled);
        }
    }

    #[test]
    fn stale_progress_is_coalesced() {
        let batch = vec![
            Notification::Progress { id: 1, current: 1, total: 9 },
            Notification::Progress { id: 2, current: 1, total: 9 },
            Notification::Progress { id: 1, current: 2, total: 9 },
            Notification::State { id: 1, state: TransferState::Paused },
            Notification::Progress { id: 1, current: 3, total: 9 },
        ];
        let superseded = superseded_progress(&batch);
        assert_eq!(superseded, HashSet::from([0]));
    }
}
