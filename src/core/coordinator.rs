//! Top-level transfer API.
//!
//! [`TransferCoordinator`] creates records, decides when they may run and
//! drives the pause, cancel and resume transitions. Commands for one transfer
//! are serialized by a per-transfer lock; the lock is also taken by the event
//! loop that settles a transfer once its task has stopped, so a command never
//! interleaves with the resolution of an earlier one.
//!
//! A stop request against a running task only moves the record to a pending
//! state and cancels the task. The event loop resolves the pending state when
//! the task reports back. A completion the remote store already confirmed
//! wins over a pending stop; any other outcome yields to it.

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::error::TransferError;
use super::executor::{ExecutorOptions, TaskEvent, TaskOutcome, TransferExecutor};
use super::models::{ObjectMetadata, TransferDirection, TransferId, TransferRecord};
use super::network::{NetworkChange, NetworkClass, NetworkMonitor};
use super::observer::TransferObserver;
use super::state::{TransferEvent, TransferState};
use super::status::StatusUpdater;
use crate::store::{ObjectTarget, RemoteStore, validate_target};
use crate::utils::lock_mutex;

/// How long `delete_record` waits for a canceled task to stop.
const DELETE_WAIT: Duration = Duration::from_secs(10);

/// What to transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub bucket: String,
    pub key: String,
    pub file: PathBuf,
    /// Falls back to the coordinator's default class.
    pub network: Option<NetworkClass>,
    pub metadata: ObjectMetadata,
    /// Byte range of the object to download.
    pub range: Option<Range<u64>>,
}

impl TransferRequest {
    pub fn upload(bucket: impl Into<String>, key: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self::new(TransferDirection::Upload, bucket, key, file)
    }

    pub fn download(bucket: impl Into<String>, key: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self::new(TransferDirection::Download, bucket, key, file)
    }

    fn new(
        direction: TransferDirection,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            direction,
            bucket: bucket.into(),
            key: key.into(),
            file: file.into(),
            network: None,
            metadata: ObjectMetadata::default(),
            range: None,
        }
    }

    pub fn network(mut self, network: NetworkClass) -> Self {
        self.network = Some(network);
        self
    }

    pub fn metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    updater: Arc<StatusUpdater>,
    monitor: Arc<NetworkMonitor>,
    executor: TransferExecutor,
    default_network: NetworkClass,
    locks: Mutex<HashMap<TransferId, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
}

pub struct TransferCoordinator {
    inner: Arc<Inner>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TransferCoordinator {
    /// Builds the executor and starts the event loop. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        updater: Arc<StatusUpdater>,
        monitor: Arc<NetworkMonitor>,
        options: ExecutorOptions,
        default_network: NetworkClass,
    ) -> Self {
        let (executor, events) = TransferExecutor::new(
            Arc::clone(&store),
            Arc::clone(&updater),
            Arc::clone(&monitor),
            options,
        );

        let (network_tx, network_rx) = mpsc::unbounded_channel();
        monitor.on_change(move |change| {
            let _ = network_tx.send(change);
        });

        let inner = Arc::new(Inner {
            store,
            updater,
            monitor,
            executor,
            default_network,
            locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        let event_loop = tokio::spawn(
            run_event_loop(Arc::downgrade(&inner), events, network_rx, inner.shutdown.clone())
                .instrument(info_span!("coordinator")),
        );

        Self {
            inner,
            event_loop: Mutex::new(Some(event_loop)),
        }
    }

    pub fn updater(&self) -> &Arc<StatusUpdater> {
        &self.inner.updater
    }

    pub fn executor(&self) -> &TransferExecutor {
        &self.inner.executor
    }

    pub async fn start_upload(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file: impl Into<PathBuf>,
    ) -> Result<TransferObserver, TransferError> {
        self.start(TransferRequest::upload(bucket, key, file)).await
    }

    pub async fn start_download(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file: impl Into<PathBuf>,
    ) -> Result<TransferObserver, TransferError> {
        self.start(TransferRequest::download(bucket, key, file)).await
    }

    /// Creates the record and runs it right away if its network is
    /// reachable, otherwise parks it in `WAITING_FOR_NETWORK`.
    pub async fn start(&self, request: TransferRequest) -> Result<TransferObserver, TransferError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        validate_target(&ObjectTarget::new(&request.bucket, &request.key))?;
        let record = self.inner.build_record(request).await?;

        let record = self.inner.updater.insert(record).await?;
        let id = record.id;
        info!(
            transfer_id = id,
            direction = %record.direction,
            bucket = %record.bucket,
            key = %record.key,
            bytes = record.bytes_total,
            multipart = record.is_multipart,
            "Transfer created"
        );

        let observer = TransferObserver::attach(Arc::clone(&self.inner.updater), id).await?;
        let _guard = self.inner.lock(id).await;
        self.inner.try_run(id).await?;
        Ok(observer)
    }

    /// Returns `Ok(false)` when there is nothing to pause.
    pub async fn pause(&self, id: TransferId) -> Result<bool, TransferError> {
        self.inner.pause(id).await
    }

    /// Returns `Ok(false)` unless the transfer is `PAUSED`.
    pub async fn resume(&self, id: TransferId) -> Result<bool, TransferError> {
        let _guard = self.inner.lock(id).await;
        let record = self.inner.tracked(id).await?;
        if record.state != TransferState::Paused {
            debug!(transfer_id = id, state = %record.state, "Nothing to resume");
            return Ok(false);
        }
        if self.inner.updater.apply_event(id, TransferEvent::Resume).await?.is_none() {
            return Ok(false);
        }
        info!(transfer_id = id, "Transfer resumed");
        self.inner.try_run(id).await?;
        Ok(true)
    }

    /// Returns `Ok(false)` when the transfer is already terminal or being
    /// canceled.
    pub async fn cancel(&self, id: TransferId) -> Result<bool, TransferError> {
        self.inner.cancel(id).await
    }

    /// Picks up every non-terminal transfer left by a previous process.
    /// Returns the ids found.
    pub async fn recover_pending_on_startup(&self) -> Result<Vec<TransferId>, TransferError> {
        let records = self.inner.updater.load_non_terminal().await?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            ids.push(id);
            let _guard = self.inner.lock(id).await;
            let result = match record.state {
                TransferState::PendingCancel => self.inner.finish_cancel(&record).await,
                TransferState::WaitingForNetwork => self.inner.recover_from_network(id).await,
                TransferState::Waiting => self.inner.try_run(id).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(transfer_id = id, error = %e, "Failed to recover transfer");
            }
        }
        Ok(ids)
    }

    /// Restarts every transfer parked in `WAITING_FOR_NETWORK` whose network
    /// is reachable now.
    pub async fn on_network_recovered(&self, class: NetworkClass) {
        self.inner.on_network_recovered(class).await;
    }

    /// Stops transfers requiring `class`; they resume on their own once the
    /// network returns.
    pub async fn on_network_lost(&self, class: NetworkClass) {
        self.inner.on_network_lost(class).await;
    }

    /// Tracked transfers in `direction`; `ANY` matches both.
    pub async fn transfers_with_direction(&self, direction: TransferDirection) -> Vec<TransferRecord> {
        self.inner.transfers_with_direction(direction).await
    }

    /// Returns how many transfers were paused.
    pub async fn pause_all(&self, direction: TransferDirection) -> usize {
        let mut paused = 0;
        for record in self.inner.transfers_with_direction(direction).await {
            match self.inner.pause(record.id).await {
                Ok(true) => paused += 1,
                Ok(false) => {}
                Err(e) => warn!(transfer_id = record.id, error = %e, "Failed to pause transfer"),
            }
        }
        paused
    }

    /// Returns how many transfers were canceled.
    pub async fn cancel_all(&self, direction: TransferDirection) -> usize {
        let mut canceled = 0;
        for record in self.inner.transfers_with_direction(direction).await {
            match self.inner.cancel(record.id).await {
                Ok(true) => canceled += 1,
                Ok(false) => {}
                Err(e) => warn!(transfer_id = record.id, error = %e, "Failed to cancel transfer"),
            }
        }
        canceled
    }

    /// Cancels a live transfer and removes it, parts included, from the
    /// active set and from storage.
    pub async fn delete_record(&self, id: TransferId) -> Result<(), TransferError> {
        if let Some(record) = self.inner.updater.snapshot(id).await {
            if record.is_part() {
                return Err(TransferError::InvalidRecord(format!(
                    "part {id} cannot be deleted on its own"
                )));
            }
            if !record.is_terminal() {
                self.inner.cancel(id).await?;
            }
        }
        if let Some(handle) = self.inner.executor.handle(id) {
            if self
                .inner
                .executor
                .await_completion(&handle, DELETE_WAIT)
                .await
                .is_none()
            {
                warn!(transfer_id = id, "Task still running, deleting anyway");
            }
        }

        let _guard = self.inner.lock(id).await;
        // The event loop has not settled the cancel yet; do it here so the
        // cleanup still runs.
        if let Some(record) = self.inner.updater.snapshot(id).await {
            if record.state == TransferState::PendingCancel {
                self.inner.finish_cancel(&record).await?;
            }
        }
        self.inner.updater.delete(id).await?;
        self.inner.forget_lock(id);
        info!(transfer_id = id, "Transfer deleted");
        Ok(())
    }

    /// Drops a terminal transfer from the active set. Its row stays in
    /// storage.
    pub async fn acknowledge(&self, id: TransferId) -> Result<bool, TransferError> {
        let _guard = self.inner.lock(id).await;
        let record = self.inner.tracked(id).await?;
        if !record.is_terminal() {
            return Ok(false);
        }
        self.inner.updater.release(id).await;
        self.inner.forget_lock(id);
        debug!(transfer_id = id, state = %record.state, "Transfer acknowledged");
        Ok(true)
    }

    pub async fn observer(&self, id: TransferId) -> Result<TransferObserver, TransferError> {
        TransferObserver::attach(Arc::clone(&self.inner.updater), id).await
    }

    /// Waits up to `timeout` for a terminal state. Timing out does not cancel
    /// the transfer.
    pub async fn await_completion(
        &self,
        id: TransferId,
        timeout: Duration,
    ) -> Result<Option<TransferState>, TransferError> {
        let observer = self.observer(id).await?;
        Ok(observer.wait_for_terminal(timeout).await)
    }

    /// Stops every task without touching persisted state, so the transfers
    /// resume on the next `recover_pending_on_startup`.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down transfer coordinator");
        self.inner.executor.shutdown(timeout).await;
        self.inner.shutdown.cancel();
        let event_loop = lock_mutex(&self.event_loop).take();
        if let Some(task) = event_loop {
            if let Err(e) = task.await {
                warn!(error = %e, "Coordinator event loop ended abnormally");
            }
        }
        self.inner.updater.flush().await;
    }
}

impl Drop for TransferCoordinator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_event_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
    mut network: mpsc::UnboundedReceiver<NetworkChange>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_task_event(event).await;
            }
            Some(change) = network.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                if change.reachable {
                    inner.on_network_recovered(change.class).await;
                } else {
                    inner.on_network_lost(change.class).await;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("Coordinator event loop stopped");
}

impl Inner {
    async fn lock(&self, id: TransferId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(lock_mutex(&self.locks).entry(id).or_default());
        lock.lock_owned().await
    }

    fn forget_lock(&self, id: TransferId) {
        lock_mutex(&self.locks).remove(&id);
    }

    async fn tracked(&self, id: TransferId) -> Result<TransferRecord, TransferError> {
        let record = self
            .updater
            .snapshot(id)
            .await
            .ok_or(TransferError::NotFound(id))?;
        if record.is_part() {
            return Err(TransferError::InvalidRecord(format!(
                "{id} is a part and is controlled through its transfer"
            )));
        }
        Ok(record)
    }

    async fn build_record(&self, request: TransferRequest) -> Result<TransferRecord, TransferError> {
        let network = request.network.unwrap_or(self.default_network);
        let mut record = match request.direction {
            TransferDirection::Upload => {
                let size = tokio::fs::metadata(&request.file)
                    .await
                    .map_err(|e| TransferError::local(&request.file, e))?
                    .len();
                let mut record =
                    TransferRecord::upload(request.bucket, request.key, request.file, size, network);
                record.is_multipart = size > self.executor.options().multipart_threshold;
                record
            }
            TransferDirection::Download => TransferRecord::download(
                request.bucket,
                request.key,
                request.file,
                request.range,
                network,
            ),
            TransferDirection::Any => {
                return Err(TransferError::InvalidRecord(
                    "a transfer must be an upload or a download".into(),
                ));
            }
        };
        record.metadata = request.metadata;
        Ok(record)
    }

    /// Eligibility check. Submits a `WAITING` record that is not running when
    /// its network is reachable, parks it otherwise. Caller holds the lock.
    async fn try_run(&self, id: TransferId) -> Result<(), TransferError> {
        let record = self.tracked(id).await?;
        if record.state != TransferState::Waiting || self.executor.is_running_id(id) {
            return Ok(());
        }

        if !self.monitor.currently_meets(record.network) {
            self.updater
                .apply_event(id, TransferEvent::NetworkUnavailable)
                .await?;
            info!(transfer_id = id, network = %record.network, "Waiting for network");
            return Ok(());
        }

        match self.executor.submit(record) {
            Ok(handle) => {
                debug!(transfer_id = id, generation = handle.generation, "Transfer submitted");
                Ok(())
            }
            Err(TransferError::AlreadyRunning(_)) => Ok(()),
            // The executor stopped taking work; the record is recovered on the next start.
            Err(TransferError::Cancelled) => {
                debug!(transfer_id = id, "Executor is shutting down, not submitting");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `true` while a task for `id` exists or has stopped without its outcome
    /// having been handled yet.
    fn task_owned(&self, id: TransferId, state: TransferState) -> bool {
        self.executor.is_running_id(id)
            || matches!(
                state,
                TransferState::InProgress
                    | TransferState::PendingPause
                    | TransferState::PendingNetworkDisconnect
            )
    }

    async fn pause(&self, id: TransferId) -> Result<bool, TransferError> {
        let _guard = self.lock(id).await;
        let record = self.tracked(id).await?;
        let stopping = matches!(
            record.state,
            TransferState::Paused | TransferState::PendingPause | TransferState::PendingCancel
        );
        if record.is_terminal() || stopping {
            debug!(transfer_id = id, state = %record.state, "Nothing to pause");
            return Ok(false);
        }

        let owned = self.task_owned(id, record.state);
        if self
            .updater
            .apply_event(id, TransferEvent::PauseRequested)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        info!(transfer_id = id, "Pause requested");

        if owned {
            self.executor.cancel_id(id);
        } else {
            self.settle_stop(id).await?;
        }
        Ok(true)
    }

    async fn cancel(&self, id: TransferId) -> Result<bool, TransferError> {
        let _guard = self.lock(id).await;
        let record = self.tracked(id).await?;
        if record.is_terminal() || record.state == TransferState::PendingCancel {
            debug!(transfer_id = id, state = %record.state, "Nothing to cancel");
            return Ok(false);
        }

        let owned = self.task_owned(id, record.state);
        if self
            .updater
            .apply_event(id, TransferEvent::CancelRequested)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        info!(transfer_id = id, "Cancel requested");

        if owned {
            self.executor.cancel_id(id);
        } else {
            self.settle_stop(id).await?;
        }
        Ok(true)
    }

    async fn on_task_event(&self, event: TaskEvent) {
        let id = event.id;
        let _guard = self.lock(id).await;
        if let Some(current) = self.executor.handle(id) {
            if current.generation != event.generation {
                debug!(transfer_id = id, generation = event.generation, "Ignoring stale task event");
                return;
            }
        }
        let Some(record) = self.updater.snapshot(id).await else {
            return;
        };

        let result = match event.outcome {
            TaskOutcome::Completed => self.complete(&record).await,
            _ if record.state.is_pending_stop() => self.settle_stop(id).await,
            TaskOutcome::Failed(error) => self.fail(&record, error).await,
            TaskOutcome::NetworkLost => self.park_for_network(&record).await,
            TaskOutcome::Canceled => self.after_cancel(&record).await,
        };
        if let Err(e) = result {
            warn!(transfer_id = id, error = %e, "Failed to settle transfer");
        }
    }

    /// A task stopped by its token without a pending stop. Either the
    /// coordinator is shutting down, or the network dropped while the task
    /// was queued and came back before the task had exited. In the second
    /// case the record was already moved on and only needs a new task.
    async fn after_cancel(&self, record: &TransferRecord) -> Result<(), TransferError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        match record.state {
            TransferState::Waiting => self.try_run(record.id).await,
            TransferState::WaitingForNetwork => self.recover_from_network(record.id).await,
            _ => Ok(()),
        }
    }

    async fn complete(&self, record: &TransferRecord) -> Result<(), TransferError> {
        match self
            .updater
            .apply_event(record.id, TransferEvent::Complete)
            .await?
        {
            Some(_) => info!(transfer_id = record.id, bytes = record.bytes_total, "Transfer completed"),
            None => debug!(transfer_id = record.id, state = %record.state, "Completion discarded"),
        }
        Ok(())
    }

    async fn fail(&self, record: &TransferRecord, error: TransferError) -> Result<(), TransferError> {
        if !self.updater.fail(record.id, &error).await? {
            return Ok(());
        }
        if record.is_multipart {
            self.abort_session(record).await;
            self.settle_parts(record, TransferState::Failed).await?;
        }
        Ok(())
    }

    async fn park_for_network(&self, record: &TransferRecord) -> Result<(), TransferError> {
        let id = record.id;
        if self
            .updater
            .apply_event(id, TransferEvent::NetworkLost)
            .await?
            .is_none()
        {
            return Ok(());
        }
        self.settle_stop(id).await
    }

    /// Resolves a pending stop once no task is running for `id`.
    async fn settle_stop(&self, id: TransferId) -> Result<(), TransferError> {
        let record = self.tracked(id).await?;
        match record.state {
            TransferState::PendingPause => {
                self.settle_parts(&record, TransferState::Paused).await?;
                self.updater.apply_event(id, TransferEvent::Stopped).await?;
                info!(transfer_id = id, "Transfer paused");
            }
            TransferState::PendingNetworkDisconnect => {
                self.settle_parts(&record, TransferState::WaitingForNetwork).await?;
                self.updater.apply_event(id, TransferEvent::Stopped).await?;
                info!(transfer_id = id, network = %record.network, "Transfer waiting for network");
                // The network may already be back.
                self.recover_from_network(id).await?;
            }
            TransferState::PendingCancel => self.finish_cancel(&record).await?,
            _ => {}
        }
        Ok(())
    }

    /// Runs the cancel cleanup and settles on `CANCELED`. Cleanup failures
    /// are logged and do not hold the transition back.
    async fn finish_cancel(&self, record: &TransferRecord) -> Result<(), TransferError> {
        match record.direction {
            TransferDirection::Upload if record.is_multipart => self.abort_session(record).await,
            TransferDirection::Download => {
                if let Err(e) = tokio::fs::remove_file(&record.file).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            transfer_id = record.id,
                            path = %record.file.display(),
                            error = %e,
                            "Failed to remove partial download"
                        );
                    }
                }
            }
            _ => {}
        }

        // Parts settle first so the parent is the last to turn terminal.
        self.settle_parts(record, TransferState::Canceled).await?;
        self.updater
            .apply_event(record.id, TransferEvent::Stopped)
            .await?;
        info!(transfer_id = record.id, "Transfer canceled");
        Ok(())
    }

    async fn abort_session(&self, record: &TransferRecord) {
        // The record in hand may predate the session id.
        let upload_id = match self.updater.snapshot(record.id).await {
            Some(current) => current.multipart_id,
            None => record.multipart_id.clone(),
        };
        let Some(upload_id) = upload_id else {
            return;
        };
        match self
            .store
            .abort_multipart_upload(&record.target(), &upload_id)
            .await
        {
            Ok(()) => info!(
                transfer_id = record.id,
                upload_id = %upload_id,
                "Aborted multipart upload"
            ),
            Err(e) => warn!(
                transfer_id = record.id,
                upload_id = %upload_id,
                error = %e,
                "Failed to abort multipart upload"
            ),
        }
    }

    async fn settle_parts(
        &self,
        record: &TransferRecord,
        target: TransferState,
    ) -> Result<(), TransferError> {
        if !record.is_multipart {
            return Ok(());
        }
        self.updater.load_parts(record.id).await?;
        self.updater.settle_parts(record.id, target).await
    }

    /// `WAITING_FOR_NETWORK -> WAITING -> submitted` when the network allows.
    async fn recover_from_network(&self, id: TransferId) -> Result<(), TransferError> {
        let record = self.tracked(id).await?;
        if record.state != TransferState::WaitingForNetwork
            || !self.monitor.currently_meets(record.network)
        {
            return Ok(());
        }
        self.updater
            .apply_event(id, TransferEvent::NetworkRecovered)
            .await?;
        self.settle_parts(&record, TransferState::Waiting).await?;
        debug!(transfer_id = id, "Network available again");
        self.try_run(id).await
    }

    async fn on_network_recovered(&self, class: NetworkClass) {
        info!(network = %class, "Network recovered");
        for id in self.updater.transfer_ids().await {
            let _guard = self.lock(id).await;
            if let Err(e) = self.recover_from_network(id).await {
                warn!(transfer_id = id, error = %e, "Failed to resume transfer");
            }
        }
    }

    async fn on_network_lost(&self, class: NetworkClass) {
        info!(network = %class, "Network lost");
        for id in self.updater.transfer_ids().await {
            let _guard = self.lock(id).await;
            let Ok(record) = self.tracked(id).await else {
                continue;
            };
            if record.network != class || self.monitor.currently_meets(record.network) {
                continue;
            }

            let owned = self.task_owned(id, record.state);
            let applied = match self.updater.apply_event(id, TransferEvent::NetworkLost).await {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(transfer_id = id, error = %e, "Failed to record network loss");
                    continue;
                }
            };
            match applied {
                Some(TransferState::PendingNetworkDisconnect) => {
                    self.executor.cancel_id(id);
                }
                Some(_) => {
                    // Submitted but not started yet.
                    if owned {
                        self.executor.cancel_id(id);
                    }
                    info!(transfer_id = id, "Transfer waiting for network");
                }
                None => {}
            }
        }
    }

    async fn transfers_with_direction(&self, direction: TransferDirection) -> Vec<TransferRecord> {
        let mut records = Vec::new();
        for id in self.updater.transfer_ids().await {
            if let Some(record) = self.updater.snapshot(id).await {
                if direction.matches(record.direction) {
                    records.push(record);
                }
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedConnectivity;
    use crate::core::network::Connectivity;
    use crate::db::MemoryRecordStore;
    use crate::store::MemoryStore;

    struct Harness {
        coordinator: TransferCoordinator,
        store: Arc<MemoryStore>,
        dir: tempfile::TempDir,
    }

    async fn harness(connectivity: Connectivity) -> Harness {
        let (source, _controller) = SimulatedConnectivity::new(connectivity);
        let monitor = Arc::new(NetworkMonitor::new(Arc::new(source)));
        let store = Arc::new(MemoryStore::new());
        let updater = Arc::new(StatusUpdater::new(Arc::new(MemoryRecordStore::new()), 2));
        let coordinator = TransferCoordinator::new(
            store.clone(),
            updater,
            monitor,
            ExecutorOptions::default(),
            NetworkClass::Any,
        );
        Harness {
            coordinator,
            store,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    #[tokio::test]
    async fn offline_start_waits_for_network() {
        let h = harness(Connectivity::OFFLINE).await;
        let file = h.dir.path().join("a.bin");
        std::fs::write(&file, b"hello").unwrap();

        let observer = h.coordinator.start_upload("b", "a.bin", &file).await.unwrap();
        assert_eq!(observer.state(), TransferState::WaitingForNetwork);
        assert!(h.store.object(&ObjectTarget::new("b", "a.bin")).is_none());
    }

    #[tokio::test]
    async fn pause_and_cancel_on_parked_transfer_settle_immediately() {
        let h = harness(Connectivity::OFFLINE).await;
        let file = h.dir.path().join("a.bin");
        std::fs::write(&file, b"hello").unwrap();
        let observer = h.coordinator.start_upload("b", "a.bin", &file).await.unwrap();
        let id = observer.id();

        assert!(h.coordinator.pause(id).await.unwrap());
        assert!(!h.coordinator.pause(id).await.unwrap());
        assert_eq!(observer.refresh().await.unwrap().state, TransferState::Paused);

        assert!(h.coordinator.cancel(id).await.unwrap());
        assert!(!h.coordinator.cancel(id).await.unwrap());
        assert!(!h.coordinator.resume(id).await.unwrap());
        assert_eq!(observer.refresh().await.unwrap().state, TransferState::Canceled);
    }

    #[tokio::test]
    async fn upload_completes_and_can_be_acknowledged() {
        let h = harness(Connectivity::unmetered()).await;
        let file = h.dir.path().join("a.bin");
        std::fs::write(&file, vec![7u8; 4096]).unwrap();

        let observer = h.coordinator.start_upload("b", "a.bin", &file).await.unwrap();
        let state = observer.wait_for_terminal(Duration::from_secs(5)).await;
        assert_eq!(state, Some(TransferState::Completed));
        assert_eq!(
            h.store.object(&ObjectTarget::new("b", "a.bin")).unwrap().len(),
            4096
        );

        assert!(h.coordinator.acknowledge(observer.id()).await.unwrap());
        assert!(h.coordinator.transfers_with_direction(TransferDirection::Any).await.is_empty());
        assert_eq!(observer.refresh().await.unwrap().state, TransferState::Completed);
    }

    #[tokio::test]
    async fn rejected_request_fails_with_error() {
        let h = harness(Connectivity::unmetered()).await;
        let file = h.dir.path().join("missing.bin");

        let observer = h.coordinator.start_download("b", "nope", &file).await.unwrap();
        let state = observer.wait_for_terminal(Duration::from_secs(5)).await;
        assert_eq!(state, Some(TransferState::Failed));
        assert!(observer.refresh().await.unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn invalid_key_is_refused_up_front() {
        let h = harness(Connectivity::unmetered()).await;
        let result = h.coordinator.start_download("b", "../etc", h.dir.path().join("x")).await;
        assert!(matches!(result, Err(TransferError::Store(_))));
        assert!(h.coordinator.transfers_with_direction(TransferDirection::Any).await.is_empty());
    }
}
