//! Bounded worker pool moving bytes between local files and the remote store.
//!
//! Every submitted record runs as one Tokio task. Tasks that move data hold a
//! permit of a shared semaphore while they run, which bounds the pool. A
//! multipart upload runs as a supervisor task without a permit that fans out
//! one task per part; the parts take permits like any other transfer, so a
//! large multipart job queues behind other work instead of starving it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use super::error::{ErrorClass, TransferError};
use super::models::{TransferDirection, TransferId, TransferRecord};
use super::network::NetworkMonitor;
use super::state::TransferEvent;
use super::status::StatusUpdater;
use crate::config::TransferConfig;
use crate::store::RemoteStore;
use crate::utils::lock_mutex;

mod download;
pub mod progress;
pub mod retry;
mod upload;

pub use retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub worker_threads: usize,
    /// Buffer size for reads and writes.
    pub chunk_size: usize,
    /// Bytes between two progress notifications.
    pub progress_interval: u64,
    /// Uploads above this size go multipart.
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for ExecutorOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            worker_threads: config.worker_threads.max(1),
            chunk_size: config.chunk_size.max(1),
            progress_interval: config.progress_interval.max(1),
            multipart_threshold: config.multipart_threshold,
            part_size: config.part_size.max(1),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.base_delay_ms),
                max_delay: Duration::from_millis(config.max_backoff_ms),
            },
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Every byte moved and, for multipart uploads, the upload was finalized.
    Completed,
    Failed(TransferError),
    /// Stopped by a cancellation request.
    Canceled,
    /// Stopped because the required network went away.
    NetworkLost,
}

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub id: TransferId,
    pub generation: u64,
    pub outcome: TaskOutcome,
}

/// Handle to one submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    pub id: TransferId,
    pub generation: u64,
    token: CancellationToken,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

/// Everything a running task needs.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub store: Arc<dyn RemoteStore>,
    pub updater: Arc<StatusUpdater>,
    pub monitor: Arc<NetworkMonitor>,
    pub options: Arc<ExecutorOptions>,
    pub permits: Arc<Semaphore>,
    pub token: CancellationToken,
}

impl TaskContext {
    /// Waits for a worker slot. `None` when cancelled first.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        }
    }

    pub fn with_token(&self, token: CancellationToken) -> Self {
        Self {
            token,
            ..self.clone()
        }
    }
}

struct Shared {
    store: Arc<dyn RemoteStore>,
    updater: Arc<StatusUpdater>,
    monitor: Arc<NetworkMonitor>,
    options: Arc<ExecutorOptions>,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<TransferId, TaskHandle>>,
    generation: AtomicU64,
    events: mpsc::UnboundedSender<TaskEvent>,
    shutdown: CancellationToken,
}

pub struct TransferExecutor {
    shared: Arc<Shared>,
}

impl TransferExecutor {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        updater: Arc<StatusUpdater>,
        monitor: Arc<NetworkMonitor>,
        options: ExecutorOptions,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            store,
            updater,
            monitor,
            permits: Arc::new(Semaphore::new(options.worker_threads.max(1))),
            options: Arc::new(options),
            running: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            events,
            shutdown: CancellationToken::new(),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.shared.options
    }

    /// Starts a task for `record`. The record must be `WAITING`; the task
    /// moves it to `IN_PROGRESS` once it holds a worker slot.
    pub fn submit(&self, record: TransferRecord) -> Result<TaskHandle, TransferError> {
        if record.is_part() {
            return Err(TransferError::InvalidRecord(format!(
                "part {} cannot be submitted on its own",
                record.id
            )));
        }

        let mut running = lock_mutex(&self.shared.running);
        if running.contains_key(&record.id) {
            return Err(TransferError::AlreadyRunning(record.id));
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.shared.shutdown.child_token();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = TaskHandle {
            id: record.id,
            generation,
            token: token.clone(),
            outcome: outcome_rx,
        };
        running.insert(record.id, handle.clone());
        drop(running);

        let ctx = TaskContext {
            store: Arc::clone(&self.shared.store),
            updater: Arc::clone(&self.shared.updater),
            monitor: Arc::clone(&self.shared.monitor),
            options: Arc::clone(&self.shared.options),
            permits: Arc::clone(&self.shared.permits),
            token,
        };
        let shared = Arc::clone(&self.shared);
        let id = record.id;
        let span = info_span!("transfer", transfer_id = id, direction = %record.direction);

        tokio::spawn(
            async move {
                let outcome = run(&ctx, record).await;
                match &outcome {
                    TaskOutcome::Completed => info!("Transfer task completed"),
                    TaskOutcome::Failed(e) => info!(error = %e, "Transfer task failed"),
                    TaskOutcome::Canceled => debug!("Transfer task canceled"),
                    TaskOutcome::NetworkLost => info!("Transfer task stopped, network lost"),
                }

                {
                    let mut running = lock_mutex(&shared.running);
                    if running.get(&id).is_some_and(|h| h.generation == generation) {
                        running.remove(&id);
                    }
                }
                outcome_tx.send_replace(Some(outcome.clone()));
                let _ = shared.events.send(TaskEvent {
                    id,
                    generation,
                    outcome,
                });
            }
            .instrument(span),
        );

        Ok(handle)
    }

    /// Requests cooperative cancellation of the task.
    pub fn cancel(&self, handle: &TaskHandle) {
        handle.token.cancel();
    }

    pub fn cancel_id(&self, id: TransferId) -> bool {
        match lock_mutex(&self.shared.running).get(&id) {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, handle: &TaskHandle) -> bool {
        lock_mutex(&self.shared.running)
            .get(&handle.id)
            .is_some_and(|h| h.generation == handle.generation)
    }

    pub fn is_running_id(&self, id: TransferId) -> bool {
        lock_mutex(&self.shared.running).contains_key(&id)
    }

    pub fn handle(&self, id: TransferId) -> Option<TaskHandle> {
        lock_mutex(&self.shared.running).get(&id).cloned()
    }

    /// Waits up to `timeout` for the task to end. Timing out leaves the task
    /// running.
    pub async fn await_completion(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> Option<TaskOutcome> {
        let mut rx = handle.outcome.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(outcome)) => outcome.clone(),
            _ => None,
        }
    }

    /// Cancels every task and refuses new submissions. Persisted state is
    /// left alone so the transfers resume on the next start.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shared.shutdown.cancel();
        let handles: Vec<TaskHandle> = lock_mutex(&self.shared.running).values().cloned().collect();
        for handle in handles {
            if self.await_completion(&handle, timeout).await.is_none() {
                debug!(transfer_id = handle.id, "Task did not stop before shutdown timeout");
            }
        }
    }
}

async fn run(ctx: &TaskContext, record: TransferRecord) -> TaskOutcome {
    let result = match (record.direction, record.is_multipart) {
        (TransferDirection::Upload, true) => upload::run_multipart(ctx, record).await,
        (TransferDirection::Upload, false) => run_with_permit(ctx, record).await,
        (TransferDirection::Download, _) => run_with_permit(ctx, record).await,
        (TransferDirection::Any, _) => Err(TransferError::InvalidRecord(
            "a transfer must be an upload or a download".into(),
        )),
    };

    match result {
        Ok(()) => TaskOutcome::Completed,
        Err(e) => match e.class() {
            ErrorClass::Cancelled => TaskOutcome::Canceled,
            _ if ctx.token.is_cancelled() => TaskOutcome::Canceled,
            ErrorClass::NetworkUnavailable => TaskOutcome::NetworkLost,
            _ => TaskOutcome::Failed(e),
        },
    }
}

async fn run_with_permit(ctx: &TaskContext, record: TransferRecord) -> Result<(), TransferError> {
    let Some(_permit) = ctx.acquire().await else {
        return Err(TransferError::Cancelled);
    };

    match record.direction {
        TransferDirection::Download => {
            let resume_at = download::prepare(ctx, &record).await?;
            begin(ctx, record.id).await?;
            download::run(ctx, record, resume_at).await
        }
        _ => {
            begin(ctx, record.id).await?;
            upload::run_single(ctx, record).await
        }
    }
}

/// `WAITING -> IN_PROGRESS`. Anything else means a stop request got there
/// first.
pub(super) async fn begin(ctx: &TaskContext, id: TransferId) -> Result<(), TransferError> {
    match ctx.updater.apply_event(id, TransferEvent::Start).await? {
        Some(_) => Ok(()),
        None => Err(TransferError::Cancelled),
    }
}
