//! Byte counting between the data stream and the status updater.
//!
//! A [`ProgressSink`] counts bytes as they move and publishes a new value
//! whenever another `interval` bytes have gone by. A [`ProgressReporter`]
//! forwards published values to the [`StatusUpdater`] from its own task, so
//! the data path never waits on persistence.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::models::TransferId;
use crate::core::status::StatusUpdater;
use crate::logging::LogThrottle;

struct SinkInner {
    bytes: AtomicU64,
    total: AtomicU64,
    last_published: AtomicU64,
    interval: u64,
    tx: watch::Sender<u64>,
    parent: Option<ProgressSink>,
}

#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<SinkInner>,
}

impl ProgressSink {
    fn new(initial: u64, total: u64, interval: u64, parent: Option<ProgressSink>) -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(initial);
        let sink = Self {
            inner: Arc::new(SinkInner {
                bytes: AtomicU64::new(initial),
                total: AtomicU64::new(total),
                last_published: AtomicU64::new(initial),
                interval: interval.max(1),
                tx,
                parent,
            }),
        };
        (sink, rx)
    }

    pub fn current(&self) -> u64 {
        self.inner.bytes.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    pub fn set_total(&self, total: u64) {
        self.inner.total.store(total, Ordering::SeqCst);
    }

    pub fn add(&self, n: u64) {
        if n == 0 {
            return;
        }
        let now = self.inner.bytes.fetch_add(n, Ordering::SeqCst) + n;
        let last = self.inner.last_published.load(Ordering::SeqCst);
        if now.saturating_sub(last) >= self.inner.interval
            && self
                .inner
                .last_published
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.inner.tx.send_replace(now);
        }
        if let Some(parent) = &self.inner.parent {
            parent.add(n);
        }
    }

    /// Moves the counter back to `to` before an attempt restarts. The parent
    /// total shrinks accordingly; published values never go back.
    pub fn rewind(&self, to: u64) {
        let previous = self.inner.bytes.swap(to, Ordering::SeqCst);
        self.inner.last_published.store(to, Ordering::SeqCst);
        if let Some(parent) = &self.inner.parent {
            if previous > to {
                parent.subtract(previous - to);
            }
        }
    }

    fn subtract(&self, n: u64) {
        let _ = self
            .inner
            .bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| Some(b.saturating_sub(n)));
        if let Some(parent) = &self.inner.parent {
            parent.subtract(n);
        }
    }

    fn publish_now(&self) {
        let now = self.current();
        self.inner.last_published.store(now, Ordering::SeqCst);
        self.inner.tx.send_replace(now);
    }
}

/// Forwards a sink's published values to the status updater.
pub struct ProgressReporter {
    sink: ProgressSink,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(
        updater: Arc<StatusUpdater>,
        id: TransferId,
        initial: u64,
        total: u64,
        interval: u64,
        parent: Option<&ProgressSink>,
    ) -> Self {
        let (sink, mut rx) = ProgressSink::new(initial, total, interval, parent.cloned());
        let stop = CancellationToken::new();
        let forward_sink = sink.clone();
        let forward_stop = stop.clone();

        let task = tokio::spawn(async move {
            let throttle = LogThrottle::new(Duration::from_secs(2));
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = forward_stop.cancelled() => break,
                }
                let bytes = *rx.borrow_and_update();
                let total = forward_sink.total();
                if let Err(e) = updater.update_progress(id, bytes, total).await {
                    warn!(transfer_id = id, error = %e, "Failed to record progress");
                }
                if let Some(skipped) = throttle.check() {
                    debug!(transfer_id = id, bytes, total, skipped, "Transfer progress");
                }
            }

            // Final value, even if it is below the publish interval.
            let bytes = forward_sink.current();
            if let Err(e) = updater
                .update_progress(id, bytes, forward_sink.total())
                .await
            {
                warn!(transfer_id = id, error = %e, "Failed to record final progress");
            }
        });

        Self { sink, stop, task }
    }

    pub fn sink(&self) -> ProgressSink {
        self.sink.clone()
    }

    /// Publishes the current count and waits until it has been recorded.
    pub async fn finish(self) {
        self.sink.publish_now();
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Progress forwarder stopped abnormally");
        }
    }
}

/// Counts bytes read from the inner stream and fails the read once the
/// transfer is cancelled.
pub struct ProgressReader<R> {
    inner: R,
    sink: ProgressSink,
    token: CancellationToken,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, sink: ProgressSink, token: CancellationToken) -> Self {
        Self { inner, sink, token }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(io::Error::other("transfer cancelled")));
        }

        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.sink.add((buf.filled().len() - before) as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn publishes_every_interval() {
        let (sink, rx) = ProgressSink::new(0, 100, 10, None);
        sink.add(4);
        assert_eq!(*rx.borrow(), 0);
        sink.add(7);
        assert_eq!(*rx.borrow(), 11);
        sink.add(5);
        assert_eq!(*rx.borrow(), 11);
        sink.publish_now();
        assert_eq!(*rx.borrow(), 16);
    }

    #[test]
    fn parent_aggregates_children() {
        let (parent, _parent_rx) = ProgressSink::new(50, 200, 1, None);
        let (first, _) = ProgressSink::new(0, 50, 1, Some(parent.clone()));
        let (second, _) = ProgressSink::new(0, 100, 1, Some(parent.clone()));

        first.add(30);
        second.add(40);
        assert_eq!(parent.current(), 120);

        first.rewind(0);
        assert_eq!(parent.current(), 90);
    }

    #[tokio::test]
    async fn reader_counts_and_stops_on_cancel() {
        let (sink, _rx) = ProgressSink::new(0, 6, 1, None);
        let token = CancellationToken::new();
        let mut reader = ProgressReader::new(&b"abcdef"[..], sink.clone(), token.clone());

        let mut first = [0u8; 4];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(sink.current(), 4);

        token.cancel();
        let mut rest = Vec::new();
        assert!(reader.read_to_end(&mut rest).await.is_err());
    }
}
