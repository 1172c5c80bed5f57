use std::io::SeekFrom;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use super::TaskContext;
use super::progress::{ProgressReporter, ProgressSink};
use super::retry::{Interrupt, with_retry};
use crate::core::error::TransferError;
use crate::core::models::{RecordUpdate, TransferRecord};
use crate::store::{ByteRange, StoreError};

/// Decides where the download picks up and persists that decision.
///
/// A previous run is resumed only when the partial file is exactly as long as
/// the recorded progress; anything else starts over from byte zero. Runs
/// before the record enters `IN_PROGRESS`, so resetting progress here does not
/// break the monotonic progress of a running transfer.
pub(super) async fn prepare(ctx: &TaskContext, record: &TransferRecord) -> Result<u64, TransferError> {
    let local_len = match fs::metadata(&record.file).await {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(TransferError::local(&record.file, e)),
    };

    let resume_at = match local_len {
        Some(len) if record.bytes_current > 0 && len == record.bytes_current => record.bytes_current,
        _ => 0,
    };

    if resume_at > 0 {
        info!(offset = resume_at, "Resuming partial download");
    } else if record.bytes_current > 0 {
        debug!(
            recorded = record.bytes_current,
            on_disk = local_len.unwrap_or(0),
            "Partial file does not match recorded progress, restarting"
        );
    }

    if resume_at != record.file_offset || resume_at != record.bytes_current {
        ctx.updater
            .update_record(
                record.id,
                RecordUpdate {
                    bytes_current: Some(resume_at),
                    file_offset: Some(resume_at),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(resume_at)
}

pub(super) async fn run(
    ctx: &TaskContext,
    record: TransferRecord,
    resume_at: u64,
) -> Result<(), TransferError> {
    if let Some(parent) = record.file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::local(parent, e))?;
    }

    let reporter = ProgressReporter::spawn(
        ctx.updater.clone(),
        record.id,
        resume_at,
        record.bytes_total,
        ctx.options.progress_interval,
        None,
    );
    let sink = reporter.sink();

    let result = with_retry(ctx, record.id, record.network, Interrupt::OnCancel, || {
        fetch(ctx, &record, sink.clone())
    })
    .await;
    reporter.finish().await;
    result
}

/// One attempt: requests the rest of the range and appends it to the file.
/// Later attempts continue from whatever the previous one wrote.
async fn fetch(ctx: &TaskContext, record: &TransferRecord, sink: ProgressSink) -> Result<(), TransferError> {
    let written = sink.current();
    let total_known = sink.total() > 0;
    if total_known && written >= sink.total() && written > 0 {
        return Ok(());
    }

    let range = if written == 0 && record.range_start == 0 && record.range_end.is_none() {
        None
    } else {
        Some(ByteRange {
            start: record.range_start + written,
            end: record.range_end,
        })
    };
    let output = ctx
        .store
        .get_object(&record.target(), range)
        .await
        .map_err(TransferError::Store)?;

    let expected_total = match record.range_end {
        Some(end) => end.saturating_sub(record.range_start),
        None => output.object_size.saturating_sub(record.range_start),
    };
    if sink.total() != expected_total {
        sink.set_total(expected_total);
        ctx.updater
            .update_progress(record.id, written, expected_total)
            .await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(written == 0)
        .open(&record.file)
        .await
        .map_err(|e| TransferError::local(&record.file, e))?;
    file.seek(SeekFrom::Start(written))
        .await
        .map_err(|e| TransferError::local(&record.file, e))?;

    let mut body = output.body;
    let mut buffer = vec![0u8; ctx.options.chunk_size];
    let mut received = 0u64;
    loop {
        if ctx.token.is_cancelled() {
            file.flush()
                .await
                .map_err(|e| TransferError::local(&record.file, e))?;
            return Err(TransferError::Cancelled);
        }

        let n = body
            .read(&mut buffer)
            .await
            .map_err(|e| TransferError::Store(StoreError::Connection(e.to_string())))?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])
            .await
            .map_err(|e| TransferError::local(&record.file, e))?;
        received += n as u64;
        sink.add(n as u64);
    }

    file.flush()
        .await
        .map_err(|e| TransferError::local(&record.file, e))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::local(&record.file, e))?;

    if received < output.content_length {
        return Err(TransferError::Store(StoreError::Connection(format!(
            "response ended after {} of {} bytes",
            received, output.content_length
        ))));
    }
    Ok(())
}
