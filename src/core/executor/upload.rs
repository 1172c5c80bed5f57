use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::progress::{ProgressReader, ProgressReporter, ProgressSink};
use super::retry::{Interrupt, with_retry};
use super::{TaskContext, begin};
use crate::core::error::{ErrorClass, TransferError};
use crate::core::models::{RecordUpdate, TransferRecord, part_ranges};
use crate::core::state::{TransferEvent, TransferState};
use crate::store::{Body, CompletedPart, PutObjectRequest, StoreError, UploadPartRequest};

/// Opens `record.file` positioned at the record's range, wrapped for
/// progress and cancellation.
async fn open_body(
    ctx: &TaskContext,
    record: &TransferRecord,
    sink: ProgressSink,
) -> Result<(Body, u64), TransferError> {
    let mut file = File::open(&record.file)
        .await
        .map_err(|e| TransferError::local(&record.file, e))?;
    let file_len = file
        .metadata()
        .await
        .map_err(|e| TransferError::local(&record.file, e))?
        .len();

    let end = record.range_end.unwrap_or(file_len);
    if end > file_len || record.range_start > end {
        return Err(TransferError::InvalidRecord(format!(
            "{} is {} bytes, expected at least {}",
            record.file.display(),
            file_len,
            end
        )));
    }
    if record.range_start > 0 {
        file.seek(SeekFrom::Start(record.range_start))
            .await
            .map_err(|e| TransferError::local(&record.file, e))?;
    }

    let length = end - record.range_start;
    let reader = BufReader::with_capacity(ctx.options.chunk_size, file).take(length);
    let body = ProgressReader::new(reader, sink, ctx.token.clone());
    Ok((Box::new(body), length))
}

/// Turns a body read failure caused by cancellation into `Cancelled`.
fn store_error(ctx: &TaskContext, file: &Path, error: StoreError) -> TransferError {
    match error {
        StoreError::Body(_) if ctx.token.is_cancelled() => TransferError::Cancelled,
        StoreError::Body(message) => TransferError::LocalIo {
            path: file.to_path_buf(),
            kind: std::io::ErrorKind::Other,
            raw_os_error: None,
            message,
        },
        other => TransferError::Store(other),
    }
}

pub(super) async fn run_single(ctx: &TaskContext, record: TransferRecord) -> Result<(), TransferError> {
    let reporter = ProgressReporter::spawn(
        ctx.updater.clone(),
        record.id,
        0,
        record.bytes_total,
        ctx.options.progress_interval,
        None,
    );
    let sink = reporter.sink();

    let result = with_retry(ctx, record.id, record.network, Interrupt::OnCancel, || {
        let sink = sink.clone();
        let record = &record;
        async move {
            sink.rewind(0);
            let (body, length) = open_body(ctx, record, sink).await?;
            ctx.store
                .put_object(PutObjectRequest {
                    target: record.target(),
                    body,
                    content_length: length,
                    metadata: record.metadata.clone(),
                })
                .await
                .map_err(|e| store_error(ctx, &record.file, e))
        }
    })
    .await;
    reporter.finish().await;

    let etag = result?;
    ctx.updater
        .update_record(
            record.id,
            RecordUpdate {
                etag: Some(etag),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

/// Supervises a multipart upload: opens the session, creates or reloads the
/// part records, uploads outstanding parts and finalizes.
pub(super) async fn run_multipart(ctx: &TaskContext, record: TransferRecord) -> Result<(), TransferError> {
    begin(ctx, record.id).await?;
    let mut record = record;

    if record.multipart_id.is_none() {
        let target = record.target();
        let upload_id = with_retry(ctx, record.id, record.network, Interrupt::OnCancel, || {
            let target = &target;
            let metadata = &record.metadata;
            async move {
                ctx.store
                    .initiate_multipart_upload(target, metadata)
                    .await
                    .map_err(TransferError::Store)
            }
        })
        .await?;
        info!(upload_id = %upload_id, "Initiated multipart upload");

        record = ctx
            .updater
            .update_record(
                record.id,
                RecordUpdate {
                    multipart_id: Some(upload_id),
                    ..Default::default()
                },
            )
            .await?
            .ok_or(TransferError::Cancelled)?;
    }

    let parts = ensure_parts(ctx, &record).await?;
    // A failed part is terminal; resuming cannot bring it back.
    if let Some(failed) = parts.iter().find(|p| p.state == TransferState::Failed) {
        return Err(TransferError::InvalidRecord(format!(
            "part {} failed: {}",
            failed.part_number,
            failed.last_error.as_deref().unwrap_or("unknown error")
        )));
    }

    let completed_bytes: u64 = parts
        .iter()
        .filter(|p| p.state == TransferState::Completed)
        .map(|p| p.bytes_total)
        .sum();
    let reporter = ProgressReporter::spawn(
        ctx.updater.clone(),
        record.id,
        completed_bytes,
        record.bytes_total,
        ctx.options.progress_interval,
        None,
    );

    let group = ctx.with_token(ctx.token.child_token());
    let mut tasks = JoinSet::new();
    for part in parts.into_iter().filter(|p| p.state != TransferState::Completed) {
        let part_ctx = group.clone();
        let parent_sink = reporter.sink();
        tasks.spawn(async move { upload_part(&part_ctx, part, parent_sink).await });
    }

    let mut first_error: Option<TransferError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|e| {
            Err(TransferError::InvalidRecord(format!("part task ended abnormally: {e}")))
        });
        if let Err(e) = result {
            if first_error.is_none() && e.class() != ErrorClass::Cancelled {
                // One part failing stops its siblings.
                group.token.cancel();
                first_error = Some(e);
            }
        }
    }
    reporter.finish().await;

    if let Some(e) = first_error {
        return Err(e);
    }
    if ctx.token.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    finalize(ctx, &record).await
}

/// Loads the part records of `record` and creates the ones that are missing,
/// which happens when the process stopped halfway through creating them.
///
/// An existing first part fixes the layout, so a changed `part_size` does
/// not reshape an upload that already started.
async fn ensure_parts(
    ctx: &TaskContext,
    record: &TransferRecord,
) -> Result<Vec<TransferRecord>, TransferError> {
    let mut parts = ctx.updater.load_parts(record.id).await?;
    let part_size = parts
        .iter()
        .find(|p| p.part_number == 1)
        .map_or(ctx.options.part_size, |p| p.bytes_total.max(1));

    let ranges = part_ranges(record.bytes_total, part_size);
    let count = ranges.len();
    if parts.len() > count {
        return Err(TransferError::InvalidRecord(format!(
            "{} part records for a {count} part upload",
            parts.len()
        )));
    }

    let mut created = 0;
    for (index, range) in ranges.into_iter().enumerate() {
        let number = index as u32 + 1;
        match parts.iter().find(|p| p.part_number == number) {
            Some(existing)
                if existing.range_start == range.start && existing.range_end == Some(range.end) => {}
            Some(existing) => {
                return Err(TransferError::InvalidRecord(format!(
                    "part {number} covers {}..{}, expected {}..{}",
                    existing.range_start,
                    existing.range_end.unwrap_or(existing.range_start),
                    range.start,
                    range.end
                )));
            }
            None => {
                let part = record.part(number, range, index + 1 == count);
                parts.push(ctx.updater.insert(part).await?);
                created += 1;
            }
        }
    }
    parts.sort_by_key(|p| p.part_number);
    if created > 0 {
        debug!(created, parts = count, "Created part records");
    }
    Ok(parts)
}

async fn upload_part(
    ctx: &TaskContext,
    part: TransferRecord,
    parent: ProgressSink,
) -> Result<(), TransferError> {
    let Some(_permit) = ctx.acquire().await else {
        return Err(TransferError::Cancelled);
    };

    // A part left behind by a pause or a network loss steps back to WAITING first.
    let resume = match part.state {
        TransferState::Paused => Some(TransferEvent::Resume),
        TransferState::WaitingForNetwork => Some(TransferEvent::NetworkRecovered),
        _ => None,
    };
    if let Some(event) = resume {
        ctx.updater.apply_event(part.id, event).await?;
    }
    begin(ctx, part.id).await?;

    let Some(upload_id) = part.multipart_id.clone() else {
        return Err(TransferError::InvalidRecord(format!(
            "part {} has no multipart upload id",
            part.part_number
        )));
    };

    let reporter = ProgressReporter::spawn(
        ctx.updater.clone(),
        part.id,
        0,
        part.bytes_total,
        ctx.options.progress_interval,
        Some(&parent),
    );
    let sink = reporter.sink();

    let result = with_retry(ctx, part.id, part.network, Interrupt::OnCancel, || {
        let sink = sink.clone();
        let part = &part;
        let upload_id = upload_id.clone();
        async move {
            sink.rewind(0);
            let (body, length) = open_body(ctx, part, sink).await?;
            ctx.store
                .upload_part(UploadPartRequest {
                    target: part.target(),
                    upload_id,
                    part_number: part.part_number,
                    body,
                    content_length: length,
                    is_last_part: part.is_last_part,
                })
                .await
                .map_err(|e| store_error(ctx, &part.file, e))
        }
    })
    .await;
    reporter.finish().await;

    match result {
        Ok(etag) => {
            let update = RecordUpdate {
                state: Some(TransferState::Completed),
                etag: Some(etag),
                ..Default::default()
            };
            ctx.updater.update_record(part.id, update).await?;
            debug!(part_number = part.part_number, "Part uploaded");
            Ok(())
        }
        Err(e) if e.class() == ErrorClass::Rejected || e.class() == ErrorClass::LocalResource => {
            if let Err(persist) = ctx.updater.fail(part.id, &e).await {
                warn!(part_number = part.part_number, error = %persist, "Failed to record part failure");
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Completes the multipart upload. Not interruptible: once started, the
/// remote store decides the outcome.
async fn finalize(ctx: &TaskContext, record: &TransferRecord) -> Result<(), TransferError> {
    let Some(upload_id) = record.multipart_id.clone() else {
        return Err(TransferError::InvalidRecord("multipart upload was never initiated".into()));
    };

    let parts = ctx.updater.parts_of(record.id).await;
    let completed = completed_parts(record, &parts)?;

    let target = record.target();
    let etag = with_retry(ctx, record.id, record.network, Interrupt::Never, || {
        let target = &target;
        let upload_id = upload_id.as_str();
        let parts = completed.clone();
        async move {
            ctx.store
                .complete_multipart_upload(target, upload_id, parts, &record.metadata)
                .await
                .map_err(TransferError::Store)
        }
    })
    .await?;

    info!(parts = completed.len(), "Multipart upload finalized");
    ctx.updater
        .update_record(
            record.id,
            RecordUpdate {
                etag: Some(etag),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

/// The part list to finalize with. Every part from 1 to the last must be
/// `COMPLETED` with an ETag, and together they must cover the whole file.
fn completed_parts(
    record: &TransferRecord,
    parts: &[TransferRecord],
) -> Result<Vec<CompletedPart>, TransferError> {
    let mut completed = Vec::with_capacity(parts.len());
    let mut covered = 0u64;
    for (index, part) in parts.iter().enumerate() {
        if part.part_number != index as u32 + 1 {
            return Err(TransferError::InvalidRecord(format!(
                "part {} is missing",
                index + 1
            )));
        }
        match (&part.state, &part.etag) {
            (TransferState::Completed, Some(etag)) => completed.push(CompletedPart {
                part_number: part.part_number,
                etag: etag.clone(),
            }),
            _ => {
                return Err(TransferError::InvalidRecord(format!(
                    "part {} is {} and cannot be finalized",
                    part.part_number, part.state
                )));
            }
        }
        covered += part.bytes_total;
    }

    let ends_with_last = parts.last().is_some_and(|p| p.is_last_part);
    if !ends_with_last || covered != record.bytes_total {
        return Err(TransferError::InvalidRecord(format!(
            "parts cover {covered} of {} bytes",
            record.bytes_total
        )));
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::NetworkClass;

    fn parent() -> TransferRecord {
        let mut record = TransferRecord::upload("b", "k", "/tmp/k", 300, NetworkClass::Any);
        record.id = 7;
        record.is_multipart = true;
        record.multipart_id = Some("upload-1".into());
        record
    }

    fn done(parent: &TransferRecord, number: u32, is_last: bool) -> TransferRecord {
        let start = u64::from(number - 1) * 100;
        let mut part = parent.part(number, start..start + 100, is_last);
        part.state = TransferState::Completed;
        part.etag = Some(format!("etag-{number}"));
        part
    }

    #[test]
    fn every_part_is_listed_in_order() {
        let parent = parent();
        let parts = vec![done(&parent, 1, false), done(&parent, 2, false), done(&parent, 3, true)];

        let completed = completed_parts(&parent, &parts).unwrap();
        let numbers: Vec<u32> = completed.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(completed[2].etag, "etag-3");
    }

    #[test]
    fn missing_trailing_parts_are_refused() {
        let parent = parent();
        let parts = vec![done(&parent, 1, false)];

        let err = completed_parts(&parent, &parts).unwrap_err();
        assert!(err.to_string().contains("cover 100 of 300"), "{err}");
    }

    #[test]
    fn gaps_and_unfinished_parts_are_refused() {
        let parent = parent();
        let gap = vec![done(&parent, 1, false), done(&parent, 3, true)];
        assert!(completed_parts(&parent, &gap).unwrap_err().to_string().contains("part 2 is missing"));

        let mut unfinished = vec![done(&parent, 1, false), done(&parent, 2, false), done(&parent, 3, true)];
        unfinished[1].state = TransferState::Paused;
        assert!(completed_parts(&parent, &unfinished).is_err());
        assert!(completed_parts(&parent, &[]).is_err());
    }
}
