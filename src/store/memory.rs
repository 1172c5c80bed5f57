//! In-memory remote store with fault injection.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use uuid::Uuid;

use super::{
    Body, ByteRange, CompletedPart, GetObjectOutput, ObjectTarget, PutObjectRequest, RemoteStore,
    StoreError, UploadPartRequest, validate_target,
};
use crate::core::models::ObjectMetadata;
use crate::utils::lock_mutex;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    PutObject,
    GetObject,
    InitiateMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
}

struct PendingUpload {
    target: ObjectTarget,
    parts: BTreeMap<u32, Vec<u8>>,
}

pub struct MemoryStore {
    objects: Mutex<HashMap<ObjectTarget, Vec<u8>>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    faults: Mutex<HashMap<StoreOperation, VecDeque<StoreError>>>,
    reachable: AtomicBool,
    chunk_delay_ms: AtomicU64,
    stalls: watch::Sender<HashSet<u32>>,
    completion_hold: watch::Sender<bool>,
    held_completions: AtomicUsize,
    requested_ranges: Mutex<Vec<(ObjectTarget, Option<ByteRange>)>>,
    aborted: Mutex<Vec<String>>,
    parts_uploaded: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (stalls, _) = watch::channel(HashSet::new());
        let (completion_hold, _) = watch::channel(false);
        Self {
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            chunk_delay_ms: AtomicU64::new(0),
            stalls,
            completion_hold,
            held_completions: AtomicUsize::new(0),
            requested_ranges: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            parts_uploaded: AtomicUsize::new(0),
        }
    }

    pub fn insert_object(&self, target: ObjectTarget, data: Vec<u8>) {
        lock_mutex(&self.objects).insert(target, data);
    }

    pub fn object(&self, target: &ObjectTarget) -> Option<Vec<u8>> {
        lock_mutex(&self.objects).get(target).cloned()
    }

    /// Queue an error returned by the next call of `operation`.
    pub fn inject_fault(&self, operation: StoreOperation, error: StoreError) {
        lock_mutex(&self.faults)
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// While unreachable every call (and every in-flight body read) fails with
    /// a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Sleep between body chunks, to keep transfers in flight during tests.
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.chunk_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold uploads of `part_number` until [`MemoryStore::release_stalls`].
    pub fn stall_part(&self, part_number: u32) {
        self.stalls.send_modify(|stalled| {
            stalled.insert(part_number);
        });
    }

    pub fn release_stalls(&self) {
        self.stalls.send_modify(|stalled| stalled.clear());
    }

    /// While held, `complete_multipart_upload` waits before doing anything.
    pub fn hold_completions(&self, held: bool) {
        self.completion_hold.send_replace(held);
    }

    /// Completion calls currently waiting on [`MemoryStore::hold_completions`].
    pub fn held_completions(&self) -> usize {
        self.held_completions.load(Ordering::SeqCst)
    }

    pub fn requested_ranges(&self) -> Vec<(ObjectTarget, Option<ByteRange>)> {
        lock_mutex(&self.requested_ranges).clone()
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        lock_mutex(&self.aborted).clone()
    }

    pub fn parts_uploaded(&self) -> usize {
        self.parts_uploaded.load(Ordering::SeqCst)
    }

    pub fn open_uploads(&self) -> usize {
        lock_mutex(&self.uploads).len()
    }

    fn precheck(&self, operation: StoreOperation) -> Result<(), StoreError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("network unreachable".into()));
        }
        if let Some(error) = lock_mutex(&self.faults)
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(())
    }

    async fn read_body(&self, mut body: Body, expected: u64) -> Result<Vec<u8>, StoreError> {
        let mut data = Vec::with_capacity(expected as usize);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = body
                .read(&mut chunk)
                .await
                .map_err(|e| StoreError::Body(e.to_string()))?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);

            let delay = self.chunk_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(StoreError::Connection("connection reset".into()));
            }
        }

        if data.len() as u64 != expected {
            return Err(StoreError::InvalidRequest(format!(
                "content length {} does not match body length {}",
                expected,
                data.len()
            )));
        }
        Ok(data)
    }
}

fn verify_checksum(data: &[u8], metadata: &ObjectMetadata) -> Result<String, StoreError> {
    let etag = blake3::hash(data).to_hex().to_string();
    match &metadata.checksum {
        Some(expected) if !expected.eq_ignore_ascii_case(&etag) => {
            Err(StoreError::ChecksumMismatch {
                expected: expected.clone(),
                actual: etag,
            })
        }
        _ => Ok(etag),
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn put_object(&self, request: PutObjectRequest) -> Result<String, StoreError> {
        validate_target(&request.target)?;
        self.precheck(StoreOperation::PutObject)?;

        let data = self.read_body(request.body, request.content_length).await?;
        let etag = verify_checksum(&data, &request.metadata)?;
        self.insert_object(request.target, data);
        Ok(etag)
    }

    async fn get_object(
        &self,
        target: &ObjectTarget,
        range: Option<ByteRange>,
    ) -> Result<GetObjectOutput, StoreError> {
        validate_target(target)?;
        lock_mutex(&self.requested_ranges).push((target.clone(), range));
        self.precheck(StoreOperation::GetObject)?;

        let data = self
            .object(target)
            .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
        let size = data.len() as u64;
        let (start, end) = match range {
            Some(range) => (range.start, range.end.unwrap_or(size).min(size)),
            None => (0, size),
        };
        if start > end {
            return Err(StoreError::InvalidRequest(format!(
                "range {start}..{end} not satisfiable for {size} byte object"
            )));
        }

        let slice = data[start as usize..end as usize].to_vec();
        Ok(GetObjectOutput {
            content_length: slice.len() as u64,
            object_size: size,
            body: Box::new(std::io::Cursor::new(slice)),
        })
    }

    async fn initiate_multipart_upload(
        &self,
        target: &ObjectTarget,
        _metadata: &ObjectMetadata,
    ) -> Result<String, StoreError> {
        validate_target(target)?;
        self.precheck(StoreOperation::InitiateMultipart)?;

        let upload_id = Uuid::now_v7().to_string();
        lock_mutex(&self.uploads).insert(
            upload_id.clone(),
            PendingUpload {
                target: target.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> Result<String, StoreError> {
        let mut stalls = self.stalls.subscribe();
        let part_number = request.part_number;
        let _ = stalls
            .wait_for(|stalled| !stalled.contains(&part_number))
            .await;

        self.precheck(StoreOperation::UploadPart)?;
        if !lock_mutex(&self.uploads).contains_key(&request.upload_id) {
            return Err(StoreError::NoSuchUpload(request.upload_id));
        }

        let data = self.read_body(request.body, request.content_length).await?;
        let etag = blake3::hash(&data).to_hex().to_string();

        let mut uploads = lock_mutex(&self.uploads);
        let upload = uploads
            .get_mut(&request.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(request.upload_id.clone()))?;
        upload.parts.insert(part_number, data);
        self.parts_uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        metadata: &ObjectMetadata,
    ) -> Result<String, StoreError> {
        let mut hold = self.completion_hold.subscribe();
        if *hold.borrow_and_update() {
            self.held_completions.fetch_add(1, Ordering::SeqCst);
            let _ = hold.wait_for(|held| !*held).await;
            self.held_completions.fetch_sub(1, Ordering::SeqCst);
        }
        self.precheck(StoreOperation::CompleteMultipart)?;

        let mut uploads = lock_mutex(&self.uploads);
        let upload = uploads
            .get(upload_id)
            .filter(|upload| upload.target == *target)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        let mut data = Vec::new();
        for part in &parts {
            let bytes = upload.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::InvalidRequest(format!("part {} was never uploaded", part.part_number))
            })?;
            if blake3::hash(bytes).to_hex().as_str() != part.etag {
                return Err(StoreError::InvalidRequest(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            data.extend_from_slice(bytes);
        }

        let etag = verify_checksum(&data, metadata)?;
        uploads.remove(upload_id);
        drop(uploads);
        self.insert_object(target.clone(), data);
        Ok(etag)
    }

    async fn abort_multipart_upload(
        &self,
        _target: &ObjectTarget,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.precheck(StoreOperation::AbortMultipart)?;
        lock_mutex(&self.aborted).push(upload_id.to_string());
        if lock_mutex(&self.uploads).remove(upload_id).is_none() {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(data: &[u8]) -> Body {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    fn target() -> ObjectTarget {
        ObjectTarget::new("bucket", "dir/object.bin")
    }

    #[tokio::test]
    async fn put_then_ranged_get() {
        let store = MemoryStore::new();
        store
            .put_object(PutObjectRequest {
                target: target(),
                body: body(b"hello world"),
                content_length: 11,
                metadata: ObjectMetadata::default(),
            })
            .await
            .unwrap();

        let mut out = store
            .get_object(&target(), Some(ByteRange::from(6)))
            .await
            .unwrap();
        let mut text = String::new();
        out.body.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "world");
        assert_eq!(out.object_size, 11);
        assert_eq!(store.requested_ranges()[0].1, Some(ByteRange::from(6)));
    }

    #[tokio::test]
    async fn injected_fault_is_returned_once() {
        let store = MemoryStore::new();
        store.inject_fault(StoreOperation::GetObject, StoreError::Timeout("slow".into()));
        store.insert_object(target(), vec![1, 2, 3]);

        let first = store.get_object(&target(), None).await;
        assert!(matches!(first, Err(StoreError::Timeout(_))));
        assert!(store.get_object(&target(), None).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_store_refuses_calls() {
        let store = MemoryStore::new();
        store.insert_object(target(), vec![1]);
        store.set_reachable(false);
        let result = store.get_object(&target(), None).await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn multipart_lifecycle() {
        let store = MemoryStore::new();
        let meta = ObjectMetadata::default();
        let id = store.initiate_multipart_upload(&target(), &meta).await.unwrap();

        let mut parts = Vec::new();
        for (n, chunk) in [&b"abc"[..], &b"def"[..]].into_iter().enumerate() {
            let part_number = n as u32 + 1;
            let etag = store
                .upload_part(UploadPartRequest {
                    target: target(),
                    upload_id: id.clone(),
                    part_number,
                    body: body(chunk),
                    content_length: 3,
                    is_last_part: part_number == 2,
                })
                .await
                .unwrap();
            parts.push(CompletedPart { part_number, etag });
        }

        store
            .complete_multipart_upload(&target(), &id, parts, &meta)
            .await
            .unwrap();
        assert_eq!(store.object(&target()).unwrap(), b"abcdef");
        assert_eq!(store.parts_uploaded(), 2);
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_rejected() {
        let store = MemoryStore::new();
        let metadata = ObjectMetadata {
            checksum: Some("00".repeat(32)),
            ..Default::default()
        };
        let result = store
            .put_object(PutObjectRequest {
                target: target(),
                body: body(b"data"),
                content_length: 4,
                metadata,
            })
            .await;
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
        assert!(store.object(&target()).is_none());
    }
}
