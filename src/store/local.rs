//! Filesystem-backed object store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<bucket>/<key>                      finished objects
//! <root>/.multipart/<upload-id>/target.json  session target
//! <root>/.multipart/<upload-id>/<n>.part     uploaded parts
//! <root>/.tmp/<uuid>                         writes in flight
//! ```
//!
//! Every write lands in `.tmp` first and is renamed into place once the body
//! has been fully read and verified.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Body, ByteRange, CompletedPart, GetObjectOutput, ObjectTarget, PutObjectRequest, RemoteStore,
    StoreError, UploadPartRequest, validate_target,
};
use crate::core::models::ObjectMetadata;

const BUFFER_SIZE: usize = 128 * 1024;
const MULTIPART_DIR: &str = ".multipart";
const TMP_DIR: &str = ".tmp";

#[derive(Serialize, Deserialize)]
struct SessionTarget {
    bucket: String,
    key: String,
}

pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, target: &ObjectTarget) -> PathBuf {
        self.root.join(&target.bucket).join(&target.key)
    }

    fn session_dir(&self, upload_id: &str) -> Result<PathBuf, StoreError> {
        if upload_id.is_empty() || upload_id.contains(['/', '\\', '.']) {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(self.root.join(MULTIPART_DIR).join(upload_id))
    }

    fn part_path(session: &Path, part_number: u32) -> PathBuf {
        session.join(format!("{part_number:05}.part"))
    }

    async fn session_target(&self, upload_id: &str) -> Result<(PathBuf, ObjectTarget), StoreError> {
        let session = self.session_dir(upload_id)?;
        let raw = match fs::read(session.join("target.json")).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchUpload(upload_id.to_string()));
            }
            Err(e) => return Err(io_error(e)),
        };
        let target: SessionTarget = serde_json::from_slice(&raw).map_err(|e| StoreError::Server {
            status: 500,
            message: format!("corrupt multipart session {upload_id}: {e}"),
        })?;
        Ok((session, ObjectTarget::new(target.bucket, target.key)))
    }

    /// Streams `body` into a fresh temp file, returning its path, length and
    /// BLAKE3 digest.
    async fn stage(&self, mut body: Body) -> Result<(PathBuf, u64, String), StoreError> {
        let tmp_dir = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir).await.map_err(io_error)?;
        let tmp_path = tmp_dir.join(Uuid::now_v7().to_string());

        let result = async {
            let file = File::create(&tmp_path).await.map_err(io_error)?;
            let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
            let mut hasher = blake3::Hasher::new();
            let mut buffer = vec![0u8; BUFFER_SIZE];
            let mut written = 0u64;

            loop {
                let n = body
                    .read(&mut buffer)
                    .await
                    .map_err(|e| StoreError::Body(e.to_string()))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                writer.write_all(&buffer[..n]).await.map_err(io_error)?;
                written += n as u64;
            }

            writer.flush().await.map_err(io_error)?;
            writer.get_ref().sync_all().await.map_err(io_error)?;
            Ok::<_, StoreError>((written, hasher.finalize().to_hex().to_string()))
        }
        .await;

        match result {
            Ok((written, digest)) => Ok((tmp_path, written, digest)),
            Err(e) => {
                discard(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn publish(&self, tmp_path: &Path, target: &ObjectTarget) -> Result<(), StoreError> {
        let destination = self.object_path(target);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        fs::rename(tmp_path, &destination).await.map_err(io_error)
    }
}

fn io_error(e: io::Error) -> StoreError {
    StoreError::Server {
        status: 500,
        message: e.to_string(),
    }
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staged file");
        }
    }
}

fn check_length(expected: u64, actual: u64) -> Result<(), StoreError> {
    if expected != actual {
        return Err(StoreError::InvalidRequest(format!(
            "content length {expected} does not match body length {actual}"
        )));
    }
    Ok(())
}

fn check_checksum(metadata: &ObjectMetadata, actual: &str) -> Result<(), StoreError> {
    match &metadata.checksum {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => {
            Err(StoreError::ChecksumMismatch {
                expected: expected.clone(),
                actual: actual.to_string(),
            })
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl RemoteStore for LocalDirStore {
    async fn put_object(&self, request: PutObjectRequest) -> Result<String, StoreError> {
        validate_target(&request.target)?;

        let (tmp_path, written, digest) = self.stage(request.body).await?;
        let verified = check_length(request.content_length, written)
            .and_then(|_| check_checksum(&request.metadata, &digest));
        if let Err(e) = verified {
            discard(&tmp_path).await;
            return Err(e);
        }

        self.publish(&tmp_path, &request.target).await?;
        debug!(target = %request.target, bytes = written, "Stored object");
        Ok(digest)
    }

    async fn get_object(
        &self,
        target: &ObjectTarget,
        range: Option<ByteRange>,
    ) -> Result<GetObjectOutput, StoreError> {
        validate_target(target)?;

        let mut file = match File::open(self.object_path(target)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(target.to_string()));
            }
            Err(e) => return Err(io_error(e)),
        };
        let size = file.metadata().await.map_err(io_error)?.len();

        let (start, end) = match range {
            Some(range) => (range.start, range.end.unwrap_or(size).min(size)),
            None => (0, size),
        };
        if start > end {
            return Err(StoreError::InvalidRequest(format!(
                "range {start}..{end} not satisfiable for {size} byte object"
            )));
        }

        file.seek(io::SeekFrom::Start(start))
            .await
            .map_err(io_error)?;
        let length = end - start;
        Ok(GetObjectOutput {
            body: Box::new(file.take(length)),
            content_length: length,
            object_size: size,
        })
    }

    async fn initiate_multipart_upload(
        &self,
        target: &ObjectTarget,
        _metadata: &ObjectMetadata,
    ) -> Result<String, StoreError> {
        validate_target(target)?;

        let upload_id = Uuid::now_v7().simple().to_string();
        let session = self.session_dir(&upload_id)?;
        fs::create_dir_all(&session).await.map_err(io_error)?;

        let descriptor = serde_json::to_vec(&SessionTarget {
            bucket: target.bucket.clone(),
            key: target.key.clone(),
        })
        .map_err(|e| StoreError::Server {
            status: 500,
            message: e.to_string(),
        })?;
        fs::write(session.join("target.json"), descriptor)
            .await
            .map_err(io_error)?;

        debug!(target = %target, upload_id = %upload_id, "Initiated multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> Result<String, StoreError> {
        let (session, session_target) = self.session_target(&request.upload_id).await?;
        if session_target != request.target {
            return Err(StoreError::NoSuchUpload(request.upload_id));
        }
        if request.part_number == 0 {
            return Err(StoreError::InvalidRequest("part numbers start at 1".into()));
        }

        let (tmp_path, written, digest) = self.stage(request.body).await?;
        if let Err(e) = check_length(request.content_length, written) {
            discard(&tmp_path).await;
            return Err(e);
        }

        fs::rename(&tmp_path, Self::part_path(&session, request.part_number))
            .await
            .map_err(io_error)?;
        Ok(digest)
    }

    async fn complete_multipart_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        metadata: &ObjectMetadata,
    ) -> Result<String, StoreError> {
        let (session, session_target) = self.session_target(upload_id).await?;
        if session_target != *target {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }

        let tmp_dir = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir).await.map_err(io_error)?;
        let tmp_path = tmp_dir.join(Uuid::now_v7().to_string());

        let assembled = async {
            let file = File::create(&tmp_path).await.map_err(io_error)?;
            let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
            let mut hasher = blake3::Hasher::new();

            for part in &parts {
                let data = match fs::read(Self::part_path(&session, part.part_number)).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(StoreError::InvalidRequest(format!(
                            "part {} was never uploaded",
                            part.part_number
                        )));
                    }
                    Err(e) => return Err(io_error(e)),
                };
                if blake3::hash(&data).to_hex().as_str() != part.etag {
                    return Err(StoreError::InvalidRequest(format!(
                        "etag mismatch for part {}",
                        part.part_number
                    )));
                }
                hasher.update(&data);
                writer.write_all(&data).await.map_err(io_error)?;
            }

            writer.flush().await.map_err(io_error)?;
            writer.get_ref().sync_all().await.map_err(io_error)?;
            let digest = hasher.finalize().to_hex().to_string();
            check_checksum(metadata, &digest)?;
            Ok::<_, StoreError>(digest)
        }
        .await;

        let digest = match assembled {
            Ok(digest) => digest,
            Err(e) => {
                discard(&tmp_path).await;
                return Err(e);
            }
        };

        self.publish(&tmp_path, target).await?;
        if let Err(e) = fs::remove_dir_all(&session).await {
            warn!(upload_id = %upload_id, error = %e, "Failed to remove multipart session");
        }
        debug!(target = %target, upload_id = %upload_id, parts = parts.len(), "Completed multipart upload");
        Ok(digest)
    }

    async fn abort_multipart_upload(
        &self,
        _target: &ObjectTarget,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let session = self.session_dir(upload_id)?;
        match fs::remove_dir_all(&session).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchUpload(upload_id.to_string()))
            }
            Err(e) => Err(io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn body(data: &[u8]) -> Body {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    async fn read_all(out: GetObjectOutput) -> Vec<u8> {
        let mut body = out.body;
        let mut data = Vec::new();
        body.read_to_end(&mut data).await.unwrap();
        data
    }

    #[tokio::test]
    async fn put_and_get_object() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(dir.path());
        let target = ObjectTarget::new("bucket", "nested/file.txt");

        let etag = store
            .put_object(PutObjectRequest {
                target: target.clone(),
                body: body(b"0123456789"),
                content_length: 10,
                metadata: ObjectMetadata::default(),
            })
            .await
            .unwrap();
        assert_eq!(etag, blake3::hash(b"0123456789").to_hex().to_string());
        assert!(dir.path().join("bucket/nested/file.txt").exists());

        let full = store.get_object(&target, None).await.unwrap();
        assert_eq!(read_all(full).await, b"0123456789");

        let ranged = store
            .get_object(&target, Some(ByteRange::bounded(2, 5)))
            .await
            .unwrap();
        assert_eq!(ranged.content_length, 3);
        assert_eq!(read_all(ranged).await, b"234");
    }

    #[tokio::test]
    async fn failed_checksum_leaves_no_object() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(dir.path());
        let target = ObjectTarget::new("bucket", "file.txt");

        let result = store
            .put_object(PutObjectRequest {
                target: target.clone(),
                body: body(b"abc"),
                content_length: 3,
                metadata: ObjectMetadata {
                    checksum: Some("not-the-digest".into()),
                    ..Default::default()
                },
            })
            .await;

        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
        assert!(!dir.path().join("bucket/file.txt").exists());
        let mut leftovers = fs::read_dir(dir.path().join(TMP_DIR)).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multipart_round_trip_and_abort() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(dir.path());
        let target = ObjectTarget::new("bucket", "big.bin");
        let meta = ObjectMetadata::default();

        let upload_id = store.initiate_multipart_upload(&target, &meta).await.unwrap();
        let mut parts = Vec::new();
        for (i, chunk) in [&b"first-"[..], &b"second"[..]].into_iter().enumerate() {
            let part_number = i as u32 + 1;
            let etag = store
                .upload_part(UploadPartRequest {
                    target: target.clone(),
                    upload_id: upload_id.clone(),
                    part_number,
                    body: body(chunk),
                    content_length: chunk.len() as u64,
                    is_last_part: part_number == 2,
                })
                .await
                .unwrap();
            parts.push(CompletedPart { part_number, etag });
        }
        store
            .complete_multipart_upload(&target, &upload_id, parts, &meta)
            .await
            .unwrap();

        let out = store.get_object(&target, None).await.unwrap();
        assert_eq!(read_all(out).await, b"first-second");
        assert!(!dir.path().join(MULTIPART_DIR).join(&upload_id).exists());

        let other = store.initiate_multipart_upload(&target, &meta).await.unwrap();
        store.abort_multipart_upload(&target, &other).await.unwrap();
        assert!(matches!(
            store.abort_multipart_upload(&target, &other).await,
            Err(StoreError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn escaping_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(dir.path());
        let result = store
            .get_object(&ObjectTarget::new("bucket", "../outside"), None)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidRequest(_))));
    }
}
