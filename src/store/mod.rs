//! Remote object store seam.
//!
//! The core only depends on [`RemoteStore`]; the wire protocol lives behind it.
//! Two implementations ship with the crate: [`LocalDirStore`] keeps objects in
//! a directory tree and [`MemoryStore`] keeps them in memory with fault
//! injection for tests and simulation.

use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::core::models::ObjectMetadata;

pub mod local;
pub mod memory;

pub use local::LocalDirStore;
pub use memory::{MemoryStore, StoreOperation};

/// Streaming request/response body.
pub type Body = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectTarget {
    pub bucket: String,
    pub key: String,
}

impl ObjectTarget {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Byte range of an object. `end` is exclusive, `None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("no such multipart upload: {0}")]
    NoSuchUpload(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("failed to read request body: {0}")]
    Body(String),
}

impl StoreError {
    /// Timeouts, connection failures, 5xx and throttling.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::Throttled(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub struct PutObjectRequest {
    pub target: ObjectTarget,
    pub body: Body,
    pub content_length: u64,
    pub metadata: ObjectMetadata,
}

pub struct UploadPartRequest {
    pub target: ObjectTarget,
    pub upload_id: String,
    pub part_number: u32,
    pub body: Body,
    pub content_length: u64,
    pub is_last_part: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

pub struct GetObjectOutput {
    pub body: Body,
    /// Bytes in this response.
    pub content_length: u64,
    /// Size of the whole object.
    pub object_size: u64,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Single-shot upload. Returns the object's ETag.
    async fn put_object(&self, request: PutObjectRequest) -> Result<String, StoreError>;

    async fn get_object(
        &self,
        target: &ObjectTarget,
        range: Option<ByteRange>,
    ) -> Result<GetObjectOutput, StoreError>;

    /// Returns the multipart upload id.
    async fn initiate_multipart_upload(
        &self,
        target: &ObjectTarget,
        metadata: &ObjectMetadata,
    ) -> Result<String, StoreError>;

    /// Returns the part's ETag.
    async fn upload_part(&self, request: UploadPartRequest) -> Result<String, StoreError>;

    async fn complete_multipart_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        metadata: &ObjectMetadata,
    ) -> Result<String, StoreError>;

    async fn abort_multipart_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
    ) -> Result<(), StoreError>;
}

/// Rejects keys that could escape their bucket.
pub(crate) fn validate_target(target: &ObjectTarget) -> Result<(), StoreError> {
    let bad_bucket = target.bucket.is_empty()
        || target.bucket.starts_with('.')
        || target.bucket.contains(['/', '\\']);
    if bad_bucket {
        return Err(StoreError::InvalidRequest(format!(
            "invalid bucket name: {:?}",
            target.bucket
        )));
    }

    let bad_key = target.key.is_empty()
        || target.key.starts_with('/')
        || target.key.split('/').any(|segment| segment == ".." || segment == ".");
    if bad_key {
        return Err(StoreError::InvalidRequest(format!(
            "invalid object key: {:?}",
            target.key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Timeout("t".into()).is_transient());
        assert!(StoreError::Throttled("slow down".into()).is_transient());
        assert!(
            StoreError::Server {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !StoreError::Server {
                status: 400,
                message: "bad".into()
            }
            .is_transient()
        );
        assert!(!StoreError::AccessDenied("no".into()).is_transient());
        assert!(
            !StoreError::ChecksumMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn target_validation() {
        assert!(validate_target(&ObjectTarget::new("photos", "2024/a.jpg")).is_ok());
        assert!(validate_target(&ObjectTarget::new("photos", "../etc/passwd")).is_err());
        assert!(validate_target(&ObjectTarget::new("photos", "a/../../b")).is_err());
        assert!(validate_target(&ObjectTarget::new("photos", "/abs")).is_err());
        assert!(validate_target(&ObjectTarget::new("", "k")).is_err());
        assert!(validate_target(&ObjectTarget::new(".multipart", "k")).is_err());
    }
}
