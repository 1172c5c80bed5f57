use std::io;
use std::path::{Path, PathBuf};

use super::models::TransferId;
use super::network::NetworkClass;
use crate::store::StoreError;

/// How an error is handled by the executor and coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff until the retry budget runs out.
    Transient,
    /// The remote store refused the request. Fails immediately.
    Rejected,
    /// Disk full, file missing and similar. Fails immediately.
    LocalResource,
    /// Not an error; the record settles in its pending stop state.
    Cancelled,
    /// Not a failure; the record waits for the network.
    NetworkUnavailable,
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum TransferError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{}: {message}", path.display())]
    LocalIo {
        path: PathBuf,
        kind: io::ErrorKind,
        raw_os_error: Option<i32>,
        message: String,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("required network unavailable: {0}")]
    NetworkUnavailable(NetworkClass),

    #[error("transfer {0} not found")]
    NotFound(TransferId),

    #[error("transfer {0} is already running")]
    AlreadyRunning(TransferId),

    #[error("failed to persist transfer state: {0}")]
    Persistence(String),

    #[error("gave up after {attempts} retries: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransferError>,
    },

    #[error("invalid transfer: {0}")]
    InvalidRecord(String),
}

impl TransferError {
    pub fn local(path: impl AsRef<Path>, error: io::Error) -> Self {
        Self::LocalIo {
            path: path.as_ref().to_path_buf(),
            kind: error.kind(),
            raw_os_error: error.raw_os_error(),
            message: error.to_string(),
        }
    }

    pub fn persistence(error: impl std::fmt::Display) -> Self {
        Self::Persistence(error.to_string())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) if e.is_transient() => ErrorClass::Transient,
            Self::Store(_) => ErrorClass::Rejected,
            Self::LocalIo { kind, .. } => match kind {
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => ErrorClass::Transient,
                _ => ErrorClass::LocalResource,
            },
            Self::Cancelled => ErrorClass::Cancelled,
            Self::NetworkUnavailable(_) => ErrorClass::NetworkUnavailable,
            Self::Persistence(_) => ErrorClass::LocalResource,
            Self::NotFound(_)
            | Self::AlreadyRunning(_)
            | Self::InvalidRecord(_)
            | Self::RetriesExhausted { .. } => ErrorClass::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Local disk or quota exhausted.
    pub fn is_out_of_space(&self) -> bool {
        match self {
            Self::LocalIo {
                kind,
                raw_os_error,
                ..
            } => {
                *kind == io::ErrorKind::StorageFull
                    || matches!(raw_os_error, Some(code) if *code == libc::ENOSPC || *code == libc::EDQUOT)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_split_into_transient_and_rejected() {
        let timeout = TransferError::from(StoreError::Timeout("t".into()));
        assert_eq!(timeout.class(), ErrorClass::Transient);
        assert!(timeout.is_retryable());

        let denied = TransferError::from(StoreError::AccessDenied("no".into()));
        assert_eq!(denied.class(), ErrorClass::Rejected);
        assert!(!denied.is_retryable());
    }

    #[test]
    fn disk_full_is_a_local_resource_error() {
        let err = TransferError::local("/data/x", io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.class(), ErrorClass::LocalResource);
        assert!(err.is_out_of_space());

        let missing = TransferError::local("/data/y", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(missing.class(), ErrorClass::LocalResource);
        assert!(!missing.is_out_of_space());
    }

    #[test]
    fn exhausted_retries_are_final() {
        let err = TransferError::RetriesExhausted {
            attempts: 3,
            last: Box::new(StoreError::Throttled("slow down".into()).into()),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 retries"));
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        assert_eq!(TransferError::Cancelled.class(), ErrorClass::Cancelled);
        assert_eq!(
            TransferError::NetworkUnavailable(NetworkClass::Any).class(),
            ErrorClass::NetworkUnavailable
        );
    }
}
