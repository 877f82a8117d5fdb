//! Facilitator Storage
//!
//! The object store boundary and the batch file-set adapter built on it.
//! An [`ObjectStore`] knows about keys and bytes only; [`BatchStore`] knows
//! that a batch is three files and enforces the write ordering that lets
//! readers treat a present header as a complete batch.

pub mod batch;
pub mod local;
pub mod memory;

pub use batch::{BatchFiles, BatchKey, BatchStore, HEADER_SUFFIX, PAYLOAD_SUFFIX, SIGNATURE_SUFFIX};
pub use local::LocalStore;
pub use memory::MemoryStore;

use facilitator_core::{Classify, FailureClass};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("batch not found: {0}")]
    NotFound(String),
    #[error("batch {key} is missing {missing:?}")]
    PartialBatch {
        key: String,
        missing: Vec<&'static str>,
    },
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("storage I/O error: {0}")]
    Io(String),
}

impl StorageError {
    pub(crate) fn from_io(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                Self::Transient(format!("{context}: {err}"))
            }
            ErrorKind::AlreadyExists => Self::AlreadyExists(context.to_string()),
            _ => Self::Io(format!("{context}: {err}")),
        }
    }
}

impl Classify for StorageError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Transient(_) => FailureClass::Transient,
            Self::NotFound(_) | Self::PartialBatch { .. } => FailureClass::NotReady,
            Self::AlreadyExists(_) => FailureClass::AlreadyProcessed,
            Self::InvalidKey(_) | Self::Io(_) => FailureClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Key/bytes storage with a conditional create.
///
/// Implementations must make `put_if_absent` atomic: of two concurrent writers
/// to the same key, exactly one succeeds and the other sees `AlreadyExists`.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create `key` with `bytes`, failing with `AlreadyExists` if it is present.
    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("flu/2020/01/01/00/00/abc.header").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a\\b").is_err());
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(StorageError::Transient("x".into()).class(), FailureClass::Transient);
        assert_eq!(StorageError::NotFound("x".into()).class(), FailureClass::NotReady);
        assert_eq!(
            StorageError::AlreadyExists("x".into()).class(),
            FailureClass::AlreadyProcessed
        );
        assert_eq!(StorageError::InvalidKey("x".into()).class(), FailureClass::Fatal);
    }

    #[test]
    fn test_io_error_mapping() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(
            StorageError::from_io("get", timed_out),
            StorageError::Transient(_)
        ));
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(StorageError::from_io("get", denied), StorageError::Io(_)));
    }
}
