use facilitator_codec::CodecError;
use facilitator_core::{Classify, FailureClass};
use facilitator_crypto::{AuthError, EncryptError};
use facilitator_field::FieldError;
use facilitator_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("malformed batch: {0}")]
    Codec(#[from] CodecError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("share arithmetic: {0}")]
    Field(#[from] FieldError),
    #[error("packet sealing: {0}")]
    Seal(#[from] EncryptError),
    #[error("batch header does not match: {0}")]
    HeaderMismatch(String),
    #[error("peer validation batch {0} not available before deadline")]
    PeerTimeout(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    Task(String),
}

impl Classify for PipelineError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Storage(e) => e.class(),
            Self::Codec(e) => e.class(),
            Self::Auth(_) => FailureClass::Authentication,
            Self::HeaderMismatch(_) | Self::Field(_) => FailureClass::Malformed,
            Self::PeerTimeout(_) => FailureClass::NotReady,
            Self::Seal(_) | Self::Config(_) | Self::Cancelled | Self::Task(_) => {
                FailureClass::Fatal
            }
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_follow_sources() {
        assert_eq!(
            PipelineError::from(StorageError::Transient("x".into())).class(),
            FailureClass::Transient
        );
        assert_eq!(
            PipelineError::from(StorageError::AlreadyExists("x".into())).class(),
            FailureClass::AlreadyProcessed
        );
        assert_eq!(
            PipelineError::from(CodecError::DigestMismatch).class(),
            FailureClass::Malformed
        );
        assert_eq!(
            PipelineError::from(AuthError::EmptyKeySet("p".into())).class(),
            FailureClass::Authentication
        );
        assert_eq!(PipelineError::PeerTimeout("k".into()).class(), FailureClass::NotReady);
        assert_eq!(PipelineError::Cancelled.class(), FailureClass::Fatal);
    }
}
