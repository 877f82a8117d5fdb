//! Signing and storing outgoing batches.

use std::sync::Arc;

use facilitator_codec::{encode, encode_signature, signed_message, BatchHeader, BatchSignature, PacketRecord};
use facilitator_crypto::{sign_data, KeySet, SigningKeypair};
use facilitator_storage::{BatchFiles, BatchKey, BatchStore, StorageError};
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::retry::retry_transient;
use crate::PipelineError;

/// Result of a conditional batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStatus {
    Written,
    /// A batch with this key was already present and was left untouched.
    AlreadyPresent,
}

/// Signs batches with this processor's key and writes them conditionally.
#[derive(Clone)]
pub struct BatchEmitter {
    signer: Arc<SigningKeypair>,
    key_identifier: String,
}

impl BatchEmitter {
    pub fn new(signer: SigningKeypair, key_identifier: impl Into<String>) -> Self {
        Self {
            signer: Arc::new(signer),
            key_identifier: key_identifier.into(),
        }
    }

    pub fn key_identifier(&self) -> &str {
        &self.key_identifier
    }

    /// Key set that verifies this emitter's signatures.
    pub fn key_set(&self, owner: &str) -> KeySet {
        KeySet::single(owner, self.key_identifier.clone(), &self.signer)
    }

    /// Encode and sign a batch. Deterministic for identical inputs.
    pub fn build<P: PacketRecord>(
        &self,
        header: &BatchHeader,
        packets: &[P],
    ) -> Result<BatchFiles, PipelineError> {
        let encoded = encode(header, packets)?;
        let message = signed_message(&encoded.header_bytes, &encoded.payload_bytes);
        let signature = BatchSignature {
            key_identifier: self.key_identifier.clone(),
            signature: sign_data(&self.signer, &message).to_vec(),
        };
        Ok(BatchFiles {
            header: encoded.header_bytes,
            payload: encoded.payload_bytes,
            signature: encode_signature(&signature)?,
        })
    }

    /// Store `files` under `key`. An existing batch is reported, not overwritten.
    pub async fn emit(
        &self,
        store: &BatchStore,
        key: &BatchKey,
        files: &BatchFiles,
        retry: &RetryConfig,
    ) -> Result<EmitStatus, PipelineError> {
        let result = retry_transient(retry, "store batch", || async {
            store.store(key, files).await.map_err(PipelineError::from)
        })
        .await;

        match result {
            Ok(()) => {
                info!(batch = %key, "batch emitted");
                Ok(EmitStatus::Written)
            }
            Err(PipelineError::Storage(StorageError::AlreadyExists(object))) => {
                debug!(batch = %key, %object, "batch already present");
                Ok(EmitStatus::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facilitator_codec::{decode, decode_signature, ValidationPacket};
    use facilitator_core::{AggregationId, BatchKind, Interval};
    use facilitator_crypto::verify_with_key_set;
    use facilitator_field::Field32;
    use facilitator_storage::MemoryStore;
    use uuid::Uuid;

    fn header() -> BatchHeader {
        BatchHeader::new(
            Uuid::new_v4(),
            AggregationId::new("flu"),
            BatchKind::Validation,
            Interval::new(0, 60).unwrap(),
            2,
        )
    }

    #[test]
    fn test_build_is_signed_and_deterministic() {
        let emitter = BatchEmitter::new(SigningKeypair::generate(), "key-1");
        let packets = vec![ValidationPacket {
            uuid: Uuid::new_v4(),
            fragment: vec![Field32::ONE; 4],
        }];
        let header = header();
        let files = emitter.build(&header, &packets).unwrap();
        assert_eq!(files, emitter.build(&header, &packets).unwrap());

        let signature = decode_signature(&files.signature).unwrap();
        assert_eq!(signature.key_identifier, "key-1");
        let verified = verify_with_key_set(
            &signed_message(&files.header, &files.payload),
            &signature.signature,
            &emitter.key_set("me"),
        )
        .unwrap();
        assert_eq!(verified.owner, "me");

        let (_, decoded) = decode::<ValidationPacket>(&files.header, &files.payload).unwrap();
        assert_eq!(decoded, packets);
    }

    #[tokio::test]
    async fn test_emit_reports_existing_batch() {
        let emitter = BatchEmitter::new(SigningKeypair::generate(), "key-1");
        let store = BatchStore::new(Arc::new(MemoryStore::new()));
        let key = BatchKey::new(AggregationId::new("flu"), 0, "v");
        let files = emitter.build::<ValidationPacket>(&header(), &[]).unwrap();
        let retry = RetryConfig::default();

        assert_eq!(
            emitter.emit(&store, &key, &files, &retry).await.unwrap(),
            EmitStatus::Written
        );
        assert_eq!(
            emitter.emit(&store, &key, &files, &retry).await.unwrap(),
            EmitStatus::AlreadyPresent
        );
    }
}
