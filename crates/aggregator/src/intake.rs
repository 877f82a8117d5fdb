//! Authenticating and decoding incoming batches.

use std::sync::Arc;

use facilitator_codec::{decode, decode_signature, signed_message, BatchHeader, PacketRecord};
use facilitator_core::{AggregationId, AggregationWindow, BatchKind};
use facilitator_crypto::{verify_with_key_set, KeySet, VerifiedSigner};
use facilitator_storage::{BatchFiles, BatchKey};
use tracing::debug;
use uuid::Uuid;

use crate::PipelineError;

/// A batch whose signature verified and whose contents decoded cleanly.
#[derive(Debug, Clone)]
pub struct AuthenticatedBatch<P> {
    pub key: BatchKey,
    pub header: BatchHeader,
    pub packets: Vec<P>,
    pub signer: VerifiedSigner,
}

/// Verify the batch signature against `keys`, then decode.
///
/// The signature is checked before any payload record is parsed.
pub fn authenticate_and_decode<P: PacketRecord>(
    key: BatchKey,
    files: &BatchFiles,
    keys: &KeySet,
) -> Result<AuthenticatedBatch<P>, PipelineError> {
    let signature = decode_signature(&files.signature)?;
    let message = signed_message(&files.header, &files.payload);
    let signer = verify_with_key_set(&message, &signature.signature, keys)?;
    if signer.key_identifier != signature.key_identifier {
        debug!(
            batch = %key,
            claimed = %signature.key_identifier,
            matched = %signer.key_identifier,
            "signature key identifier differs from matching key"
        );
    }

    let (header, packets) = decode::<P>(&files.header, &files.payload)?;
    Ok(AuthenticatedBatch {
        key,
        header,
        packets,
        signer,
    })
}

/// [`authenticate_and_decode`] on the blocking pool.
pub async fn authenticate_and_decode_blocking<P: PacketRecord>(
    key: BatchKey,
    files: BatchFiles,
    keys: Arc<KeySet>,
) -> Result<AuthenticatedBatch<P>, PipelineError> {
    tokio::task::spawn_blocking(move || authenticate_and_decode(key, &files, &keys)).await?
}

/// What an incoming header must agree with.
#[derive(Debug, Clone)]
pub struct ExpectedHeader<'a> {
    pub aggregation_id: &'a AggregationId,
    pub window: &'a AggregationWindow,
    pub kind: BatchKind,
    pub dimension: u32,
    /// Required batch UUID, for validation batches answering an ingestion batch.
    pub batch_uuid: Option<Uuid>,
}

/// Check header fields that the codec cannot know about.
pub fn check_header(
    key: &BatchKey,
    header: &BatchHeader,
    expected: &ExpectedHeader<'_>,
) -> Result<(), PipelineError> {
    let mismatch = |what: String| Err(PipelineError::HeaderMismatch(format!("{key}: {what}")));

    if &header.aggregation_id != expected.aggregation_id {
        return mismatch(format!(
            "aggregation {} != {}",
            header.aggregation_id, expected.aggregation_id
        ));
    }
    if header.kind != expected.kind {
        return mismatch(format!("kind {} != {}", header.kind, expected.kind));
    }
    if !expected.window.interval.contains_interval(&header.interval) {
        return mismatch(format!(
            "interval {} outside window {}",
            header.interval, expected.window.interval
        ));
    }
    if header.dimension != expected.dimension {
        return mismatch(format!(
            "dimension {} != {}",
            header.dimension, expected.dimension
        ));
    }
    if key.name != header.batch_uuid.to_string() {
        return mismatch(format!("named {} but header uuid is {}", key.name, header.batch_uuid));
    }
    if let Some(uuid) = expected.batch_uuid {
        if header.batch_uuid != uuid {
            return mismatch(format!("batch uuid {} != {}", header.batch_uuid, uuid));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::BatchEmitter;
    use facilitator_codec::{CodecError, IngestionPacket};
    use facilitator_core::{Classify, FailureClass, Interval};
    use facilitator_crypto::{AuthError, SigningKeypair};

    fn window() -> AggregationWindow {
        AggregationWindow::new(AggregationId::new("flu"), Interval::new(0, 3600).unwrap())
    }

    fn signed_batch(emitter: &BatchEmitter) -> (BatchKey, BatchFiles, BatchHeader) {
        let uuid = Uuid::new_v4();
        let header = BatchHeader::new(
            uuid,
            AggregationId::new("flu"),
            BatchKind::Ingestion,
            Interval::new(0, 60).unwrap(),
            2,
        );
        let packets = vec![IngestionPacket {
            uuid: Uuid::new_v4(),
            encryption_key_id: "pek".into(),
            encrypted_share: vec![1, 2, 3],
        }];
        let files = emitter.build(&header, &packets).unwrap();
        (BatchKey::for_batch(AggregationId::new("flu"), 0, uuid), files, header)
    }

    #[tokio::test]
    async fn test_authenticated_batch_decodes() {
        let emitter = BatchEmitter::new(SigningKeypair::generate(), "k1");
        let (key, files, _) = signed_batch(&emitter);
        let batch: AuthenticatedBatch<IngestionPacket> =
            authenticate_and_decode_blocking(key, files, Arc::new(emitter.key_set("ingestor")))
                .await
                .unwrap();
        assert_eq!(batch.packets.len(), 1);
        assert_eq!(batch.signer.key_identifier, "k1");
    }

    #[test]
    fn test_unknown_signer_rejected() {
        let emitter = BatchEmitter::new(SigningKeypair::generate(), "k1");
        let stranger = BatchEmitter::new(SigningKeypair::generate(), "k1");
        let (key, files, _) = signed_batch(&stranger);

        let err = authenticate_and_decode::<IngestionPacket>(key, &files, &emitter.key_set("ingestor"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Auth(AuthError::NoMatchingKey { .. })));
        assert_eq!(err.class(), FailureClass::Authentication);
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let emitter = BatchEmitter::new(SigningKeypair::generate(), "k1");
        let (key, mut files, _) = signed_batch(&emitter);
        let last = files.payload.len() - 1;
        files.payload[last] ^= 1;
        let err = authenticate_and_decode::<IngestionPacket>(key, &files, &emitter.key_set("i"))
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Authentication);
    }

    #[test]
    fn test_garbled_signature_file_is_malformed() {
        let emitter = BatchEmitter::new(SigningKeypair::generate(), "k1");
        let (key, mut files, _) = signed_batch(&emitter);
        files.signature = b"nope".to_vec();
        let err = authenticate_and_decode::<IngestionPacket>(key, &files, &emitter.key_set("i"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Codec(CodecError::BadMagic)));
    }

    #[test]
    fn test_check_header() {
        let emitter = BatchEmitter::new(SigningKeypair::generate(), "k1");
        let (key, _, header) = signed_batch(&emitter);
        let window = window();
        let aggregation = AggregationId::new("flu");
        let expected = ExpectedHeader {
            aggregation_id: &aggregation,
            window: &window,
            kind: BatchKind::Ingestion,
            dimension: 2,
            batch_uuid: None,
        };
        assert!(check_header(&key, &header, &expected).is_ok());

        let wrong_dimension = ExpectedHeader { dimension: 3, ..expected.clone() };
        assert!(matches!(
            check_header(&key, &header, &wrong_dimension),
            Err(PipelineError::HeaderMismatch(_))
        ));

        let wrong_uuid = ExpectedHeader { batch_uuid: Some(Uuid::new_v4()), ..expected.clone() };
        assert!(check_header(&key, &header, &wrong_uuid).is_err());

        let renamed = BatchKey::new(key.aggregation_id.clone(), key.timestamp, "other");
        assert!(check_header(&renamed, &header, &expected).is_err());

        let later = AggregationWindow::new(aggregation.clone(), Interval::new(3600, 7200).unwrap());
        let outside = ExpectedHeader { window: &later, ..expected };
        assert!(check_header(&key, &header, &outside).is_err());
    }
}
