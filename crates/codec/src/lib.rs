//! Facilitator Codec
//!
//! Encoding and decoding of batch file sets. A batch is three files: a
//! header, a payload of packet records and a detached signature. Decoding
//! is where untrusted bytes become typed values, so every structural check
//! happens here: schema tags, payload digest, declared packet count, record
//! schema and packet UUID uniqueness.

pub mod envelope;
pub mod records;

use std::collections::HashSet;

use facilitator_core::{BatchKind, Classify, FailureClass};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub use envelope::Schema;
pub use records::{
    BatchHeader, BatchSignature, IngestionPacket, PacketRecord, SumRecord, ValidationPacket,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("missing or wrong file magic")]
    BadMagic,
    #[error("unknown schema tag {0}")]
    UnknownSchema(u8),
    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u8),
    #[error("schema mismatch: expected tag {expected}, found {found}")]
    SchemaMismatch { expected: u8, found: u8 },
    #[error("batch kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: BatchKind, found: BatchKind },
    #[error("payload digest does not match header")]
    DigestMismatch,
    #[error("header declares {declared} packets, payload holds {actual}")]
    CountMismatch { declared: u64, actual: u64 },
    #[error("record {index} is malformed: {reason}")]
    Record { index: usize, reason: String },
    #[error("duplicate packet {0}")]
    DuplicatePacket(Uuid),
    #[error("header interval is empty")]
    InvalidInterval,
    #[error("expected exactly one record, found {0}")]
    RecordCount(usize),
    #[error("file truncated")]
    Truncated,
    #[error("record of {0} bytes exceeds limit")]
    RecordTooLarge(usize),
    #[error("encoding failed: {0}")]
    Encode(String),
}

impl Classify for CodecError {
    fn class(&self) -> FailureClass {
        FailureClass::Malformed
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Serialized header and payload plus the header as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub header: BatchHeader,
    pub header_bytes: Vec<u8>,
    pub payload_bytes: Vec<u8>,
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

fn to_record<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

fn check_unique<'a, P: PacketRecord>(packets: impl Iterator<Item = &'a P>) -> Result<()> {
    let mut seen = HashSet::new();
    for packet in packets {
        if let Some(uuid) = packet.packet_uuid() {
            if !seen.insert(uuid) {
                return Err(CodecError::DuplicatePacket(uuid));
            }
        }
    }
    Ok(())
}

/// Encode a batch. The returned header carries the real packet count and
/// payload digest, whatever the template held.
pub fn encode<P: PacketRecord>(header: &BatchHeader, packets: &[P]) -> Result<EncodedBatch> {
    if header.kind != P::KIND {
        return Err(CodecError::KindMismatch {
            expected: P::KIND,
            found: header.kind,
        });
    }
    if header.interval.end <= header.interval.start {
        return Err(CodecError::InvalidInterval);
    }
    check_unique(packets.iter())?;

    let records = packets.iter().map(to_record).collect::<Result<Vec<_>>>()?;
    let payload_bytes = envelope::write(records::payload_schema(P::KIND), &records)?;

    let mut header = header.clone();
    header.packet_count = packets.len() as u64;
    header.payload_digest = digest(&payload_bytes);
    let header_bytes = envelope::write(Schema::Header, &[to_record(&header)?])?;

    Ok(EncodedBatch {
        header,
        header_bytes,
        payload_bytes,
    })
}

fn single_record<T: serde::de::DeserializeOwned>(bytes: &[u8], schema: Schema) -> Result<T> {
    let frames = envelope::read(bytes, schema)?;
    if frames.len() != 1 {
        return Err(CodecError::RecordCount(frames.len()));
    }
    serde_json::from_slice(frames[0]).map_err(|e| CodecError::Record {
        index: 0,
        reason: e.to_string(),
    })
}

/// Decode a header file on its own.
pub fn decode_header(header_bytes: &[u8]) -> Result<BatchHeader> {
    let header: BatchHeader = single_record(header_bytes, Schema::Header)?;
    if header.interval.end <= header.interval.start {
        return Err(CodecError::InvalidInterval);
    }
    Ok(header)
}

/// Decode and structurally validate a batch.
pub fn decode<P: PacketRecord>(
    header_bytes: &[u8],
    payload_bytes: &[u8],
) -> Result<(BatchHeader, Vec<P>)> {
    let header = decode_header(header_bytes)?;
    if header.kind != P::KIND {
        return Err(CodecError::KindMismatch {
            expected: P::KIND,
            found: header.kind,
        });
    }
    if digest(payload_bytes) != header.payload_digest {
        return Err(CodecError::DigestMismatch);
    }

    let frames = envelope::read(payload_bytes, records::payload_schema(P::KIND))?;
    if frames.len() as u64 != header.packet_count {
        return Err(CodecError::CountMismatch {
            declared: header.packet_count,
            actual: frames.len() as u64,
        });
    }

    let packets = frames
        .iter()
        .enumerate()
        .map(|(index, frame)| {
            serde_json::from_slice::<P>(frame).map_err(|e| CodecError::Record {
                index,
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<P>>>()?;
    check_unique(packets.iter())?;

    Ok((header, packets))
}

pub fn encode_signature(signature: &BatchSignature) -> Result<Vec<u8>> {
    envelope::write(Schema::Signature, &[to_record(signature)?])
}

pub fn decode_signature(bytes: &[u8]) -> Result<BatchSignature> {
    single_record(bytes, Schema::Signature)
}

/// The exact bytes a batch signature covers: `[header_len: u64 BE][header][payload]`.
pub fn signed_message(header_bytes: &[u8], payload_bytes: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + header_bytes.len() + payload_bytes.len());
    message.extend_from_slice(&(header_bytes.len() as u64).to_be_bytes());
    message.extend_from_slice(header_bytes);
    message.extend_from_slice(payload_bytes);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use facilitator_core::{AggregationId, Interval};
    use facilitator_field::Field32;
    use proptest::prelude::*;

    fn header(kind: BatchKind) -> BatchHeader {
        BatchHeader::new(
            Uuid::new_v4(),
            AggregationId::new("flu"),
            kind,
            Interval::new(1_600_000_000, 1_600_000_060).unwrap(),
            4,
        )
    }

    fn ingestion_packets(n: usize) -> Vec<IngestionPacket> {
        (0..n)
            .map(|i| IngestionPacket {
                uuid: Uuid::new_v4(),
                encryption_key_id: "pek-1".into(),
                encrypted_share: vec![i as u8; 48],
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_ingestion() {
        let packets = ingestion_packets(3);
        let encoded = encode(&header(BatchKind::Ingestion), &packets).unwrap();
        assert_eq!(encoded.header.packet_count, 3);

        let (decoded_header, decoded) =
            decode::<IngestionPacket>(&encoded.header_bytes, &encoded.payload_bytes).unwrap();
        assert_eq!(decoded_header, encoded.header);
        assert_eq!(decoded, packets);
    }

    #[test]
    fn test_roundtrip_sum() {
        let record = SumRecord {
            sum: vec![Field32::new(5), Field32::ZERO],
            valid_packets: 2,
            invalid_packets: 1,
            ingestion_batches: vec![Uuid::new_v4()],
        };
        let mut template = header(BatchKind::Sum);
        template.dimension = 2;
        let encoded = encode(&template, &[record.clone()]).unwrap();
        let (_, decoded) = decode::<SumRecord>(&encoded.header_bytes, &encoded.payload_bytes).unwrap();
        assert_eq!(decoded, vec![record]);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let packets = ingestion_packets(2);
        let template = header(BatchKind::Ingestion);
        assert_eq!(encode(&template, &packets).unwrap(), encode(&template, &packets).unwrap());
    }

    #[test]
    fn test_corrupted_payload_digest() {
        let encoded = encode(&header(BatchKind::Ingestion), &ingestion_packets(3)).unwrap();
        let mut payload = encoded.payload_bytes.clone();
        let last = payload.len() - 2;
        payload[last] ^= 0x01;
        assert_eq!(
            decode::<IngestionPacket>(&encoded.header_bytes, &payload),
            Err(CodecError::DigestMismatch)
        );
    }

    #[test]
    fn test_declared_count_mismatch() {
        let mut encoded = encode(&header(BatchKind::Ingestion), &ingestion_packets(3)).unwrap();
        encoded.header.packet_count = 4;
        let header_bytes =
            envelope::write(Schema::Header, &[serde_json::to_vec(&encoded.header).unwrap()]).unwrap();
        assert_eq!(
            decode::<IngestionPacket>(&header_bytes, &encoded.payload_bytes),
            Err(CodecError::CountMismatch {
                declared: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_wrong_variant_rejected() {
        let encoded = encode(&header(BatchKind::Ingestion), &ingestion_packets(1)).unwrap();
        assert_eq!(
            decode::<ValidationPacket>(&encoded.header_bytes, &encoded.payload_bytes),
            Err(CodecError::KindMismatch {
                expected: BatchKind::Validation,
                found: BatchKind::Ingestion
            })
        );
    }

    #[test]
    fn test_record_schema_violation() {
        let mut template = header(BatchKind::Validation);
        let payload = envelope::write(
            Schema::ValidationPayload,
            &[br#"{"uuid":"not-a-uuid","fragment":[]}"#.to_vec()],
        )
        .unwrap();
        template.packet_count = 1;
        template.payload_digest = digest(&payload);
        let header_bytes =
            envelope::write(Schema::Header, &[serde_json::to_vec(&template).unwrap()]).unwrap();

        assert!(matches!(
            decode::<ValidationPacket>(&header_bytes, &payload),
            Err(CodecError::Record { index: 0, .. })
        ));
    }

    #[test]
    fn test_non_canonical_fragment_rejected() {
        let mut template = header(BatchKind::Validation);
        let record = format!(
            r#"{{"uuid":"{}","fragment":[{}]}}"#,
            Uuid::new_v4(),
            facilitator_field::MODULUS
        );
        let payload =
            envelope::write(Schema::ValidationPayload, &[record.into_bytes()]).unwrap();
        template.packet_count = 1;
        template.payload_digest = digest(&payload);
        let header_bytes =
            envelope::write(Schema::Header, &[serde_json::to_vec(&template).unwrap()]).unwrap();

        assert!(matches!(
            decode::<ValidationPacket>(&header_bytes, &payload),
            Err(CodecError::Record { index: 0, .. })
        ));
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let mut packets = ingestion_packets(2);
        packets[1].uuid = packets[0].uuid;
        assert_eq!(
            encode(&header(BatchKind::Ingestion), &packets),
            Err(CodecError::DuplicatePacket(packets[0].uuid))
        );
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let mut template = header(BatchKind::Validation);
        let uuid = Uuid::new_v4();
        let record = format!(r#"{{"uuid":"{}","fragment":[1,2],"added_later":"x"}}"#, uuid);
        let payload = envelope::write(Schema::ValidationPayload, &[record.into_bytes()]).unwrap();
        template.packet_count = 1;
        template.payload_digest = digest(&payload);
        let header_bytes =
            envelope::write(Schema::Header, &[serde_json::to_vec(&template).unwrap()]).unwrap();

        let (_, packets) = decode::<ValidationPacket>(&header_bytes, &payload).unwrap();
        assert_eq!(packets[0].uuid, uuid);
        assert_eq!(packets[0].fragment, vec![Field32::new(1), Field32::new(2)]);
    }

    #[test]
    fn test_signature_file_roundtrip() {
        let signature = BatchSignature {
            key_identifier: "key-1".into(),
            signature: vec![7u8; 64],
        };
        let bytes = encode_signature(&signature).unwrap();
        assert_eq!(decode_signature(&bytes).unwrap(), signature);
        assert!(decode_signature(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_signed_message_binds_boundary() {
        assert_ne!(signed_message(b"ab", b"c"), signed_message(b"a", b"bc"));
    }

    #[test]
    fn test_errors_are_malformed() {
        assert_eq!(CodecError::DigestMismatch.class(), FailureClass::Malformed);
    }

    proptest! {
        #[test]
        fn prop_validation_roundtrip(
            fragments in proptest::collection::vec(
                proptest::collection::vec(0u32..facilitator_field::MODULUS, 0..6),
                0..12,
            )
        ) {
            let packets: Vec<ValidationPacket> = fragments
                .into_iter()
                .map(|raw| ValidationPacket {
                    uuid: Uuid::new_v4(),
                    fragment: raw.into_iter().map(|v| Field32::new(v as u64)).collect(),
                })
                .collect();
            let encoded = encode(&header(BatchKind::Validation), &packets).unwrap();
            let (decoded_header, decoded) =
                decode::<ValidationPacket>(&encoded.header_bytes, &encoded.payload_bytes).unwrap();
            prop_assert_eq!(decoded_header, encoded.header);
            prop_assert_eq!(decoded, packets);
        }
    }
}
