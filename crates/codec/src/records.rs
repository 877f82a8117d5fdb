//! Header and packet record schemas.

use facilitator_core::{AggregationId, BatchKind, Interval};
use facilitator_field::Field32;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Schema;

/// Metadata for one batch. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub batch_uuid: Uuid,
    pub aggregation_id: AggregationId,
    pub kind: BatchKind,
    /// Time range the batch covers.
    pub interval: Interval,
    /// Field elements per share.
    pub dimension: u32,
    pub packet_count: u64,
    /// SHA-256 of the payload file.
    #[serde(with = "hex::serde")]
    pub payload_digest: [u8; 32],
}

impl BatchHeader {
    /// Header template; `encode` fills in the packet count and digest.
    pub fn new(
        batch_uuid: Uuid,
        aggregation_id: AggregationId,
        kind: BatchKind,
        interval: Interval,
        dimension: u32,
    ) -> Self {
        Self {
            batch_uuid,
            aggregation_id,
            kind,
            interval,
            dimension,
            packet_count: 0,
            payload_digest: [0u8; 32],
        }
    }
}

/// A record type carried in a batch payload.
pub trait PacketRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: BatchKind;

    /// Packet identity, unique within its batch. `None` for records without one.
    fn packet_uuid(&self) -> Option<Uuid>;
}

pub(crate) fn payload_schema(kind: BatchKind) -> Schema {
    match kind {
        BatchKind::Ingestion => Schema::IngestionPayload,
        BatchKind::Validation => Schema::ValidationPayload,
        BatchKind::Sum => Schema::SumPayload,
    }
}

/// One client submission as seen by one processor: its share, sealed to
/// that processor's packet-encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionPacket {
    pub uuid: Uuid,
    /// Which of the processor's packet keys sealed this share.
    pub encryption_key_id: String,
    #[serde(with = "hex::serde")]
    pub encrypted_share: Vec<u8>,
}

impl PacketRecord for IngestionPacket {
    const KIND: BatchKind = BatchKind::Ingestion;

    fn packet_uuid(&self) -> Option<Uuid> {
        Some(self.uuid)
    }
}

/// One processor's verification fragment for one packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPacket {
    pub uuid: Uuid,
    pub fragment: Vec<Field32>,
}

impl PacketRecord for ValidationPacket {
    const KIND: BatchKind = BatchKind::Validation;

    fn packet_uuid(&self) -> Option<Uuid> {
        Some(self.uuid)
    }
}

/// A processor's partial sum over one aggregation window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumRecord {
    pub sum: Vec<Field32>,
    pub valid_packets: u64,
    pub invalid_packets: u64,
    /// Ingestion batches that contributed, sorted.
    #[serde(default)]
    pub ingestion_batches: Vec<Uuid>,
}

impl PacketRecord for SumRecord {
    const KIND: BatchKind = BatchKind::Sum;

    fn packet_uuid(&self) -> Option<Uuid> {
        None
    }
}

/// Contents of a `.sig` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSignature {
    /// Identifier of the key that produced the signature. Informational:
    /// verification still tries every active key of the signer.
    pub key_identifier: String,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}
