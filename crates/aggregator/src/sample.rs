//! Sample batch generator.
//!
//! Plays the ingestor: splits client vectors into shares, proves them,
//! seals each half to its processor and writes one signed ingestion batch
//! to each processor's store.

use facilitator_codec::{BatchHeader, IngestionPacket};
use facilitator_core::{AggregationId, BatchKind, Interval};
use facilitator_crypto::seal_for_recipient;
use facilitator_field::{split, Field32};
use facilitator_storage::{BatchKey, BatchStore};
use rand::rngs::OsRng;
use tracing::info;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::emitter::BatchEmitter;
use crate::validation::{LinearSketchVerifier, SharePlaintext};
use crate::PipelineError;

/// Where one processor receives its ingestion batches.
#[derive(Clone)]
pub struct ProcessorTarget {
    pub packet_key_id: String,
    pub packet_public_key: [u8; 32],
    pub ingestion: BatchStore,
}

pub struct SampleGenerator {
    aggregation_id: AggregationId,
    dimension: usize,
    ingestor: BatchEmitter,
    verifier: LinearSketchVerifier,
    targets: [ProcessorTarget; 2],
    retry: RetryConfig,
}

impl SampleGenerator {
    pub fn new(
        aggregation_id: AggregationId,
        dimension: usize,
        ingestor: BatchEmitter,
        verification_seed: [u8; 32],
        targets: [ProcessorTarget; 2],
    ) -> Self {
        Self {
            aggregation_id,
            dimension,
            ingestor,
            verifier: LinearSketchVerifier::new(verification_seed),
            targets,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Packets for both processors, one pair per input vector.
    pub fn build_packets(
        &self,
        inputs: &[Vec<Field32>],
    ) -> Result<(Vec<IngestionPacket>, Vec<IngestionPacket>), PipelineError> {
        let mut first = Vec::with_capacity(inputs.len());
        let mut second = Vec::with_capacity(inputs.len());

        for input in inputs {
            if input.len() != self.dimension {
                return Err(PipelineError::Config(format!(
                    "sample input has {} elements, expected {}",
                    input.len(),
                    self.dimension
                )));
            }
            let uuid = Uuid::new_v4();
            let proof = self.verifier.prove(uuid, input);
            let (data_a, data_b) = split(input, &mut OsRng);
            let (proof_a, proof_b) = split(&proof, &mut OsRng);

            first.push(seal_share(uuid, &self.targets[0], data_a, proof_a)?);
            second.push(seal_share(uuid, &self.targets[1], data_b, proof_b)?);
        }
        Ok((first, second))
    }

    /// Sign and store one batch per processor under a shared batch UUID.
    ///
    /// `packets` pairs come from [`build_packets`](Self::build_packets) and
    /// may be altered in between to simulate misbehaving clients.
    pub async fn write_batch(
        &self,
        interval: Interval,
        timestamp: i64,
        packets: (Vec<IngestionPacket>, Vec<IngestionPacket>),
    ) -> Result<BatchKey, PipelineError> {
        let batch_uuid = Uuid::new_v4();
        let header = BatchHeader::new(
            batch_uuid,
            self.aggregation_id.clone(),
            BatchKind::Ingestion,
            interval,
            self.dimension as u32,
        );
        let key = BatchKey::for_batch(self.aggregation_id.clone(), timestamp, batch_uuid);

        for (target, packets) in self.targets.iter().zip([packets.0, packets.1]) {
            let files = self.ingestor.build(&header, &packets)?;
            self.ingestor
                .emit(&target.ingestion, &key, &files, &self.retry)
                .await?;
        }
        info!(batch = %key, "sample ingestion batch written");
        Ok(key)
    }

    /// Build and write one batch holding `inputs`.
    pub async fn generate(
        &self,
        interval: Interval,
        timestamp: i64,
        inputs: &[Vec<Field32>],
    ) -> Result<BatchKey, PipelineError> {
        let packets = self.build_packets(inputs)?;
        self.write_batch(interval, timestamp, packets).await
    }
}

fn seal_share(
    uuid: Uuid,
    target: &ProcessorTarget,
    data: Vec<Field32>,
    proof: Vec<Field32>,
) -> Result<IngestionPacket, PipelineError> {
    let plaintext = serde_json::to_vec(&SharePlaintext { data, proof })
        .map_err(|e| PipelineError::Config(format!("encode share: {e}")))?;
    Ok(IngestionPacket {
        uuid,
        encryption_key_id: target.packet_key_id.clone(),
        encrypted_share: seal_for_recipient(&target.packet_public_key, &plaintext)?,
    })
}
