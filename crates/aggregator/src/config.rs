//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use facilitator_core::{AggregationId, PartyId};
use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// Exponential backoff for transient storage failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Give up once this much time has passed since the first attempt.
    pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 200,
            max_interval_ms: 5_000,
            max_elapsed_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}

/// How long to wait for the peer's validation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerPollConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// After this long without the peer batch the window is reported incomplete.
    pub deadline_ms: u64,
}

impl Default for PeerPollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            deadline_ms: 15 * 60 * 1_000,
        }
    }
}

impl PeerPollConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Storage roots, one directory per batch store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where the ingestor writes this processor's ingestion batches.
    pub ingestion: PathBuf,
    /// Where this processor writes validation batches for its peer.
    pub own_validation: PathBuf,
    /// Where the peer writes validation batches for this processor.
    pub peer_validation: PathBuf,
    pub sum: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ingestion: PathBuf::from("data/ingestion"),
            own_validation: PathBuf::from("data/own-validation"),
            peer_validation: PathBuf::from("data/peer-validation"),
            sum: PathBuf::from("data/sum"),
        }
    }
}

/// Manifest locations: a file path, or an `https://` base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub ingestor: String,
    pub peer: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            ingestor: "manifests/ingestor.json".to_string(),
            peer: "manifests/peer.json".to_string(),
        }
    }
}

/// Configuration of one data share processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacilitatorConfig {
    pub own_party: PartyId,
    pub peer_party: PartyId,
    pub ingestor_party: PartyId,
    pub aggregation_id: AggregationId,
    /// Field elements per share.
    pub dimension: u32,
    pub window_duration_secs: u64,
    /// How long after a window closes before it is processed.
    pub grace_period_secs: u64,
    /// Identifier published for this processor's batch signing key.
    pub signing_key_id: String,
    /// Identifier ingestors use for this processor's packet encryption key.
    pub packet_key_id: String,
    /// Hex-encoded 32-byte seed shared with the peer for proof verification.
    pub verification_seed: String,
    pub signing_key_path: Option<PathBuf>,
    pub packet_key_path: Option<PathBuf>,
    pub storage: StorageConfig,
    pub manifests: ManifestConfig,
    pub retry: RetryConfig,
    pub peer_poll: PeerPollConfig,
    /// Ingestion batches processed at once within a window.
    pub max_concurrent_batches: usize,
}

impl Default for FacilitatorConfig {
    fn default() -> Self {
        Self {
            own_party: PartyId::new("facilitator"),
            peer_party: PartyId::new("pha"),
            ingestor_party: PartyId::new("ingestor"),
            aggregation_id: AggregationId::new("default"),
            dimension: 1,
            window_duration_secs: 3600,
            grace_period_secs: 300,
            signing_key_id: "batch-signing-key-1".to_string(),
            packet_key_id: "packet-encryption-key-1".to_string(),
            verification_seed: String::new(),
            signing_key_path: None,
            packet_key_path: None,
            storage: StorageConfig::default(),
            manifests: ManifestConfig::default(),
            retry: RetryConfig::default(),
            peer_poll: PeerPollConfig::default(),
            max_concurrent_batches: 8,
        }
    }
}

impl FacilitatorConfig {
    pub fn verification_seed(&self) -> Result<[u8; 32], PipelineError> {
        let bytes = hex::decode(self.verification_seed.trim())
            .map_err(|e| PipelineError::Config(format!("verification_seed: {e}")))?;
        bytes.as_slice().try_into().map_err(|_| {
            PipelineError::Config(format!(
                "verification_seed must be 32 bytes, got {}",
                bytes.len()
            ))
        })
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.own_party == self.peer_party {
            return Err(PipelineError::Config(
                "own_party and peer_party must differ".to_string(),
            ));
        }
        if self.dimension == 0 {
            return Err(PipelineError::Config("dimension must be positive".to_string()));
        }
        if self.window_duration_secs == 0 || self.window_duration_secs % 60 != 0 {
            return Err(PipelineError::Config(
                "window_duration_secs must be a positive multiple of 60".to_string(),
            ));
        }
        if self.max_concurrent_batches == 0 {
            return Err(PipelineError::Config(
                "max_concurrent_batches must be positive".to_string(),
            ));
        }
        self.verification_seed()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> FacilitatorConfig {
        FacilitatorConfig {
            verification_seed: hex::encode([1u8; 32]),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let cfg = FacilitatorConfig::default();
        assert_eq!(cfg.window_duration_secs, 3600);
        assert_eq!(cfg.grace_period_secs, 300);
        assert_eq!(cfg.max_concurrent_batches, 8);
        assert!(cfg.validate().is_err(), "default seed is empty");
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let mut cfg = valid();
        cfg.peer_party = cfg.own_party.clone();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.window_duration_secs = 90;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.verification_seed = "abcd".into();
        assert!(matches!(cfg.verification_seed(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: FacilitatorConfig =
            serde_json::from_str(r#"{ "dimension": 12, "retry": { "max_elapsed_ms": 5 } }"#).unwrap();
        assert_eq!(cfg.dimension, 12);
        assert_eq!(cfg.retry.max_elapsed_ms, 5);
        assert_eq!(cfg.retry.initial_interval_ms, 200);
        assert_eq!(cfg.peer_poll, PeerPollConfig::default());
    }
}
