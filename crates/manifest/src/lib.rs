//! Facilitator Manifest
//!
//! Read-only views of the manifests peers publish: which keys sign their
//! batches, which keys their packets are sealed to, and where their batches
//! live. Manifests are fetched over HTTPS or read from local files.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use facilitator_core::{Classify, FailureClass};
use facilitator_crypto::{KeySet, PublicKeyEntry};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// The only manifest format this crate understands.
pub const MANIFEST_FORMAT: u32 = 0;

pub const SPECIFIC_MANIFEST_NAME: &str = "specific-manifest.json";
pub const GLOBAL_MANIFEST_NAME: &str = "global-manifest.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported manifest format {0}")]
    UnsupportedFormat(u32),
    #[error("invalid manifest URL: {0}")]
    InvalidUrl(String),
    #[error("manifest fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("key {identifier} is invalid: {reason}")]
    InvalidKey { identifier: String, reason: String },
    #[error("key {identifier} has unparseable expiration {value:?}")]
    InvalidExpiration { identifier: String, value: String },
    #[error("no key with identifier {0}")]
    UnknownKey(String),
    #[error("party {0} is not in the global manifest")]
    UnknownParty(String),
}

impl Classify for ManifestError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Http(_) => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSigningPublicKey {
    /// Hex-encoded ed25519 public key.
    #[serde(rename = "public-key")]
    pub public_key: String,
    /// RFC 3339 timestamp, or empty for a key that does not expire.
    #[serde(default)]
    pub expiration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEncryptionKey {
    /// Hex-encoded x25519 public key.
    #[serde(rename = "public-key")]
    pub public_key: String,
}

/// The manifest a peer publishes for one specific counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificManifest {
    pub format: u32,
    #[serde(rename = "ingestion-bucket")]
    pub ingestion_bucket: String,
    #[serde(rename = "peer-validation-bucket")]
    pub peer_validation_bucket: String,
    #[serde(rename = "batch-signing-public-keys")]
    pub batch_signing_public_keys: BTreeMap<String, BatchSigningPublicKey>,
    #[serde(rename = "packet-encryption-keys", default)]
    pub packet_encryption_keys: BTreeMap<String, PacketEncryptionKey>,
    /// Storage path per aggregation id, when it differs from the buckets above.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aggregations: BTreeMap<String, String>,
}

/// One party's entry in the global manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyEntry {
    #[serde(rename = "batch-signing-public-keys")]
    pub batch_signing_public_keys: BTreeMap<String, BatchSigningPublicKey>,
    #[serde(rename = "storage-endpoint")]
    pub storage_endpoint: String,
}

/// The manifest listing every party's signing keys and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalManifest {
    pub format: u32,
    pub parties: BTreeMap<String, PartyEntry>,
}

trait Versioned {
    fn format(&self) -> u32;
}

impl Versioned for SpecificManifest {
    fn format(&self) -> u32 {
        self.format
    }
}

impl Versioned for GlobalManifest {
    fn format(&self) -> u32 {
        self.format
    }
}

fn parse<M: DeserializeOwned + Versioned, R: Read>(reader: R) -> Result<M> {
    let manifest: M = serde_json::from_reader(reader)?;
    if manifest.format() != MANIFEST_FORMAT {
        return Err(ManifestError::UnsupportedFormat(manifest.format()));
    }
    Ok(manifest)
}

/// Build `{base}/{name}` and force the scheme to HTTPS.
pub fn manifest_url(base: &str, name: &str) -> Result<Url> {
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };
    let mut url = Url::parse(&base)
        .and_then(|b| b.join(name))
        .map_err(|e| ManifestError::InvalidUrl(e.to_string()))?;
    url.set_scheme("https")
        .map_err(|_| ManifestError::InvalidUrl(format!("cannot use https for {url}")))?;
    Ok(url)
}

async fn fetch<M: DeserializeOwned + Versioned>(url: Url) -> Result<M> {
    debug!(%url, "fetching manifest");
    let body = reqwest::get(url).await?.error_for_status()?.bytes().await?;
    parse(body.as_ref())
}

/// Signing keys that are valid at `now`, as a [`KeySet`] ordered by identifier.
fn key_set(
    owner: &str,
    keys: &BTreeMap<String, BatchSigningPublicKey>,
    now: DateTime<Utc>,
) -> Result<KeySet> {
    let mut entries = Vec::with_capacity(keys.len());
    for (identifier, key) in keys {
        if !key.expiration.is_empty() {
            let expires = DateTime::parse_from_rfc3339(&key.expiration).map_err(|_| {
                ManifestError::InvalidExpiration {
                    identifier: identifier.clone(),
                    value: key.expiration.clone(),
                }
            })?;
            if expires.with_timezone(&Utc) <= now {
                debug!(owner, key = %identifier, "skipping expired signing key");
                continue;
            }
        }
        let entry = PublicKeyEntry::from_hex(identifier.clone(), &key.public_key).map_err(|e| {
            ManifestError::InvalidKey {
                identifier: identifier.clone(),
                reason: e.to_string(),
            }
        })?;
        entries.push(entry);
    }
    if entries.is_empty() {
        warn!(owner, "no active batch signing keys");
    }
    Ok(KeySet::new(owner, entries))
}

impl SpecificManifest {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        parse(reader)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Fetch `{base}/{peer}/specific-manifest.json` over HTTPS.
    pub async fn from_https(base: &str, peer: &str) -> Result<Self> {
        let url = manifest_url(&format!("{}/{peer}", base.trim_end_matches('/')), SPECIFIC_MANIFEST_NAME)?;
        fetch(url).await
    }

    /// The peer's batch signing keys not yet expired at `now`.
    pub fn batch_signing_key_set(&self, owner: &str, now: DateTime<Utc>) -> Result<KeySet> {
        key_set(owner, &self.batch_signing_public_keys, now)
    }

    pub fn packet_encryption_key(&self, identifier: &str) -> Result<[u8; 32]> {
        let entry = self
            .packet_encryption_keys
            .get(identifier)
            .ok_or_else(|| ManifestError::UnknownKey(identifier.to_string()))?;
        let invalid = |reason: String| ManifestError::InvalidKey {
            identifier: identifier.to_string(),
            reason,
        };
        let bytes = hex::decode(entry.public_key.trim()).map_err(|e| invalid(e.to_string()))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| invalid(format!("expected 32 bytes, got {}", bytes.len())))
    }

    /// Storage location for `aggregation_id`, falling back to the ingestion bucket.
    pub fn ingestion_path(&self, aggregation_id: &str) -> &str {
        self.aggregations
            .get(aggregation_id)
            .map(String::as_str)
            .unwrap_or(&self.ingestion_bucket)
    }
}

impl GlobalManifest {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        parse(reader)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    pub async fn from_https(base: &str) -> Result<Self> {
        fetch(manifest_url(base, GLOBAL_MANIFEST_NAME)?).await
    }

    pub fn party(&self, party: &str) -> Result<&PartyEntry> {
        self.parties
            .get(party)
            .ok_or_else(|| ManifestError::UnknownParty(party.to_string()))
    }

    pub fn batch_signing_key_set(&self, party: &str, now: DateTime<Utc>) -> Result<KeySet> {
        key_set(party, &self.party(party)?.batch_signing_public_keys, now)
    }
}
