//! Facilitator App
//!
//! Process bootstrap: logging, settings, keys, manifests and stores, ending
//! in a [`Facilitator`] ready to run.

pub mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use facilitator_aggregator::{
    Facilitator, FacilitatorConfig, FacilitatorKeys, PacketKeyring, PipelineError, PipelineStores,
};
use facilitator_crypto::{EncryptionKeypair, KeySet, SigningKeypair};
use facilitator_keystore::KeystoreError;
use facilitator_manifest::{GlobalManifest, ManifestError, SpecificManifest};
use facilitator_settings::{default_settings_path, Settings, SettingsError};
use facilitator_storage::{BatchStore, LocalStore};
use thiserror::Error;
use tracing::info;

pub use logging::LogLevel;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Settings error: {0}")]
    SettingsError(#[from] SettingsError),
    #[error("Keystore error: {0}")]
    KeystoreError(#[from] KeystoreError),
    #[error("Manifest error: {0}")]
    ManifestError(#[from] ManifestError),
    #[error("Pipeline error: {0}")]
    PipelineError(#[from] PipelineError),
}

/// Initialized application context
pub struct App {
    pub service: String,
    pub settings: Settings<FacilitatorConfig>,
    pub facilitator: Arc<Facilitator>,
}

/// Builder for constructing an App with configurable options.
pub struct AppBuilder {
    service: String,
    log_level: LogLevel,
    skip_logging: bool,
    skip_banner: bool,
    generate_missing_keys: bool,
    config_path: Option<PathBuf>,
    now: Option<DateTime<Utc>>,
}

impl AppBuilder {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            log_level: LogLevel::Info,
            skip_logging: false,
            skip_banner: false,
            generate_missing_keys: false,
            config_path: None,
            now: None,
        }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.log_level = LogLevel::from_verbose(verbose);
        self
    }

    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    pub fn skip_banner(mut self) -> Self {
        self.skip_banner = true;
        self
    }

    /// Create key files that do not exist yet instead of failing.
    pub fn generate_missing_keys(mut self) -> Self {
        self.generate_missing_keys = true;
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Evaluate manifest key expirations at `now` instead of the current time.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub async fn build(self) -> Result<App, AppError> {
        if !self.skip_logging {
            let _ = logging::try_init(self.log_level);
        }

        // Relative paths in the settings file are relative to that file.
        let path = self
            .config_path
            .clone()
            .unwrap_or_else(|| default_settings_path(&self.service));
        let settings: Settings<FacilitatorConfig> = Settings::load(&path)?;
        let config = settings.config.clone();
        config.validate()?;
        let base = settings
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let (signing, packet) = self.load_keys(&config, &base)?;

        let now = self.now.unwrap_or_else(Utc::now);
        let ingestor = ingestor_key_set(&config, &base, now).await?;
        let peer = peer_key_set(&config, &base, now).await?;

        let open = |root: &Path| BatchStore::new(Arc::new(LocalStore::new(resolve(&base, root))));
        let stores = PipelineStores {
            ingestion: open(&config.storage.ingestion),
            own_validation: open(&config.storage.own_validation),
            peer_validation: open(&config.storage.peer_validation),
            sum: open(&config.storage.sum),
        };

        if !self.skip_banner {
            info!(
                "{} {} starting, party {} with peer {}, signing key {}",
                self.service,
                env!("CARGO_PKG_VERSION"),
                config.own_party,
                config.peer_party,
                hex::encode(signing.public_key_bytes()),
            );
        }

        let keys = FacilitatorKeys {
            signing,
            packet_keys: PacketKeyring::single(config.packet_key_id.clone(), packet),
            ingestor,
            peer,
        };
        let facilitator = Facilitator::new(config, stores, keys)?;

        Ok(App {
            service: self.service,
            settings,
            facilitator: Arc::new(facilitator),
        })
    }

    fn load_keys(
        &self,
        config: &FacilitatorConfig,
        base: &Path,
    ) -> Result<(SigningKeypair, EncryptionKeypair), AppError> {
        let signing_path = config
            .signing_key_path
            .as_deref()
            .map(|p| resolve(base, p))
            .unwrap_or_else(|| facilitator_keystore::default_signing_key_path_for(&self.service));
        let packet_path = config
            .packet_key_path
            .as_deref()
            .map(|p| resolve(base, p))
            .unwrap_or_else(|| facilitator_keystore::default_packet_key_path_for(&self.service));

        if self.generate_missing_keys {
            Ok((
                facilitator_keystore::load_or_generate_signing_keypair(&signing_path)?,
                facilitator_keystore::load_or_generate_encryption_keypair(&packet_path)?,
            ))
        } else {
            Ok((
                facilitator_keystore::load_signing_keypair(&signing_path)?,
                facilitator_keystore::load_encryption_keypair(&packet_path)?,
            ))
        }
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("https://") || location.starts_with("http://")
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    let expanded = facilitator_keystore::expand_path(&path.to_string_lossy());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// The ingestor's signing keys, from the global manifest.
async fn ingestor_key_set(
    config: &FacilitatorConfig,
    base: &Path,
    now: DateTime<Utc>,
) -> Result<KeySet, ManifestError> {
    let location = &config.manifests.ingestor;
    let manifest = if is_remote(location) {
        GlobalManifest::from_https(location).await?
    } else {
        GlobalManifest::from_file(&resolve(base, Path::new(location)))?
    };
    manifest.batch_signing_key_set(config.ingestor_party.as_str(), now)
}

/// The peer's signing keys, from the manifest it publishes for us.
async fn peer_key_set(
    config: &FacilitatorConfig,
    base: &Path,
    now: DateTime<Utc>,
) -> Result<KeySet, ManifestError> {
    let location = &config.manifests.peer;
    let manifest = if is_remote(location) {
        SpecificManifest::from_https(location, config.peer_party.as_str()).await?
    } else {
        SpecificManifest::from_file(&resolve(base, Path::new(location)))?
    };
    manifest.batch_signing_key_set(config.peer_party.as_str(), now)
}
