//! Facilitator Keystore
//!
//! File-based key persistence with platform-aware paths. A key file holds a
//! 32-byte secret, either raw or hex-encoded (surrounding whitespace ignored).

use std::fs;
use std::path::{Path, PathBuf};

use facilitator_crypto::{EncryptionKeypair, SigningKeypair};
use thiserror::Error;
use tracing::{debug, info};

pub const SERVICE_NAME: &str = "facilitator";

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read key file {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },
    #[error("Failed to write key file: {0}")]
    WriteError(String),
    #[error("Invalid key format in {0}")]
    InvalidFormat(PathBuf),
    #[error("Failed to create directory: {0}")]
    CreateDirError(String),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Read a 32-byte secret from `path`.
pub fn read_secret(path: &Path) -> Result<[u8; 32]> {
    let bytes = fs::read(path).map_err(|e| KeystoreError::ReadError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_secret(&bytes).ok_or_else(|| KeystoreError::InvalidFormat(path.to_path_buf()))
}

fn parse_secret(bytes: &[u8]) -> Option<[u8; 32]> {
    if let Ok(raw) = <[u8; 32]>::try_from(bytes) {
        return Some(raw);
    }
    let text = std::str::from_utf8(bytes).ok()?.trim();
    let decoded = hex::decode(text).ok()?;
    decoded.as_slice().try_into().ok()
}

/// Save a secret hex-encoded, creating parent directories as needed.
pub fn save_secret(path: &Path, secret: &[u8; 32]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| KeystoreError::CreateDirError(e.to_string()))?;
    }
    fs::write(path, hex::encode(secret)).map_err(|e| KeystoreError::WriteError(e.to_string()))
}

/// Load the batch signing key. The file must exist.
pub fn load_signing_keypair(path: &Path) -> Result<SigningKeypair> {
    debug!("Loading signing key from {}", path.display());
    Ok(SigningKeypair::from_secret_bytes(&read_secret(path)?))
}

/// Load the packet decryption key. The file must exist.
pub fn load_encryption_keypair(path: &Path) -> Result<EncryptionKeypair> {
    debug!("Loading packet key from {}", path.display());
    Ok(EncryptionKeypair::from_secret_bytes(&read_secret(path)?))
}

/// Load the batch signing key, generating and saving one if absent.
pub fn load_or_generate_signing_keypair(path: &Path) -> Result<SigningKeypair> {
    if path.exists() {
        return load_signing_keypair(path);
    }
    info!("Generating new signing key at {}", path.display());
    let keypair = SigningKeypair::generate();
    save_secret(path, &keypair.secret_key_bytes())?;
    Ok(keypair)
}

/// Load the packet decryption key, generating and saving one if absent.
pub fn load_or_generate_encryption_keypair(path: &Path) -> Result<EncryptionKeypair> {
    if path.exists() {
        return load_encryption_keypair(path);
    }
    info!("Generating new packet key at {}", path.display());
    let keypair = EncryptionKeypair::generate();
    save_secret(path, &keypair.secret_key_bytes())?;
    Ok(keypair)
}

/// Get the default keystore directory for a given service name.
///
/// - macOS: `~/Library/Application Support/{ServiceName}/keys`
/// - Linux: `~/.local/share/{service_name}/keys`
/// - Windows: `%APPDATA%\{ServiceName}\keys`
pub fn default_keystore_dir_for(service: &str) -> PathBuf {
    data_dir(service).join("keys")
}

/// Get the default config directory for a given service name.
///
/// - macOS: `~/Library/Application Support/{ServiceName}`
/// - Linux: `~/.config/{service_name}`
/// - Windows: `%APPDATA%\{ServiceName}`
pub fn default_config_dir_for(service: &str) -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home_dir().join("Library").join("Application Support").join(capitalize(service))
    }
    #[cfg(target_os = "linux")]
    {
        let xdg = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".config"));
        xdg.join(service.to_lowercase())
    }
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join("AppData").join("Roaming"));
        appdata.join(capitalize(service))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        home_dir().join(format!(".{}", service.to_lowercase()))
    }
}

/// Get the default data directory for a given service name.
pub fn data_dir(service: &str) -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home_dir().join("Library").join("Application Support").join(capitalize(service))
    }
    #[cfg(target_os = "linux")]
    {
        let xdg = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".local").join("share"));
        xdg.join(service.to_lowercase())
    }
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join("AppData").join("Roaming"));
        appdata.join(capitalize(service))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        home_dir().join(format!(".{}", service.to_lowercase()))
    }
}

pub fn default_signing_key_path_for(service: &str) -> PathBuf {
    default_keystore_dir_for(service).join("batch-signing.key")
}

pub fn default_packet_key_path_for(service: &str) -> PathBuf {
    default_keystore_dir_for(service).join("packet-decryption.key")
}

/// Expand `~` in paths to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if path == "~" => home_dir(),
        None => PathBuf::from(path),
    }
}

fn home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => c.to_uppercase().to_string() + &chars.as_str().to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_load_signing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("batch-signing.key");

        let kp1 = load_or_generate_signing_keypair(&path).unwrap();
        let kp2 = load_or_generate_signing_keypair(&path).unwrap();
        assert_eq!(kp2.public_key_bytes(), kp1.public_key_bytes());
        assert_eq!(load_signing_keypair(&path).unwrap().public_key_bytes(), kp1.public_key_bytes());
    }

    #[test]
    fn test_generate_and_load_packet_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packet.key");

        let kp1 = load_or_generate_encryption_keypair(&path).unwrap();
        let kp2 = load_encryption_keypair(&path).unwrap();
        assert_eq!(kp2.public_key_bytes(), kp1.public_key_bytes());
    }

    #[test]
    fn test_raw_and_hex_formats() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.key");
        let hexed = dir.path().join("hex.key");
        fs::write(&raw, [5u8; 32]).unwrap();
        fs::write(&hexed, format!("  {}\n", hex::encode([5u8; 32]))).unwrap();

        assert_eq!(read_secret(&raw).unwrap(), [5u8; 32]);
        assert_eq!(read_secret(&hexed).unwrap(), [5u8; 32]);
    }

    #[test]
    fn test_invalid_key_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        fs::write(&path, b"too short").unwrap();

        assert!(matches!(
            load_or_generate_signing_keypair(&path),
            Err(KeystoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_missing_key_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_signing_keypair(&dir.path().join("absent.key")),
            Err(KeystoreError::ReadError { .. })
        ));
    }

    #[test]
    fn test_default_paths() {
        assert!(default_keystore_dir_for(SERVICE_NAME)
            .to_string_lossy()
            .contains("keys"));
        assert!(default_signing_key_path_for(SERVICE_NAME)
            .to_string_lossy()
            .ends_with("batch-signing.key"));
        assert!(!default_config_dir_for(SERVICE_NAME).as_os_str().is_empty());
    }

    #[test]
    fn test_expand_path() {
        assert!(!expand_path("~/test").to_string_lossy().starts_with('~'));
        assert_eq!(expand_path("/abs/path"), PathBuf::from("/abs/path"));
    }
}
