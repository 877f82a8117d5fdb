use ed25519_dalek::{Signature, Signer, VerifyingKey};
use thiserror::Error;

use crate::keys::{parse_key_hex, KeyError, SigningKeypair};

/// Length of an ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("no active public keys for signer {0}")]
    EmptyKeySet(String),
    #[error("signature has length {0}, expected 64")]
    MalformedSignature(usize),
    #[error("signature does not verify under any of {tried} key(s) for signer {owner}")]
    NoMatchingKey { owner: String, tried: usize },
}

/// One candidate public key of a signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyEntry {
    pub identifier: String,
    pub key: VerifyingKey,
}

impl PublicKeyEntry {
    pub fn new(identifier: impl Into<String>, key: VerifyingKey) -> Self {
        Self {
            identifier: identifier.into(),
            key,
        }
    }

    pub fn from_hex(identifier: impl Into<String>, encoded: &str) -> Result<Self, KeyError> {
        let bytes = parse_key_hex(encoded)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self::new(identifier, key))
    }
}

/// The currently valid public keys of one signer, checked in order.
///
/// During a rotation overlap both the old and the new key are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    pub owner: String,
    pub keys: Vec<PublicKeyEntry>,
}

impl KeySet {
    pub fn new(owner: impl Into<String>, keys: Vec<PublicKeyEntry>) -> Self {
        Self {
            owner: owner.into(),
            keys,
        }
    }

    /// Key set holding the public half of a local keypair.
    pub fn single(owner: impl Into<String>, identifier: impl Into<String>, keypair: &SigningKeypair) -> Self {
        Self::new(owner, vec![PublicKeyEntry::new(identifier, keypair.verifying_key())])
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Who produced a verified signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSigner {
    pub owner: String,
    pub key_identifier: String,
}

/// Sign data with a signing keypair. Ed25519 signing is deterministic.
pub fn sign_data(keypair: &SigningKeypair, data: &[u8]) -> [u8; 64] {
    let signature: Signature = keypair.signing_key.sign(data);
    signature.to_bytes()
}

/// Verify `signature` over `data` against every key in `keys`, in order.
///
/// Fails closed: an empty key set is a rejection, not a pass.
pub fn verify_with_key_set(
    data: &[u8],
    signature: &[u8],
    keys: &KeySet,
) -> Result<VerifiedSigner, AuthError> {
    if keys.is_empty() {
        return Err(AuthError::EmptyKeySet(keys.owner.clone()));
    }

    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| AuthError::MalformedSignature(signature.len()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    keys.keys
        .iter()
        .find(|entry| entry.key.verify_strict(data, &signature).is_ok())
        .map(|entry| VerifiedSigner {
            owner: keys.owner.clone(),
            key_identifier: entry.identifier.clone(),
        })
        .ok_or_else(|| AuthError::NoMatchingKey {
            owner: keys.owner.clone(),
            tried: keys.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = SigningKeypair::generate();
        let data = b"batch header bytes";

        let keys = KeySet::single("ingestor", "key-1", &keypair);

        let signature = sign_data(&keypair, data);
        assert!(verify_with_key_set(data, &signature, &keys).is_ok());
        assert!(verify_with_key_set(b"other", &signature, &keys).is_err());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let keypair = SigningKeypair::generate();
        assert_eq!(sign_data(&keypair, b"same"), sign_data(&keypair, b"same"));
    }

    #[test]
    fn test_key_set_accepts_matching_key() {
        let keypair = SigningKeypair::generate();
        let keys = KeySet::single("ingestor", "key-1", &keypair);
        let signature = sign_data(&keypair, b"payload");

        let signer = verify_with_key_set(b"payload", &signature, &keys).unwrap();
        assert_eq!(signer.owner, "ingestor");
        assert_eq!(signer.key_identifier, "key-1");
    }

    #[test]
    fn test_key_set_rotation_overlap() {
        let old = SigningKeypair::generate();
        let new = SigningKeypair::generate();
        let keys = KeySet::new(
            "peer",
            vec![
                PublicKeyEntry::new("old", old.verifying_key()),
                PublicKeyEntry::new("new", new.verifying_key()),
            ],
        );

        let by_old = verify_with_key_set(b"x", &sign_data(&old, b"x"), &keys).unwrap();
        let by_new = verify_with_key_set(b"x", &sign_data(&new, b"x"), &keys).unwrap();
        assert_eq!(by_old.key_identifier, "old");
        assert_eq!(by_new.key_identifier, "new");
    }

    #[test]
    fn test_empty_key_set_fails_closed() {
        let keypair = SigningKeypair::generate();
        let signature = sign_data(&keypair, b"payload");
        let keys = KeySet::new("ingestor", vec![]);

        assert_eq!(
            verify_with_key_set(b"payload", &signature, &keys),
            Err(AuthError::EmptyKeySet("ingestor".into()))
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let keys = KeySet::single("ingestor", "key-1", &other);
        let signature = sign_data(&signer, b"payload");

        assert_eq!(
            verify_with_key_set(b"payload", &signature, &keys),
            Err(AuthError::NoMatchingKey {
                owner: "ingestor".into(),
                tried: 1
            })
        );
    }

    #[test]
    fn test_every_bit_flip_rejected() {
        let keypair = SigningKeypair::generate();
        let keys = KeySet::single("ingestor", "key-1", &keypair);
        let data = b"header+payload".to_vec();
        let signature = sign_data(&keypair, &data);

        for bit in 0..data.len() * 8 {
            let mut flipped = data.clone();
            flipped[bit / 8] ^= 1 << (bit % 8);
            assert!(verify_with_key_set(&flipped, &signature, &keys).is_err());
        }
        for bit in 0..SIGNATURE_LEN * 8 {
            let mut flipped = signature;
            flipped[bit / 8] ^= 1 << (bit % 8);
            assert!(verify_with_key_set(&data, &flipped, &keys).is_err());
        }
    }

    #[test]
    fn test_truncated_signature() {
        let keypair = SigningKeypair::generate();
        let keys = KeySet::single("ingestor", "key-1", &keypair);
        assert_eq!(
            verify_with_key_set(b"x", &[0u8; 10], &keys),
            Err(AuthError::MalformedSignature(10))
        );
    }

    #[test]
    fn test_public_key_entry_from_hex() {
        let keypair = SigningKeypair::generate();
        let entry = PublicKeyEntry::from_hex("k", &hex::encode(keypair.public_key_bytes())).unwrap();
        assert_eq!(entry.key, keypair.verifying_key());
        assert!(PublicKeyEntry::from_hex("k", "00").is_err());
    }
}
