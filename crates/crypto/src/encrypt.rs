use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::keys::EncryptionKeypair;

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncryptError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Ciphertext too short")]
    CiphertextTooShort,
}

/// Symmetric key bound to the shared secret and both public keys.
fn derive_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"facilitator-packet-seal-v1");
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Seal a packet share to a processor's packet-encryption public key.
///
/// Output layout: `[ephemeral_pub: 32][nonce: 12][ciphertext + tag]`.
pub fn seal_for_recipient(
    recipient_pubkey: &[u8; 32],
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_pubkey));

    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient_pubkey);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| EncryptError::InvalidKey)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EncryptError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&ephemeral_public);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed packet share with the recipient's keypair.
pub fn open_sealed(recipient: &EncryptionKeypair, sealed: &[u8]) -> Result<Vec<u8>, EncryptError> {
    if sealed.len() < EPHEMERAL_LEN + NONCE_LEN {
        return Err(EncryptError::CiphertextTooShort);
    }

    let mut ephemeral_public = [0u8; EPHEMERAL_LEN];
    ephemeral_public.copy_from_slice(&sealed[..EPHEMERAL_LEN]);
    let nonce = Nonce::from_slice(&sealed[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN]);
    let ciphertext = &sealed[EPHEMERAL_LEN + NONCE_LEN..];

    let shared = recipient
        .secret()
        .diffie_hellman(&PublicKey::from(ephemeral_public));
    let key = derive_key(
        shared.as_bytes(),
        &ephemeral_public,
        &recipient.public_key_bytes(),
    );

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| EncryptError::InvalidKey)?;
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptError::DecryptionFailed)
}
