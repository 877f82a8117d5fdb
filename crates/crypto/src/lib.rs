//! Facilitator Crypto
//!
//! Cryptographic primitives used by the batch pipeline: ed25519 batch
//! signatures verified against explicit key sets, and x25519 sealing of
//! ingestion packets to a processor's packet key.
//! No dependency on batch or storage types.

pub mod keys;
pub mod encrypt;
pub mod sign;

pub use keys::{hash, EncryptionKeypair, KeyError, SigningKeypair};
pub use encrypt::{open_sealed, seal_for_recipient, EncryptError};
pub use sign::{
    sign_data, verify_with_key_set, AuthError, KeySet, PublicKeyEntry,
    VerifiedSigner, SIGNATURE_LEN,
};
