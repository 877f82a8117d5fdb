//! Share validation protocol.
//!
//! Each processor opens its half of every packet, derives a verification
//! fragment from it and publishes the fragments in a Validation batch. A
//! packet is valid when its two fragments, one from each processor, satisfy
//! the [`ProofVerifier`] predicate. Neither fragment alone reveals anything
//! about the client's data.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use facilitator_codec::IngestionPacket;
use facilitator_core::FailureClass;
use facilitator_crypto::{open_sealed, EncryptionKeypair};
use facilitator_field::{linear_sketch, Field32, SKETCH_PROJECTIONS};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Plaintext of a sealed share: this processor's half of the client data and
/// of the client's proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharePlaintext {
    pub data: Vec<Field32>,
    pub proof: Vec<Field32>,
}

/// One opened packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketShare {
    pub uuid: Uuid,
    pub data: Vec<Field32>,
    pub proof: Vec<Field32>,
}

/// The validity predicate both processors evaluate.
///
/// Implementations must be linear in the shares: `verdict` sees only the two
/// fragments, never the data.
pub trait ProofVerifier: Send + Sync {
    /// Proof length for data of `dimension` elements.
    fn proof_len(&self, dimension: usize) -> usize;

    /// This processor's verification fragment for one packet.
    fn fragment(&self, share: &PacketShare) -> Vec<Field32>;

    /// Whether the packet is valid given both processors' fragments.
    fn verdict(&self, packet: Uuid, own: &[Field32], peer: &[Field32]) -> bool;
}

/// Sketch-based verifier.
///
/// The client proof is `sketch(data)` under projections derived from a seed
/// shared by the processors and the packet UUID. Each fragment is
/// `sketch(data_share) - proof_share`; by linearity the two fragments sum to
/// `sketch(data) - proof`, which is zero exactly when the shares are
/// consistent with the proof.
#[derive(Clone)]
pub struct LinearSketchVerifier {
    seed: [u8; 32],
}

impl LinearSketchVerifier {
    pub fn new(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    /// Client side: the proof for `data` in packet `packet`.
    pub fn prove(&self, packet: Uuid, data: &[Field32]) -> Vec<Field32> {
        linear_sketch(&self.seed, packet.as_bytes(), data).to_vec()
    }
}

impl fmt::Debug for LinearSketchVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearSketchVerifier").finish_non_exhaustive()
    }
}

impl ProofVerifier for LinearSketchVerifier {
    fn proof_len(&self, _dimension: usize) -> usize {
        SKETCH_PROJECTIONS
    }

    fn fragment(&self, share: &PacketShare) -> Vec<Field32> {
        let sketch = linear_sketch(&self.seed, share.uuid.as_bytes(), &share.data);
        sketch
            .iter()
            .zip(&share.proof)
            .map(|(s, p)| *s - *p)
            .collect()
    }

    fn verdict(&self, _packet: Uuid, own: &[Field32], peer: &[Field32]) -> bool {
        own.len() == SKETCH_PROJECTIONS
            && peer.len() == SKETCH_PROJECTIONS
            && own.iter().zip(peer).all(|(a, b)| *a + *b == Field32::ZERO)
    }
}

/// Why a packet was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Sealed to a packet key this processor does not hold.
    UnknownEncryptionKey,
    Undecryptable,
    /// Decrypted, but not a share of the configured shape.
    MalformedShare,
    /// This processor has no fragment for the packet.
    MissingOwnFragment,
    /// The peer published no fragment for the packet.
    MissingPeerFragment,
    /// Fragments present but the predicate rejects them.
    ProofMismatch,
}

impl RejectReason {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::MissingOwnFragment | Self::MissingPeerFragment => FailureClass::ProtocolMismatch,
            _ => FailureClass::Malformed,
        }
    }
}

/// Where a packet is in the validation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    Decoded,
    AuthenticatedHeader,
    ShareExtracted,
    ValidationShareEmitted,
    ValidationShareReceived,
    Verified,
    Rejected(RejectReason),
}

impl PacketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Rejected(_))
    }

    /// Whether `next` is a legal successor. Any live state may be rejected.
    pub fn can_advance_to(&self, next: PacketState) -> bool {
        use PacketState::*;
        match (self, next) {
            (Verified, _) | (Rejected(_), _) => false,
            (_, Rejected(_)) => true,
            (Decoded, AuthenticatedHeader)
            | (AuthenticatedHeader, ShareExtracted)
            | (ShareExtracted, ValidationShareEmitted)
            | (ValidationShareEmitted, ValidationShareReceived)
            | (ValidationShareReceived, Verified) => true,
            _ => false,
        }
    }
}

/// Per-packet protocol state for one batch.
#[derive(Debug, Clone, Default)]
pub struct PacketLedger {
    states: BTreeMap<Uuid, PacketState>,
}

impl PacketLedger {
    /// Ledger for packets decoded from an authenticated batch.
    pub fn authenticated<'a>(packets: impl IntoIterator<Item = &'a Uuid>) -> Self {
        let states = packets
            .into_iter()
            .map(|uuid| (*uuid, PacketState::AuthenticatedHeader))
            .collect();
        Self { states }
    }

    pub fn state(&self, uuid: &Uuid) -> Option<PacketState> {
        self.states.get(uuid).copied()
    }

    /// Move `uuid` to `next`. Returns false and leaves the state alone when
    /// the packet is unknown or the transition is illegal.
    pub fn advance(&mut self, uuid: Uuid, next: PacketState) -> bool {
        match self.states.get_mut(&uuid) {
            Some(state) if state.can_advance_to(next) => {
                *state = next;
                true
            }
            Some(state) => {
                debug!(packet = %uuid, from = ?state, to = ?next, "ignored illegal packet transition");
                false
            }
            None => false,
        }
    }

    /// Move every packet currently in `from` to `to`.
    pub fn advance_all(&mut self, from: PacketState, to: PacketState) {
        for state in self.states.values_mut() {
            if *state == from && from.can_advance_to(to) {
                *state = to;
            }
        }
    }

    pub fn verified(&self) -> impl Iterator<Item = &Uuid> {
        self.states
            .iter()
            .filter(|(_, s)| **s == PacketState::Verified)
            .map(|(uuid, _)| uuid)
    }

    pub fn valid_count(&self) -> u64 {
        self.verified().count() as u64
    }

    pub fn rejected_count(&self) -> u64 {
        self.states
            .values()
            .filter(|s| matches!(s, PacketState::Rejected(_)))
            .count() as u64
    }

    pub fn rejections(&self) -> BTreeMap<RejectReason, u64> {
        let mut counts = BTreeMap::new();
        for state in self.states.values() {
            if let PacketState::Rejected(reason) = state {
                *counts.entry(*reason).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Packets not yet verified or rejected.
    pub fn unresolved(&self) -> usize {
        self.states.values().filter(|s| !s.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// This processor's packet decryption keys by identifier.
#[derive(Default)]
pub struct PacketKeyring {
    keys: HashMap<String, EncryptionKeypair>,
}

impl PacketKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(identifier: impl Into<String>, keypair: EncryptionKeypair) -> Self {
        let mut ring = Self::new();
        ring.insert(identifier, keypair);
        ring
    }

    pub fn insert(&mut self, identifier: impl Into<String>, keypair: EncryptionKeypair) {
        self.keys.insert(identifier.into(), keypair);
    }

    pub fn get(&self, identifier: &str) -> Option<&EncryptionKeypair> {
        self.keys.get(identifier)
    }
}

/// Open every packet with this processor's key and check its shape.
///
/// Packets that fail are rejected in `ledger`; the rest advance to
/// `ShareExtracted` and are returned.
pub fn extract_shares(
    packets: &[IngestionPacket],
    keys: &PacketKeyring,
    dimension: usize,
    proof_len: usize,
    ledger: &mut PacketLedger,
) -> Vec<PacketShare> {
    let mut shares = Vec::with_capacity(packets.len());
    for packet in packets {
        match open_packet(packet, keys, dimension, proof_len) {
            Ok(share) => {
                ledger.advance(packet.uuid, PacketState::ShareExtracted);
                shares.push(share);
            }
            Err(reason) => {
                debug!(packet = %packet.uuid, ?reason, "packet rejected at extraction");
                ledger.advance(packet.uuid, PacketState::Rejected(reason));
            }
        }
    }
    shares
}

fn open_packet(
    packet: &IngestionPacket,
    keys: &PacketKeyring,
    dimension: usize,
    proof_len: usize,
) -> Result<PacketShare, RejectReason> {
    let keypair = keys
        .get(&packet.encryption_key_id)
        .ok_or(RejectReason::UnknownEncryptionKey)?;
    let plaintext =
        open_sealed(keypair, &packet.encrypted_share).map_err(|_| RejectReason::Undecryptable)?;
    let share: SharePlaintext =
        serde_json::from_slice(&plaintext).map_err(|_| RejectReason::MalformedShare)?;
    if share.data.len() != dimension || share.proof.len() != proof_len {
        return Err(RejectReason::MalformedShare);
    }
    Ok(PacketShare {
        uuid: packet.uuid,
        data: share.data,
        proof: share.proof,
    })
}

/// Decide every extracted packet from both processors' fragments.
///
/// Packets missing a fragment on either side are rejected. Verified packets'
/// shares are returned in UUID order.
pub fn judge<'a>(
    verifier: &dyn ProofVerifier,
    shares: &'a [PacketShare],
    own: &HashMap<Uuid, Vec<Field32>>,
    peer: &HashMap<Uuid, Vec<Field32>>,
    ledger: &mut PacketLedger,
) -> Vec<&'a PacketShare> {
    let mut accepted = Vec::new();
    for share in shares {
        let uuid = share.uuid;
        let Some(own_fragment) = own.get(&uuid) else {
            ledger.advance(uuid, PacketState::Rejected(RejectReason::MissingOwnFragment));
            continue;
        };
        let Some(peer_fragment) = peer.get(&uuid) else {
            ledger.advance(uuid, PacketState::Rejected(RejectReason::MissingPeerFragment));
            continue;
        };
        ledger.advance(uuid, PacketState::ValidationShareReceived);

        if verifier.verdict(uuid, own_fragment, peer_fragment) {
            ledger.advance(uuid, PacketState::Verified);
            accepted.push(share);
        } else {
            ledger.advance(uuid, PacketState::Rejected(RejectReason::ProofMismatch));
        }
    }
    accepted.sort_by_key(|s| s.uuid);
    accepted
}
