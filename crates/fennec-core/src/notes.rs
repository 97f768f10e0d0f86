//! The note-hashing boundary.
//!
//! Claim note commitments and nullifiers must match the circuits that
//! verify them, so the hasher is a capability the sequencer is handed, not
//! something it owns. [`Sha256NoteAlgorithms`] is the default used by dev
//! mode and tests; production injects the circuit-matching implementation.

use sha2::{
    Digest as _,
    Sha256,
};

/// The public inputs of a pending claim note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimNoteData {
    pub deposit_value: u128,
    pub bridge_id: [u8; 32],
    pub partial_state: [u8; 32],
    pub input_nullifier: [u8; 32],
    pub interaction_nonce: u64,
    pub fee: u128,
}

pub trait NoteAlgorithms: Send + Sync {
    /// The commitment of the claim note inserted into the data tree.
    fn claim_note_partial_commitment(&self, note: &ClaimNoteData) -> [u8; 32];

    /// The nullifier spent when the claim is redeemed.
    fn claim_note_nullifier(&self, note_commitment: &[u8; 32]) -> [u8; 32];
}

/// SHA-256 stand-in for the circuit hashers, domain-separated per use.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256NoteAlgorithms;

impl NoteAlgorithms for Sha256NoteAlgorithms {
    fn claim_note_partial_commitment(&self, note: &ClaimNoteData) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"fennec.claim_note");
        hasher.update(note.deposit_value.to_be_bytes());
        hasher.update(note.bridge_id);
        hasher.update(note.partial_state);
        hasher.update(note.input_nullifier);
        hasher.update(note.interaction_nonce.to_be_bytes());
        hasher.update(note.fee.to_be_bytes());
        hasher.finalize().into()
    }

    fn claim_note_nullifier(&self, note_commitment: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"fennec.claim_nullifier");
        hasher.update(note_commitment);
        hasher.finalize().into()
    }
}
