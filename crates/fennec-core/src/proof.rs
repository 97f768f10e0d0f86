//! The rollup proof byte layout.
//!
//! A rollup proof is a fixed 1024-byte header followed by a sequence of
//! fixed 256-byte inner proofs, one per user transaction. All integer
//! fields are big-endian and right-aligned in 32-byte words.

use sha2::{
    Digest as _,
    Sha256,
};

use crate::{
    codec::{
        u32_word,
        DecodeError,
        Reader,
    },
    NUM_ASSETS,
    NUM_BRIDGE_CALLS_PER_BLOCK,
    WORD_SIZE,
};

/// Serialized width of one inner proof.
pub const INNER_PROOF_SIZE: usize = 8 * WORD_SIZE;

/// Serialized width of the rollup proof header.
pub const ROLLUP_HEADER_SIZE: usize =
    (3 + 4 + NUM_BRIDGE_CALLS_PER_BLOCK + NUM_ASSETS + NUM_BRIDGE_CALLS_PER_BLOCK + 1) * WORD_SIZE;

/// Discriminates what an inner proof does. `Padding` rows fill a rollup to
/// its fixed size and are skipped by every consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProofId {
    Padding = 0,
    Deposit = 1,
    Withdraw = 2,
    Send = 3,
    Account = 4,
    DefiDeposit = 5,
    DefiClaim = 6,
}

impl ProofId {
    /// # Errors
    /// Returns the raw value if it is not a known proof id.
    pub fn from_u32(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(Self::Padding),
            1 => Ok(Self::Deposit),
            2 => Ok(Self::Withdraw),
            3 => Ok(Self::Send),
            4 => Ok(Self::Account),
            5 => Ok(Self::DefiDeposit),
            6 => Ok(Self::DefiClaim),
            other => Err(other),
        }
    }
}

/// The transaction category recorded on relational tx rows. Derives 1:1
/// from non-padding proof ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Deposit,
    Withdraw,
    Transfer,
    Account,
    DefiDeposit,
    DefiClaim,
}

impl TxType {
    /// # Errors
    /// Returns `None` for padding proofs, which have no transaction.
    #[must_use]
    pub fn from_proof_id(id: ProofId) -> Option<Self> {
        match id {
            ProofId::Padding => None,
            ProofId::Deposit => Some(Self::Deposit),
            ProofId::Withdraw => Some(Self::Withdraw),
            ProofId::Send => Some(Self::Transfer),
            ProofId::Account => Some(Self::Account),
            ProofId::DefiDeposit => Some(Self::DefiDeposit),
            ProofId::DefiClaim => Some(Self::DefiClaim),
        }
    }
}

/// One user transaction's public data inside a rollup proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerProofData {
    pub proof_id: ProofId,
    pub public_value: u128,
    pub public_asset_id: u32,
    pub tx_fee: u128,
    pub note_commitment1: [u8; 32],
    pub note_commitment2: [u8; 32],
    pub nullifier1: [u8; 32],
    pub nullifier2: [u8; 32],
}

impl InnerProofData {
    /// A fully-zeroed padding row.
    #[must_use]
    pub fn padding() -> Self {
        Self {
            proof_id: ProofId::Padding,
            public_value: 0,
            public_asset_id: 0,
            tx_fee: 0,
            note_commitment1: [0u8; 32],
            note_commitment2: [0u8; 32],
            nullifier1: [0u8; 32],
            nullifier2: [0u8; 32],
        }
    }

    #[must_use]
    pub fn is_padding(&self) -> bool {
        self.proof_id == ProofId::Padding
    }

    /// The unique transaction id: the hash of the serialized proof.
    #[must_use]
    pub fn tx_id(&self) -> [u8; 32] {
        Sha256::digest(self.to_bytes()).into()
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INNER_PROOF_SIZE);
        buf.extend_from_slice(&u32_word(self.proof_id as u32));
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&self.public_value.to_be_bytes());
        buf.extend_from_slice(&u32_word(self.public_asset_id));
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&self.tx_fee.to_be_bytes());
        buf.extend_from_slice(&self.note_commitment1);
        buf.extend_from_slice(&self.note_commitment2);
        buf.extend_from_slice(&self.nullifier1);
        buf.extend_from_slice(&self.nullifier2);
        buf
    }

    /// # Errors
    /// Returns an error on short input or an unknown proof id.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofDecodeError> {
        let mut reader = Reader::new(bytes);
        let proof = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(proof)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, ProofDecodeError> {
        let proof_id_raw = reader.u32_word()?;
        let proof_id =
            ProofId::from_u32(proof_id_raw).map_err(ProofDecodeError::UnknownProofId)?;
        reader.take(16)?;
        let public_value = reader.u128_be()?;
        let public_asset_id = reader.u32_word()?;
        reader.take(16)?;
        let tx_fee = reader.u128_be()?;
        Ok(Self {
            proof_id,
            public_value,
            public_asset_id,
            tx_fee,
            note_commitment1: reader.word()?,
            note_commitment2: reader.word()?,
            nullifier1: reader.word()?,
            nullifier2: reader.word()?,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProofDecodeError {
    #[error(transparent)]
    Codec(#[from] DecodeError),
    #[error("unknown proof id {0}")]
    UnknownProofId(u32),
}

/// The decoded rollup proof: the header fields published on-chain plus the
/// inner proofs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupProofData {
    pub rollup_id: u64,
    pub rollup_size: u32,
    pub data_start_index: u64,
    pub new_data_root: [u8; 32],
    pub new_null_root: [u8; 32],
    pub new_data_roots_root: [u8; 32],
    pub new_defi_root: [u8; 32],
    pub bridge_ids: [[u8; 32]; NUM_BRIDGE_CALLS_PER_BLOCK],
    pub asset_ids: [u32; NUM_ASSETS],
    pub defi_interaction_notes: [[u8; 32]; NUM_BRIDGE_CALLS_PER_BLOCK],
    pub inner_proofs: Vec<InnerProofData>,
}

impl RollupProofData {
    /// The unique identifier of the on-chain rollup: the hash of the
    /// serialized header. Two competing rollups at the same rollup id hash
    /// differently because their roots differ.
    #[must_use]
    pub fn rollup_hash(&self) -> [u8; 32] {
        Sha256::digest(self.header_bytes()).into()
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ROLLUP_HEADER_SIZE);
        buf.extend_from_slice(&u32_word(
            u32::try_from(self.rollup_id).unwrap_or(u32::MAX),
        ));
        buf.extend_from_slice(&u32_word(self.rollup_size));
        buf.extend_from_slice(&u32_word(
            u32::try_from(self.data_start_index).unwrap_or(u32::MAX),
        ));
        buf.extend_from_slice(&self.new_data_root);
        buf.extend_from_slice(&self.new_null_root);
        buf.extend_from_slice(&self.new_data_roots_root);
        buf.extend_from_slice(&self.new_defi_root);
        for bridge_id in &self.bridge_ids {
            buf.extend_from_slice(bridge_id);
        }
        for asset_id in &self.asset_ids {
            buf.extend_from_slice(&u32_word(*asset_id));
        }
        for note in &self.defi_interaction_notes {
            buf.extend_from_slice(note);
        }
        buf.extend_from_slice(&u32_word(
            u32::try_from(self.inner_proofs.len()).unwrap_or(u32::MAX),
        ));
        buf
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.header_bytes();
        buf.reserve(self.inner_proofs.len() * INNER_PROOF_SIZE);
        for proof in &self.inner_proofs {
            buf.extend_from_slice(&proof.to_bytes());
        }
        buf
    }

    /// Decodes a rollup proof, bit-exact with [`RollupProofData::to_bytes`].
    ///
    /// # Errors
    /// Returns an error on truncated input, trailing bytes, or an inner
    /// proof count that disagrees with the input length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofDecodeError> {
        let mut reader = Reader::new(bytes);
        let rollup_id = u64::from(reader.u32_word()?);
        let rollup_size = reader.u32_word()?;
        let data_start_index = u64::from(reader.u32_word()?);
        let new_data_root = reader.word()?;
        let new_null_root = reader.word()?;
        let new_data_roots_root = reader.word()?;
        let new_defi_root = reader.word()?;
        let mut bridge_ids = [[0u8; 32]; NUM_BRIDGE_CALLS_PER_BLOCK];
        for bridge_id in &mut bridge_ids {
            *bridge_id = reader.word()?;
        }
        let mut asset_ids = [0u32; NUM_ASSETS];
        for asset_id in &mut asset_ids {
            *asset_id = reader.u32_word()?;
        }
        let mut defi_interaction_notes = [[0u8; 32]; NUM_BRIDGE_CALLS_PER_BLOCK];
        for note in &mut defi_interaction_notes {
            *note = reader.word()?;
        }
        let num_inner = reader.u32_word()?;
        if reader.remaining() != num_inner as usize * INNER_PROOF_SIZE {
            return Err(DecodeError::BadProofCount {
                count: num_inner,
                remaining: reader.remaining(),
            }
            .into());
        }
        let mut inner_proofs = Vec::with_capacity(num_inner as usize);
        for _ in 0..num_inner {
            inner_proofs.push(InnerProofData::read(&mut reader)?);
        }
        reader.finish()?;
        Ok(Self {
            rollup_id,
            rollup_size,
            data_start_index,
            new_data_root,
            new_null_root,
            new_data_roots_root,
            new_defi_root,
            bridge_ids,
            asset_ids,
            defi_interaction_notes,
            inner_proofs,
        })
    }

    /// Iterates non-padding inner proofs with their position in the rollup.
    pub fn real_proofs(&self) -> impl Iterator<Item = (usize, &InnerProofData)> {
        self.inner_proofs
            .iter()
            .enumerate()
            .filter(|(_, proof)| !proof.is_padding())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UNUSED_ASSET_ID;

    pub(crate) fn inner_proof(proof_id: ProofId, seed: u8) -> InnerProofData {
        InnerProofData {
            proof_id,
            public_value: u128::from(seed) * 1000,
            public_asset_id: u32::from(seed % 3),
            tx_fee: u128::from(seed),
            note_commitment1: [seed; 32],
            note_commitment2: [seed.wrapping_add(1); 32],
            nullifier1: [seed.wrapping_add(2); 32],
            nullifier2: [seed.wrapping_add(3); 32],
        }
    }

    fn proof_data() -> RollupProofData {
        let mut asset_ids = [UNUSED_ASSET_ID; NUM_ASSETS];
        asset_ids[0] = 0;
        asset_ids[1] = 2;
        RollupProofData {
            rollup_id: 5,
            rollup_size: 4,
            data_start_index: 40,
            new_data_root: [1; 32],
            new_null_root: [2; 32],
            new_data_roots_root: [3; 32],
            new_defi_root: [4; 32],
            bridge_ids: [[7; 32], [8; 32], [0; 32], [0; 32]],
            asset_ids,
            defi_interaction_notes: [[0; 32]; NUM_BRIDGE_CALLS_PER_BLOCK],
            inner_proofs: vec![
                inner_proof(ProofId::Deposit, 10),
                inner_proof(ProofId::Send, 20),
                InnerProofData::padding(),
                InnerProofData::padding(),
            ],
        }
    }

    #[test]
    fn rollup_proof_round_trips() {
        let proof = proof_data();
        let bytes = proof.to_bytes();
        assert_eq!(
            ROLLUP_HEADER_SIZE + 4 * INNER_PROOF_SIZE,
            bytes.len(),
            "serialized size must be fixed by the layout"
        );
        assert_eq!(proof, RollupProofData::from_bytes(&bytes).unwrap());
    }

    #[test]
    fn rollup_hash_commits_to_the_roots() {
        let proof = proof_data();
        let mut competitor = proof.clone();
        competitor.new_data_root = [99; 32];
        assert_ne!(proof.rollup_hash(), competitor.rollup_hash());
    }

    #[test]
    fn rollup_hash_ignores_inner_proof_bodies() {
        // The header pins the count; the hash identifies the on-chain
        // rollup, not the tx payloads.
        let proof = proof_data();
        let mut same_header = proof.clone();
        same_header.inner_proofs[0].tx_fee += 1;
        assert_eq!(proof.rollup_hash(), same_header.rollup_hash());
    }

    #[test]
    fn padding_is_skipped_by_real_proofs() {
        let proof = proof_data();
        let positions: Vec<usize> = proof.real_proofs().map(|(i, _)| i).collect();
        assert_eq!(vec![0, 1], positions);
    }

    #[test]
    fn truncated_proof_is_rejected() {
        let bytes = proof_data().to_bytes();
        assert!(RollupProofData::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn proof_count_must_match_input_length() {
        let mut bytes = proof_data().to_bytes();
        bytes.extend_from_slice(&[0u8; 1]);
        assert!(matches!(
            RollupProofData::from_bytes(&bytes),
            Err(ProofDecodeError::Codec(DecodeError::BadProofCount { .. })),
        ));
    }

    #[test]
    fn inner_proof_round_trips() {
        let proof = inner_proof(ProofId::DefiDeposit, 42);
        assert_eq!(
            proof,
            InnerProofData::from_bytes(&proof.to_bytes()).unwrap()
        );
    }

    #[test]
    fn tx_ids_are_distinct_per_proof() {
        assert_ne!(
            inner_proof(ProofId::Deposit, 1).tx_id(),
            inner_proof(ProofId::Deposit, 2).tx_id(),
        );
    }
}
