//! Defi bridge interaction data: the per-rollup interaction notes settled
//! on-chain and the off-chain payload attached to defi deposit proofs.

use sha2::{
    Digest as _,
    Sha256,
};

use crate::codec::{
    DecodeError,
    Reader,
};

/// Serialized width of a [`DefiInteractionNote`].
pub const INTERACTION_NOTE_SIZE: usize = 32 + 4 + 16 + 16 + 16 + 1;

/// Serialized width of an [`OffchainDefiDepositData`] blob.
pub const OFFCHAIN_DEFI_DEPOSIT_SIZE: usize = 32 + 32 + 64 + 16 + 16;

/// A bridge id is an opaque 32-byte identifier with the asset slots of the
/// bridge call packed into its low words: bytes `16..20` carry output
/// asset B, `20..24` output asset A, `24..28` the input asset, and
/// `28..32` the bridge address id, all big-endian.
pub type BridgeId = [u8; 32];

fn slot(bridge_id: &BridgeId, offset: usize) -> u32 {
    u32::from_be_bytes([
        bridge_id[offset],
        bridge_id[offset + 1],
        bridge_id[offset + 2],
        bridge_id[offset + 3],
    ])
}

#[must_use]
pub fn bridge_address_id(bridge_id: &BridgeId) -> u32 {
    slot(bridge_id, 28)
}

#[must_use]
pub fn bridge_input_asset_id(bridge_id: &BridgeId) -> u32 {
    slot(bridge_id, 24)
}

#[must_use]
pub fn bridge_output_asset_id_a(bridge_id: &BridgeId) -> u32 {
    slot(bridge_id, 20)
}

#[must_use]
pub fn bridge_output_asset_id_b(bridge_id: &BridgeId) -> u32 {
    slot(bridge_id, 16)
}

/// The settled result of one bridge interaction, delivered in a block's
/// interaction result list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DefiInteractionNote {
    pub bridge_id: BridgeId,
    pub nonce: u32,
    pub total_input_value: u128,
    pub total_output_value_a: u128,
    pub total_output_value_b: u128,
    pub result: bool,
}

impl DefiInteractionNote {
    /// The canonical zero note marks an unused interaction slot and is
    /// skipped when populating the defi tree.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// The leaf committed into the defi tree for this interaction.
    #[must_use]
    pub fn commitment(&self) -> [u8; 32] {
        Sha256::digest(self.to_bytes()).into()
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INTERACTION_NOTE_SIZE);
        buf.extend_from_slice(&self.bridge_id);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.total_input_value.to_be_bytes());
        buf.extend_from_slice(&self.total_output_value_a.to_be_bytes());
        buf.extend_from_slice(&self.total_output_value_b.to_be_bytes());
        buf.push(u8::from(self.result));
        buf
    }

    /// # Errors
    /// Returns an error if the input is not exactly
    /// [`INTERACTION_NOTE_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let note = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(note)
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            bridge_id: reader.word()?,
            nonce: reader.u32_be()?,
            total_input_value: reader.u128_be()?,
            total_output_value_a: reader.u128_be()?,
            total_output_value_b: reader.u128_be()?,
            result: reader.bool()?,
        })
    }
}

/// The off-chain payload published alongside a defi deposit proof. The
/// sequencer reads it to derive the pending claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffchainDefiDepositData {
    pub bridge_id: BridgeId,
    pub partial_state: [u8; 32],
    pub partial_state_secret_eph_pub_key: [u8; 64],
    pub deposit_value: u128,
    pub tx_fee: u128,
}

impl OffchainDefiDepositData {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OFFCHAIN_DEFI_DEPOSIT_SIZE);
        buf.extend_from_slice(&self.bridge_id);
        buf.extend_from_slice(&self.partial_state);
        buf.extend_from_slice(&self.partial_state_secret_eph_pub_key);
        buf.extend_from_slice(&self.deposit_value.to_be_bytes());
        buf.extend_from_slice(&self.tx_fee.to_be_bytes());
        buf
    }

    /// # Errors
    /// Returns an error if the input is not exactly
    /// [`OFFCHAIN_DEFI_DEPOSIT_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let bridge_id = reader.word()?;
        let partial_state = reader.word()?;
        let key_bytes = reader.take(64)?;
        let mut partial_state_secret_eph_pub_key = [0u8; 64];
        partial_state_secret_eph_pub_key.copy_from_slice(key_bytes);
        let deposit_value = reader.u128_be()?;
        let tx_fee = reader.u128_be()?;
        reader.finish()?;
        Ok(Self {
            bridge_id,
            partial_state,
            partial_state_secret_eph_pub_key,
            deposit_value,
            tx_fee,
        })
    }
}

/// Packs interaction notes into the byte column stored on rollup rows.
#[must_use]
pub fn pack_interaction_notes(notes: &[DefiInteractionNote]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(notes.len() * INTERACTION_NOTE_SIZE);
    for note in notes {
        buf.extend_from_slice(&note.to_bytes());
    }
    buf
}

/// Unpacks the byte column written by [`pack_interaction_notes`].
///
/// # Errors
/// Returns an error if the input is not a whole number of notes.
pub fn unpack_interaction_notes(bytes: &[u8]) -> Result<Vec<DefiInteractionNote>, DecodeError> {
    if bytes.len() % INTERACTION_NOTE_SIZE != 0 {
        return Err(DecodeError::TrailingBytes(bytes.len() % INTERACTION_NOTE_SIZE));
    }
    bytes
        .chunks_exact(INTERACTION_NOTE_SIZE)
        .map(DefiInteractionNote::from_bytes)
        .collect()
}

/// Builds a bridge id from its packed slots.
#[must_use]
pub fn bridge_id_from_slots(
    address_id: u32,
    input_asset_id: u32,
    output_asset_id_a: u32,
    output_asset_id_b: u32,
) -> BridgeId {
    let mut bridge_id = [0u8; 32];
    bridge_id[16..20].copy_from_slice(&output_asset_id_b.to_be_bytes());
    bridge_id[20..24].copy_from_slice(&output_asset_id_a.to_be_bytes());
    bridge_id[24..28].copy_from_slice(&input_asset_id.to_be_bytes());
    bridge_id[28..32].copy_from_slice(&address_id.to_be_bytes());
    bridge_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note() -> DefiInteractionNote {
        DefiInteractionNote {
            bridge_id: bridge_id_from_slots(3, 0, 1, 2),
            nonce: 11,
            total_input_value: 500,
            total_output_value_a: 450,
            total_output_value_b: 0,
            result: true,
        }
    }

    #[test]
    fn interaction_note_round_trips() {
        let note = note();
        let bytes = note.to_bytes();
        assert_eq!(INTERACTION_NOTE_SIZE, bytes.len());
        assert_eq!(note, DefiInteractionNote::from_bytes(&bytes).unwrap());
    }

    #[test]
    fn zero_note_is_canonical() {
        assert!(DefiInteractionNote::default().is_zero());
        assert!(!note().is_zero());
    }

    #[test]
    fn bridge_slots_unpack() {
        let bridge_id = bridge_id_from_slots(7, 2, 5, 6);
        assert_eq!(7, bridge_address_id(&bridge_id));
        assert_eq!(2, bridge_input_asset_id(&bridge_id));
        assert_eq!(5, bridge_output_asset_id_a(&bridge_id));
        assert_eq!(6, bridge_output_asset_id_b(&bridge_id));
    }

    #[test]
    fn packed_notes_round_trip() {
        let notes = vec![note(), DefiInteractionNote::default()];
        let packed = pack_interaction_notes(&notes);
        assert_eq!(notes, unpack_interaction_notes(&packed).unwrap());
        assert!(unpack_interaction_notes(&packed[1..]).is_err());
    }

    #[test]
    fn offchain_defi_deposit_round_trips() {
        let data = OffchainDefiDepositData {
            bridge_id: bridge_id_from_slots(1, 0, 0, 0),
            partial_state: [5; 32],
            partial_state_secret_eph_pub_key: [6; 64],
            deposit_value: 10_000,
            tx_fee: 10,
        };
        let bytes = data.to_bytes();
        assert_eq!(OFFCHAIN_DEFI_DEPOSIT_SIZE, bytes.len());
        assert_eq!(data, OffchainDefiDepositData::from_bytes(&bytes).unwrap());
    }
}
