//! The settled block the synchronizer consumes from the chain source and
//! serves back to clients through the block cache.

use crate::{
    codec::{
        DecodeError,
        Reader,
    },
    defi::DefiInteractionNote,
};

/// A rollup settled on-chain, ordered by `rollup_id` starting at 0.
///
/// `rollup_proof_data` decodes into
/// [`crate::proof::RollupProofData`]; `offchain_tx_data` carries one blob
/// per non-padding inner proof, indexed by off-chain position rather than
/// inner-proof position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub rollup_id: u64,
    /// Unix milliseconds of the chain block that mined the rollup.
    pub created: u64,
    pub eth_tx_hash: [u8; 32],
    pub rollup_size: u32,
    pub rollup_proof_data: Vec<u8>,
    pub offchain_tx_data: Vec<Vec<u8>>,
    pub interaction_result: Vec<DefiInteractionNote>,
    pub gas_used: u64,
    pub gas_price: [u8; 32],
}

impl Block {
    /// Serializes the block to the buffer format served to catching-up
    /// clients.
    #[must_use]
    pub fn to_buf(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.rollup_id.to_be_bytes());
        buf.extend_from_slice(&self.created.to_be_bytes());
        buf.extend_from_slice(&self.eth_tx_hash);
        buf.extend_from_slice(&self.rollup_size.to_be_bytes());
        buf.extend_from_slice(&self.gas_used.to_be_bytes());
        buf.extend_from_slice(&self.gas_price);
        write_bytes(&mut buf, &self.rollup_proof_data);
        write_len(&mut buf, self.offchain_tx_data.len());
        for blob in &self.offchain_tx_data {
            write_bytes(&mut buf, blob);
        }
        write_len(&mut buf, self.interaction_result.len());
        for note in &self.interaction_result {
            buf.extend_from_slice(&note.to_bytes());
        }
        buf
    }

    /// Decodes a block buffer, bit-exact with [`Block::to_buf`].
    ///
    /// # Errors
    /// Returns an error on truncated input or trailing bytes.
    pub fn from_buf(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let rollup_id = reader.u64_be()?;
        let created = reader.u64_be()?;
        let eth_tx_hash = reader.word()?;
        let rollup_size = reader.u32_be()?;
        let gas_used = reader.u64_be()?;
        let gas_price = reader.word()?;
        let rollup_proof_data = read_bytes(&mut reader)?;
        let num_offchain = reader.u32_be()?;
        let mut offchain_tx_data = Vec::with_capacity(num_offchain as usize);
        for _ in 0..num_offchain {
            offchain_tx_data.push(read_bytes(&mut reader)?);
        }
        let num_interactions = reader.u32_be()?;
        let mut interaction_result = Vec::with_capacity(num_interactions as usize);
        for _ in 0..num_interactions {
            interaction_result.push(DefiInteractionNote::read(&mut reader)?);
        }
        reader.finish()?;
        Ok(Self {
            rollup_id,
            created,
            eth_tx_hash,
            rollup_size,
            rollup_proof_data,
            offchain_tx_data,
            interaction_result,
            gas_used,
            gas_price,
        })
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&u32::try_from(len).unwrap_or(u32::MAX).to_be_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_len(buf, bytes.len());
    buf.extend_from_slice(bytes);
}

fn read_bytes(reader: &mut Reader<'_>) -> Result<Vec<u8>, DecodeError> {
    let len = reader.u32_be()? as usize;
    Ok(reader.take(len)?.to_vec())
}
