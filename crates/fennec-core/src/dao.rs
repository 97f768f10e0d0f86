//! Relational row types persisted by the sequencer.
//!
//! Links between rows run child to parent by id only: a rollup proof lists
//! its tx ids, a rollup names its proof hash. Loading the other direction
//! is an eager query, never an owning reference, so no row graph cycles
//! exist.

use crate::proof::TxType;

/// A user transaction awaiting or included in a rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDao {
    /// Hash of the inner proof; primary key.
    pub id: [u8; 32],
    /// The serialized inner proof.
    pub proof_data: Vec<u8>,
    /// Off-chain payload published with the proof.
    pub offchain_tx_data: Vec<u8>,
    pub nullifier1: Option<[u8; 32]>,
    pub nullifier2: Option<[u8; 32]>,
    /// Unix milliseconds the tx entered the pool.
    pub created: u64,
    /// Unix milliseconds the containing rollup was mined.
    pub mined: Option<u64>,
    pub tx_type: TxType,
    pub excess_gas: u64,
}

/// A rollup proof either produced by the local pipeline (tentative) or
/// rebuilt from an on-chain competitor rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupProofDao {
    /// Primary key; unique across providers even at equal rollup ids.
    pub rollup_hash: [u8; 32],
    pub tx_ids: Vec<[u8; 32]>,
    pub rollup_size: u32,
    pub data_start_index: u64,
    pub proof_data: Vec<u8>,
    pub created: u64,
}

/// A rollup row. Settled once `mined` is set; unsettled rows are swept at
/// recovery and reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupDao {
    /// The rollup id; primary key.
    pub id: u64,
    pub data_root: [u8; 32],
    pub rollup_proof_hash: [u8; 32],
    pub eth_tx_hash: Option<[u8; 32]>,
    pub created: u64,
    pub mined: Option<u64>,
    /// Packed interaction result notes, in slot order.
    pub interaction_result: Vec<u8>,
    pub gas_used: Option<u64>,
    pub gas_price: Option<[u8; 32]>,
    pub asset_metrics: Vec<AssetMetricsDao>,
}

impl RollupDao {
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.mined.is_some()
    }
}

/// A pending defi output awaiting its claim proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimDao {
    /// Index of the claim note leaf in the data tree; primary key.
    pub leaf_index: u64,
    pub nullifier: [u8; 32],
    pub bridge_id: [u8; 32],
    pub deposit_value: u128,
    pub partial_state: [u8; 32],
    pub partial_state_secret_eph_pub_key: [u8; 64],
    pub input_nullifier: [u8; 32],
    pub interaction_nonce: u64,
    pub fee: u128,
    pub created: u64,
    /// Unix milliseconds the claim proof was mined.
    pub claimed: Option<u64>,
    /// Rollup id whose interaction result settled this claim's nonce.
    pub interaction_result_rollup_id: Option<u64>,
}

/// An account registered in the data tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDao {
    pub alias_hash: [u8; 32],
    pub account_public_key: [u8; 64],
    pub nonce: u32,
}

/// Cumulative per-asset flow totals, snapshotted per rollup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssetMetricsDao {
    pub rollup_id: u64,
    pub asset_id: u32,
    pub contract_balance: u128,
    pub total_deposited: u128,
    pub total_withdrawn: u128,
    pub total_defi_deposited: u128,
    pub total_defi_claimed: u128,
    pub total_fees: u128,
}
