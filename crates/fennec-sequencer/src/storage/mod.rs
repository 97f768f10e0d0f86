//! The relational store boundary: durable records for transactions,
//! rollup proofs, settled rollups, claims, accounts, and asset metrics.

use async_trait::async_trait;
use fennec_core::dao::{
    AccountDao,
    AssetMetricsDao,
    ClaimDao,
    RollupDao,
    RollupProofDao,
    TxDao,
};

mod memory;

pub use memory::MemoryStore;

/// A rollup proof row, optionally loaded with its transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupProof {
    pub proof: RollupProofDao,
    /// Populated only when requested; ordered as the proof's tx ids.
    pub txs: Vec<TxDao>,
}

/// Everything `confirm_mined` needs to settle a rollup row, including the
/// header fields required to rebuild the row if the pipeline crashed
/// between its proof write and its rollup write.
#[derive(Debug, Clone)]
pub struct MinedRollup {
    pub id: u64,
    pub rollup_proof_hash: [u8; 32],
    pub data_root: [u8; 32],
    pub gas_used: u64,
    pub gas_price: [u8; 32],
    pub mined_at: u64,
    pub eth_tx_hash: [u8; 32],
    /// Packed interaction result notes, in slot order.
    pub interaction_result: Vec<u8>,
    pub tx_ids: Vec<[u8; 32]>,
    pub asset_metrics: Vec<AssetMetricsDao>,
}

/// The narrow query set the synchronizer and pipeline consume.
///
/// Each call is atomic. A settled rollup is one with `mined` set; a rollup
/// proof is orphaned iff no rollup row references it; a transaction is
/// pending iff it is unmined and no rollup proof references it.
#[async_trait]
pub trait RollupStore: Send + Sync {
    /// One more than the highest settled rollup id, or 0 if none.
    async fn get_next_rollup_id(&self) -> eyre::Result<u64>;

    /// Settled rollups with `id >= from`, ordered by id.
    async fn get_settled_rollups(&self, from: u64) -> eyre::Result<Vec<RollupDao>>;

    async fn get_rollup(&self, id: u64) -> eyre::Result<Option<RollupDao>>;

    async fn get_rollup_proof(
        &self,
        rollup_hash: &[u8; 32],
        include_txs: bool,
    ) -> eyre::Result<Option<RollupProof>>;

    /// Upserts a rollup proof together with any transactions it carries
    /// that are not yet stored.
    async fn add_rollup_proof(&self, proof: RollupProofDao, txs: Vec<TxDao>)
        -> eyre::Result<()>;

    async fn add_rollup(&self, rollup: RollupDao) -> eyre::Result<()>;

    /// Settles the rollup row (creating it if missing), marks its txs
    /// mined, and records the asset metrics snapshot.
    async fn confirm_mined(&self, mined: MinedRollup) -> eyre::Result<RollupDao>;

    async fn delete_unsettled_rollups(&self) -> eyre::Result<()>;

    async fn delete_orphaned_rollup_proofs(&self) -> eyre::Result<()>;

    async fn delete_pending_txs(&self) -> eyre::Result<()>;

    /// Pending transactions in pool-entry order.
    async fn get_pending_txs(&self, limit: usize) -> eyre::Result<Vec<TxDao>>;

    async fn add_claim(&self, claim: ClaimDao) -> eyre::Result<()>;

    /// Marks the claim spending `nullifier` as claimed at `mined_at`.
    async fn confirm_claimed(&self, nullifier: &[u8; 32], mined_at: u64) -> eyre::Result<()>;

    /// Records the rollup that settled the interaction `nonce` on every
    /// claim awaiting it.
    async fn update_claims_with_result_rollup_id(
        &self,
        nonce: u64,
        rollup_id: u64,
    ) -> eyre::Result<()>;

    async fn add_accounts(&self, accounts: Vec<AccountDao>) -> eyre::Result<()>;

    /// The most recent metrics snapshot for `asset_id`.
    async fn get_asset_metrics(&self, asset_id: u32) -> eyre::Result<Option<AssetMetricsDao>>;
}
