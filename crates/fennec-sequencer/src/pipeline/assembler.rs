//! The rollup proof construction boundary.
//!
//! Real proof construction runs in an external prover; the pipeline only
//! fixes what an assembler receives and what it must leave behind: the
//! staged tree writes whose roots the proof header publishes.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::{
    ensure,
    eyre,
    WrapErr as _,
};
use fennec_core::{
    dao::TxDao,
    defi::OffchainDefiDepositData,
    proof::{
        InnerProofData,
        ProofId,
        RollupProofData,
    },
    NUM_ASSETS,
    NUM_BRIDGE_CALLS_PER_BLOCK,
    UNUSED_ASSET_ID,
};

use crate::trees::{
    stage_rollup_leaves,
    TreeStore,
    TreeTag,
};

/// A constructed rollup ready to publish. The assembler has staged the
/// rollup's tree writes; they are committed only once the published block
/// comes back with matching roots.
#[derive(Debug, Clone)]
pub struct AssembledRollup {
    pub proof_data: RollupProofData,
    pub offchain_tx_data: Vec<Vec<u8>>,
}

#[async_trait]
pub trait RollupAssembler: Send + Sync {
    /// Builds the rollup proof for `txs` at `rollup_id`, staging its tree
    /// effects on `trees`.
    async fn assemble(
        &self,
        rollup_id: u64,
        txs: &[TxDao],
        trees: &Arc<dyn TreeStore>,
    ) -> eyre::Result<AssembledRollup>;
}

/// The dev-mode assembler: decodes each transaction's inner proof, stages
/// the tree writes, and wraps the staged roots in a header. No proving
/// happens; production injects the circuit-backed assembler.
pub struct LocalRollupAssembler {
    rollup_size: u32,
}

impl LocalRollupAssembler {
    #[must_use]
    pub fn new(rollup_size: u32) -> Self {
        Self {
            rollup_size,
        }
    }
}

#[async_trait]
impl RollupAssembler for LocalRollupAssembler {
    async fn assemble(
        &self,
        rollup_id: u64,
        txs: &[TxDao],
        trees: &Arc<dyn TreeStore>,
    ) -> eyre::Result<AssembledRollup> {
        ensure!(!txs.is_empty(), "refusing to assemble an empty rollup");
        ensure!(
            txs.len() <= self.rollup_size as usize,
            "{} txs exceed the rollup size {}",
            txs.len(),
            self.rollup_size,
        );

        let data_start_index = trees.get_size(TreeTag::Data).await;
        let mut inner_proofs = Vec::with_capacity(self.rollup_size as usize);
        let mut offchain_tx_data = Vec::with_capacity(txs.len());
        let mut bridge_ids = [[0u8; 32]; NUM_BRIDGE_CALLS_PER_BLOCK];
        let mut num_bridges = 0;
        let mut asset_ids = [UNUSED_ASSET_ID; NUM_ASSETS];
        let mut num_assets = 0;

        for tx in txs {
            let proof = InnerProofData::from_bytes(&tx.proof_data)
                .wrap_err("pooled tx carries an undecodable inner proof")?;
            match proof.proof_id {
                ProofId::Deposit | ProofId::Withdraw | ProofId::Send => {
                    let asset_id = proof.public_asset_id;
                    if !asset_ids[..num_assets].contains(&asset_id) {
                        ensure!(num_assets < NUM_ASSETS, "rollup exceeds {NUM_ASSETS} assets");
                        asset_ids[num_assets] = asset_id;
                        num_assets += 1;
                    }
                }
                ProofId::DefiDeposit => {
                    let offchain = OffchainDefiDepositData::from_bytes(&tx.offchain_tx_data)
                        .wrap_err("defi deposit tx carries an undecodable off-chain payload")?;
                    if !bridge_ids[..num_bridges].contains(&offchain.bridge_id) {
                        ensure!(
                            num_bridges < NUM_BRIDGE_CALLS_PER_BLOCK,
                            "rollup exceeds {NUM_BRIDGE_CALLS_PER_BLOCK} bridge calls",
                        );
                        bridge_ids[num_bridges] = offchain.bridge_id;
                        num_bridges += 1;
                    }
                }
                ProofId::Account | ProofId::DefiClaim => {}
                ProofId::Padding => {
                    return Err(eyre!("padding proofs must not enter the tx pool"));
                }
            }
            offchain_tx_data.push(tx.offchain_tx_data.clone());
            inner_proofs.push(proof);
        }
        inner_proofs.resize_with(self.rollup_size as usize, InnerProofData::padding);

        let defi_interaction_notes = [[0u8; 32]; NUM_BRIDGE_CALLS_PER_BLOCK];
        stage_rollup_leaves(
            trees.as_ref(),
            rollup_id,
            data_start_index,
            &inner_proofs,
            &defi_interaction_notes,
        )
        .await
        .wrap_err("failed staging rollup leaves")?;

        let proof_data = RollupProofData {
            rollup_id,
            rollup_size: self.rollup_size,
            data_start_index,
            new_data_root: trees.get_root(TreeTag::Data).await,
            new_null_root: trees.get_root(TreeTag::Null).await,
            new_data_roots_root: trees.get_root(TreeTag::Root).await,
            new_defi_root: trees.get_root(TreeTag::Defi).await,
            bridge_ids,
            asset_ids,
            defi_interaction_notes,
            inner_proofs,
        };
        Ok(AssembledRollup {
            proof_data,
            offchain_tx_data,
        })
    }
}
