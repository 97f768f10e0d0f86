//! The world-state synchronizer.
//!
//! [`WorldState`] is the unique writer of the tree store and the
//! relational store. Blocks flow from the chain source through the block
//! queue into [`Inner::handle_block`], strictly in rollup-id order; each
//! block stops the pipeline, reconciles trees and relational state, and
//! starts a fresh pipeline. Divergence from our own staged rollup is
//! normal (another provider won the slot) and is resolved by replaying
//! the block's effects, never by failing.

use std::{
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use eyre::{
    bail,
    ensure,
    eyre,
    WrapErr as _,
};
use fennec_core::{
    block::Block,
    dao::{
        AccountDao,
        AssetMetricsDao,
        ClaimDao,
        RollupDao,
        RollupProofDao,
        TxDao,
    },
    defi::{
        self,
        OffchainDefiDepositData,
    },
    notes::{
        ClaimNoteData,
        NoteAlgorithms,
    },
    proof::{
        ProofId,
        RollupProofData,
        TxType,
    },
    NUM_BRIDGE_CALLS_PER_BLOCK,
    UNUSED_ASSET_ID,
};
use futures::FutureExt as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    instrument,
    warn,
};

use crate::{
    block_cache::BlockCache,
    chain::ChainSource,
    init,
    metrics::Metrics,
    pipeline::{
        Pipeline,
        PipelineFactory,
        PublishTimes,
        TxPoolProfile,
    },
    queue::BlockQueue,
    storage::{
        MinedRollup,
        RollupProof,
        RollupStore,
    },
    trees::{
        nullifier_index,
        one_leaf,
        stage_rollup_leaves,
        TreeStore,
        TreeTag,
    },
};

mod builder;
pub use builder::Builder;
#[cfg(test)]
mod tests;

/// The synchronizer and its operator surface.
pub struct WorldState {
    inner: Arc<Inner>,
}

impl WorldState {
    /// Recovers a consistent state and begins ingesting blocks.
    ///
    /// Recovery order matters: unsettled rollups are dropped before
    /// orphaned proofs so that dropping a rollup row turns its proof into
    /// an orphan within the same sweep.
    ///
    /// # Errors
    /// Returns an error on any fatal-init condition: a tree store that
    /// fails to open, unreadable initial state files, or an initial root
    /// mismatch.
    #[instrument(skip_all, err)]
    pub async fn start(&self) -> eyre::Result<()> {
        let inner = &self.inner;
        inner.trees.start().await.wrap_err("failed starting tree store")?;
        let next_rollup_id = inner.store.get_next_rollup_id().await?;
        if next_rollup_id == 0 {
            inner
                .init_from_files()
                .await
                .wrap_err("failed installing initial state")?;
        }
        inner
            .sync_from_chain(next_rollup_id)
            .await
            .wrap_err("failed syncing from chain")?;
        inner.store.delete_unsettled_rollups().await?;
        inner.store.delete_orphaned_rollup_proofs().await?;
        inner
            .load_block_cache()
            .await
            .wrap_err("failed rebuilding block cache")?;

        let mut events = inner.chain.subscribe().await;
        let forwarder = {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(block) = events.recv().await {
                    inner.queue.put(block);
                }
                debug!("chain source event stream ended");
            })
        };
        *inner.forwarder.lock().await = Some(forwarder);

        let handler_inner = inner.clone();
        inner.queue.process(Box::new(move |block| {
            let inner = handler_inner.clone();
            async move { inner.handle_block(block).await }.boxed()
        }));
        inner
            .chain
            .start(inner.store.get_next_rollup_id().await?)
            .await
            .wrap_err("failed starting chain source")?;
        inner.start_pipeline().await?;
        info!("world state started");
        Ok(())
    }

    /// Stops block ingestion, the chain source, the pipeline, and the
    /// tree store. An in-flight block completes to its commit boundary
    /// first.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.queue.cancel().await;
        inner.chain.stop().await;
        let forwarder = inner.forwarder.lock().await.take();
        if let Some(forwarder) = forwarder {
            if forwarder.await.is_err() {
                warn!("chain event forwarder panicked before exiting");
            }
        }
        inner.stop_pipeline().await;
        if let Err(error) = inner.trees.stop().await {
            warn!(%error, "failed stopping tree store");
        }
        info!("world state stopped");
    }

    /// Operator surface: discard everything unsettled and restart the
    /// pipeline from a clean slate.
    ///
    /// # Errors
    /// Returns an error if a sweep or the pipeline restart fails.
    pub async fn reset_pipeline(&self) -> eyre::Result<()> {
        self.inner.reset_pipeline().await
    }

    /// Asks the pipeline to publish whatever is pending at its next safe
    /// point.
    pub async fn flush_txs(&self) {
        if let Some(pipeline) = self.inner.pipeline.lock().await.as_ref() {
            pipeline.flush_txs();
        }
    }

    pub async fn get_next_publish_time(&self) -> PublishTimes {
        match self.inner.pipeline.lock().await.as_ref() {
            Some(pipeline) => pipeline.get_next_publish_time(),
            None => PublishTimes::default(),
        }
    }

    pub async fn get_tx_pool_profile(&self) -> TxPoolProfile {
        match self.inner.pipeline.lock().await.as_ref() {
            Some(pipeline) => pipeline.get_tx_pool_profile(),
            None => TxPoolProfile::default(),
        }
    }

    /// Serialized settled blocks from `from` onwards, for client catch-up.
    #[must_use]
    pub fn get_block_buffers(&self, from: u64) -> Vec<Vec<u8>> {
        self.inner.block_cache.get_from(from)
    }

    /// Resolves once the synchronizer has shut itself down after a fatal
    /// block-processing failure.
    pub async fn cancelled(&self) {
        self.inner.shutdown.cancelled().await;
    }
}

struct Inner {
    trees: Arc<dyn TreeStore>,
    store: Arc<dyn RollupStore>,
    chain: Arc<dyn ChainSource>,
    note_algorithms: Arc<dyn NoteAlgorithms>,
    pipeline_factory: PipelineFactory,
    metrics: &'static Metrics,
    data_dir: PathBuf,
    block_cache: BlockCache,
    queue: BlockQueue,
    pipeline: tokio::sync::Mutex<Option<Pipeline>>,
    forwarder: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Inner {
    /// Populates the trees from the per-chain-id account roster, verifies
    /// the computed roots against the expected ones, and persists the
    /// account rows. Missing files or an empty roster are a no-op; a root
    /// mismatch aborts startup.
    #[instrument(skip_all, err)]
    async fn init_from_files(&self) -> eyre::Result<()> {
        let chain_id = self.chain.get_chain_id().await?;
        let Some(state) = init::load(&self.data_dir, chain_id)? else {
            debug!(chain_id, "no initial state files; starting from empty trees");
            return Ok(());
        };
        if state.accounts.is_empty() {
            return Ok(());
        }
        info!(
            chain_id,
            accounts = state.accounts.len(),
            "installing initial state from files"
        );
        for (position, account) in state.accounts.iter().enumerate() {
            let index = 2 * position as u128;
            self.trees
                .put(TreeTag::Data, index, &account.note_commitments[0])
                .await?;
            self.trees
                .put(TreeTag::Data, index + 1, &account.note_commitments[1])
                .await?;
            for nullifier in &account.nullifiers {
                if *nullifier != [0u8; 32] {
                    self.trees
                        .put(TreeTag::Null, nullifier_index(nullifier), &one_leaf())
                        .await?;
                }
            }
        }
        let data_root = self.trees.get_root(TreeTag::Data).await;
        self.trees.put(TreeTag::Root, 0, &data_root).await?;

        let expected = [
            (TreeTag::Data, state.roots.data_root),
            (TreeTag::Null, state.roots.null_root),
            (TreeTag::Root, state.roots.roots_root),
        ];
        for (tag, expected_root) in expected {
            let actual = self.trees.get_root(tag).await;
            if actual != expected_root {
                self.trees.rollback().await?;
                bail!(
                    "{tag} tree root mismatch after initial population: expected {}, got {}",
                    hex::encode(expected_root),
                    hex::encode(actual),
                );
            }
        }
        self.trees
            .commit()
            .await
            .wrap_err("failed committing initial tree state")?;
        let accounts = state
            .accounts
            .iter()
            .map(|account| AccountDao {
                alias_hash: account.alias_hash,
                account_public_key: account.account_public_key,
                nonce: account.nonce,
            })
            .collect();
        self.store.add_accounts(accounts).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(from), err)]
    async fn sync_from_chain(&self, from: u64) -> eyre::Result<()> {
        let blocks = self
            .chain
            .get_blocks(from)
            .await
            .wrap_err("failed fetching settled blocks")?;
        if blocks.is_empty() {
            return Ok(());
        }
        info!(from, count = blocks.len(), "replaying settled blocks");
        for block in blocks {
            self.update_dbs(&block)
                .await
                .wrap_err_with(|| format!("failed applying block {}", block.rollup_id))?;
        }
        Ok(())
    }

    async fn load_block_cache(&self) -> eyre::Result<()> {
        let settled = self.store.get_settled_rollups(0).await?;
        let mut buffers = Vec::with_capacity(settled.len());
        for rollup in &settled {
            let proof = self
                .store
                .get_rollup_proof(&rollup.rollup_proof_hash, true)
                .await?
                .ok_or_else(|| eyre!("settled rollup {} has no stored proof", rollup.id))?;
            buffers.push(block_from_rollup(rollup, &proof)?.to_buf());
        }
        self.block_cache.reset(buffers);
        Ok(())
    }

    /// The block queue handler: strictly serialized, one block at a time.
    async fn handle_block(&self, block: Block) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.stop_pipeline().await;
        if let Err(error) = self.update_dbs(&block).await {
            // Block application is all-or-nothing; shut down so startup
            // recovery sweeps the partial state.
            error!(
                block.rollup_id,
                %error,
                "failed processing block; shutting down for recovery"
            );
            self.shutdown.cancel();
            return;
        }
        if let Err(error) = self.start_pipeline().await {
            warn!(%error, "failed starting fresh pipeline; retrying on next block");
        }
    }

    /// The reconciliation core: commit our staged rollup or replay a
    /// competitor's, then settle the relational state and the cache.
    #[instrument(skip_all, fields(block.rollup_id = block.rollup_id), err)]
    async fn update_dbs(&self, block: &Block) -> eyre::Result<()> {
        let started = Instant::now();
        let proof = RollupProofData::from_bytes(&block.rollup_proof_data)
            .wrap_err("failed decoding rollup proof data")?;
        ensure!(
            proof.rollup_id == block.rollup_id,
            "block {} carries a proof for rollup {}",
            block.rollup_id,
            proof.rollup_id,
        );

        if self.trees_match(&proof).await {
            // This is the rollup we just published; our staged writes are
            // exactly its effects.
            self.trees
                .commit()
                .await
                .wrap_err("failed committing our rollup's tree writes")?;
            debug!("tree roots match the block; committed staged writes");
        } else {
            self.trees.rollback().await?;
            self.apply_rollup_to_trees(&proof).await?;
        }
        self.process_defi_proofs(block, &proof).await?;
        self.confirm_or_add_rollup(block, &proof).await?;
        self.block_cache
            .insert(block.rollup_id, block.to_buf())
            .wrap_err("block arrived out of order")?;
        self.metrics.increment_rollups_received();
        self.metrics.record_process_block_duration(started.elapsed());
        Ok(())
    }

    async fn trees_match(&self, proof: &RollupProofData) -> bool {
        self.trees.get_root(TreeTag::Data).await == proof.new_data_root
            && self.trees.get_root(TreeTag::Null).await == proof.new_null_root
            && self.trees.get_root(TreeTag::Root).await == proof.new_data_roots_root
            && self.trees.get_root(TreeTag::Defi).await == proof.new_defi_root
    }

    async fn apply_rollup_to_trees(&self, proof: &RollupProofData) -> eyre::Result<()> {
        // The trees can be ahead of the relational store (the store was
        // wiped but the trees survived); the leaves are already in place.
        if self.trees.get_size(TreeTag::Data).await > proof.data_start_index {
            debug!(
                data_start_index = proof.data_start_index,
                "data tree already contains this rollup's leaves"
            );
            return Ok(());
        }
        stage_rollup_leaves(
            self.trees.as_ref(),
            proof.rollup_id,
            proof.data_start_index,
            &proof.inner_proofs,
            &proof.defi_interaction_notes,
        )
        .await?;
        self.trees
            .commit()
            .await
            .wrap_err("failed committing replayed rollup")
    }

    /// Walks the inner proofs: defi deposits mint claim rows, defi claims
    /// settle them, and the block's interaction results stamp the claims
    /// awaiting their nonce.
    async fn process_defi_proofs(
        &self,
        block: &Block,
        proof: &RollupProofData,
    ) -> eyre::Result<()> {
        let mut off_chain_index = 0usize;
        for (position, inner) in proof.inner_proofs.iter().enumerate() {
            if inner.is_padding() {
                continue;
            }
            match inner.proof_id {
                ProofId::DefiDeposit => {
                    let blob = block.offchain_tx_data.get(off_chain_index).ok_or_else(|| {
                        eyre!("defi deposit at position {position} has no off-chain data")
                    })?;
                    let offchain = OffchainDefiDepositData::from_bytes(blob)
                        .wrap_err("failed decoding off-chain defi deposit data")?;
                    // The user pays half the fee on deposit, the remainder
                    // rides on the claim.
                    let fee = offchain.tx_fee - (offchain.tx_fee >> 1);
                    let slot = proof
                        .bridge_ids
                        .iter()
                        .position(|bridge| *bridge == offchain.bridge_id)
                        .ok_or_else(|| {
                            eyre!("defi deposit bridge is not in the rollup's bridge slots")
                        })? as u64;
                    let interaction_nonce =
                        proof.rollup_id * NUM_BRIDGE_CALLS_PER_BLOCK as u64 + slot;
                    let note = ClaimNoteData {
                        deposit_value: offchain.deposit_value,
                        bridge_id: offchain.bridge_id,
                        partial_state: offchain.partial_state,
                        input_nullifier: inner.nullifier1,
                        interaction_nonce,
                        fee,
                    };
                    let commitment = self.note_algorithms.claim_note_partial_commitment(&note);
                    let nullifier = self.note_algorithms.claim_note_nullifier(&commitment);
                    self.store
                        .add_claim(ClaimDao {
                            leaf_index: proof.data_start_index + 2 * position as u64,
                            nullifier,
                            bridge_id: offchain.bridge_id,
                            deposit_value: offchain.deposit_value,
                            partial_state: offchain.partial_state,
                            partial_state_secret_eph_pub_key: offchain
                                .partial_state_secret_eph_pub_key,
                            input_nullifier: inner.nullifier1,
                            interaction_nonce,
                            fee,
                            created: block.created,
                            claimed: None,
                            interaction_result_rollup_id: None,
                        })
                        .await
                        .wrap_err("failed storing claim")?;
                }
                ProofId::DefiClaim => {
                    self.store
                        .confirm_claimed(&inner.nullifier1, block.created)
                        .await
                        .wrap_err("failed confirming claim")?;
                }
                _ => {}
            }
            off_chain_index += 1;
        }
        for note in &block.interaction_result {
            self.store
                .update_claims_with_result_rollup_id(u64::from(note.nonce), block.rollup_id)
                .await?;
        }
        Ok(())
    }

    /// If the proof hash is known, the rollup is ours: settle it and emit
    /// settlement metrics. Otherwise rebuild the proof and txs from the
    /// block and record the competitor's rollup as settled.
    async fn confirm_or_add_rollup(
        &self,
        block: &Block,
        proof: &RollupProofData,
    ) -> eyre::Result<()> {
        let rollup_hash = proof.rollup_hash();
        let interaction_result = defi::pack_interaction_notes(&block.interaction_result);
        let asset_metrics = self.compute_asset_metrics(block, proof).await?;
        if let Some(ours) = self.store.get_rollup_proof(&rollup_hash, true).await? {
            self.store
                .confirm_mined(MinedRollup {
                    id: block.rollup_id,
                    rollup_proof_hash: rollup_hash,
                    data_root: proof.new_data_root,
                    gas_used: block.gas_used,
                    gas_price: block.gas_price,
                    mined_at: block.created,
                    eth_tx_hash: block.eth_tx_hash,
                    interaction_result,
                    tx_ids: ours.proof.tx_ids.clone(),
                    asset_metrics,
                })
                .await
                .wrap_err("failed confirming mined rollup")?;
            for tx in &ours.txs {
                self.metrics
                    .record_tx_settlement_duration(block.created.saturating_sub(tx.created));
            }
            info!(
                block.rollup_id,
                txs = ours.proof.tx_ids.len(),
                "confirmed our rollup as mined"
            );
        } else {
            let (proof_dao, txs) = rebuild_rollup_proof(block, proof, rollup_hash)?;
            let num_txs = txs.len();
            self.store.add_rollup_proof(proof_dao, txs).await?;
            self.store
                .add_rollup(RollupDao {
                    id: block.rollup_id,
                    data_root: proof.new_data_root,
                    rollup_proof_hash: rollup_hash,
                    eth_tx_hash: Some(block.eth_tx_hash),
                    created: block.created,
                    mined: Some(block.created),
                    interaction_result,
                    gas_used: Some(block.gas_used),
                    gas_price: Some(block.gas_price),
                    asset_metrics,
                })
                .await?;
            info!(
                block.rollup_id,
                txs = num_txs,
                "recorded another provider's rollup"
            );
        }
        Ok(())
    }

    /// Rolls the per-asset totals forward: previous snapshot plus this
    /// rollup's flows, with the contract balance read live. A snapshot
    /// already stamped with this rollup id is reused as-is so replay does
    /// not double-count.
    async fn compute_asset_metrics(
        &self,
        block: &Block,
        proof: &RollupProofData,
    ) -> eyre::Result<Vec<AssetMetricsDao>> {
        let mut rows = Vec::new();
        let mut seen = Vec::new();
        for asset_id in proof.asset_ids.iter().copied() {
            if asset_id == UNUSED_ASSET_ID || seen.contains(&asset_id) {
                continue;
            }
            seen.push(asset_id);
            let (mut metrics, already_counted) =
                match self.store.get_asset_metrics(asset_id).await? {
                    Some(existing) => {
                        let counted = existing.rollup_id == block.rollup_id;
                        (existing, counted)
                    }
                    None => (AssetMetricsDao::default(), false),
                };
            metrics.rollup_id = block.rollup_id;
            metrics.asset_id = asset_id;
            metrics.contract_balance = self.chain.get_rollup_balance(asset_id).await?;
            if !already_counted {
                accumulate_asset_flows(&mut metrics, block, proof, asset_id);
            }
            rows.push(metrics);
        }
        Ok(rows)
    }

    async fn start_pipeline(&self) -> eyre::Result<()> {
        let pipeline = self
            .pipeline_factory
            .start_new()
            .await
            .wrap_err("failed starting pipeline")?;
        *self.pipeline.lock().await = Some(pipeline);
        Ok(())
    }

    async fn stop_pipeline(&self) {
        let pipeline = self.pipeline.lock().await.take();
        if let Some(pipeline) = pipeline {
            pipeline.stop().await;
        }
    }

    #[instrument(skip_all, err)]
    async fn reset_pipeline(&self) -> eyre::Result<()> {
        self.stop_pipeline().await;
        self.trees.rollback().await?;
        self.store.delete_unsettled_rollups().await?;
        self.store.delete_orphaned_rollup_proofs().await?;
        self.store.delete_pending_txs().await?;
        self.start_pipeline().await
    }
}

fn accumulate_asset_flows(
    metrics: &mut AssetMetricsDao,
    block: &Block,
    proof: &RollupProofData,
    asset_id: u32,
) {
    let mut off_chain_index = 0usize;
    for (_, inner) in proof.real_proofs() {
        match inner.proof_id {
            ProofId::Deposit if inner.public_asset_id == asset_id => {
                metrics.total_deposited += inner.public_value;
            }
            ProofId::Withdraw if inner.public_asset_id == asset_id => {
                metrics.total_withdrawn += inner.public_value;
            }
            ProofId::DefiDeposit => {
                if let Some(Ok(offchain)) = block
                    .offchain_tx_data
                    .get(off_chain_index)
                    .map(|blob| OffchainDefiDepositData::from_bytes(blob))
                {
                    if defi::bridge_input_asset_id(&offchain.bridge_id) == asset_id {
                        metrics.total_defi_deposited += offchain.deposit_value;
                    }
                }
            }
            _ => {}
        }
        if inner.public_asset_id == asset_id
            && matches!(
                inner.proof_id,
                ProofId::Deposit | ProofId::Withdraw | ProofId::Send
            )
        {
            metrics.total_fees += inner.tx_fee;
        }
        off_chain_index += 1;
    }
    for note in &block.interaction_result {
        if defi::bridge_output_asset_id_a(&note.bridge_id) == asset_id {
            metrics.total_defi_claimed += note.total_output_value_a;
        }
        if defi::bridge_output_asset_id_b(&note.bridge_id) == asset_id {
            metrics.total_defi_claimed += note.total_output_value_b;
        }
    }
}

/// Rebuilds the proof row and tx rows of a rollup another provider
/// published. Off-chain data pairs with the i-th non-padding proof by
/// off-chain index, not by inner-proof position.
fn rebuild_rollup_proof(
    block: &Block,
    proof: &RollupProofData,
    rollup_hash: [u8; 32],
) -> eyre::Result<(RollupProofDao, Vec<TxDao>)> {
    let mut txs = Vec::new();
    let mut off_chain_index = 0usize;
    for (_, inner) in proof.real_proofs() {
        let tx_type = TxType::from_proof_id(inner.proof_id)
            .ok_or_else(|| eyre!("padding proof cannot become a tx"))?;
        let offchain_tx_data = block
            .offchain_tx_data
            .get(off_chain_index)
            .cloned()
            .unwrap_or_default();
        txs.push(TxDao {
            id: inner.tx_id(),
            proof_data: inner.to_bytes(),
            offchain_tx_data,
            nullifier1: (inner.nullifier1 != [0u8; 32]).then_some(inner.nullifier1),
            nullifier2: (inner.nullifier2 != [0u8; 32]).then_some(inner.nullifier2),
            created: block.created,
            mined: Some(block.created),
            tx_type,
            excess_gas: 0,
        });
        off_chain_index += 1;
    }
    let proof_dao = RollupProofDao {
        rollup_hash,
        tx_ids: txs.iter().map(|tx| tx.id).collect(),
        rollup_size: proof.rollup_size,
        data_start_index: proof.data_start_index,
        proof_data: proof.to_bytes(),
        created: block.created,
    };
    Ok((proof_dao, txs))
}

/// Reconstructs the serialized block a settled rollup row represents, for
/// the block cache.
fn block_from_rollup(rollup: &RollupDao, proof: &RollupProof) -> eyre::Result<Block> {
    let interaction_result = defi::unpack_interaction_notes(&rollup.interaction_result)
        .wrap_err("stored interaction result column is corrupt")?;
    Ok(Block {
        rollup_id: rollup.id,
        created: rollup.mined.unwrap_or(rollup.created),
        eth_tx_hash: rollup.eth_tx_hash.unwrap_or([0u8; 32]),
        rollup_size: proof.proof.rollup_size,
        rollup_proof_data: proof.proof.proof_data.clone(),
        offchain_tx_data: proof
            .txs
            .iter()
            .map(|tx| tx.offchain_tx_data.clone())
            .collect(),
        interaction_result,
        gas_used: rollup.gas_used.unwrap_or(0),
        gas_price: rollup.gas_price.unwrap_or([0u8; 32]),
    })
}
