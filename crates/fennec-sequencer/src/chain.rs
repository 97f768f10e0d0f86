//! The chain source boundary: the external chain node observed for
//! settled rollup blocks and used to publish our own.

use std::collections::HashMap;

use async_trait::async_trait;
use eyre::{
    ensure,
    WrapErr as _,
};
use fennec_core::{
    block::Block,
    defi::DefiInteractionNote,
    proof::RollupProofData,
    NUM_BRIDGE_CALLS_PER_BLOCK,
};
use sha2::{
    Digest as _,
    Sha256,
};
use tokio::sync::{
    mpsc,
    Mutex,
};
use tracing::info;

use crate::util::now_millis;

/// The capability set the synchronizer and pipeline require of the chain.
///
/// Block events are delivered to subscribers in rollup-id order from the
/// id passed to `start`; `get_blocks` returns the contiguous settled
/// sequence.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Registers for block events. Subscribe before calling `start` to
    /// observe the replayed backlog.
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<Block>;

    /// Begins event delivery from `from_rollup_id`.
    async fn start(&self, from_rollup_id: u64) -> eyre::Result<()>;

    async fn stop(&self);

    async fn get_chain_id(&self) -> eyre::Result<u64>;

    /// The contiguous settled blocks with `rollup_id >= from`.
    async fn get_blocks(&self, from: u64) -> eyre::Result<Vec<Block>>;

    /// The rollup contract's live balance of `asset_id`.
    async fn get_rollup_balance(&self, asset_id: u32) -> eyre::Result<u128>;

    /// Publishes an encoded rollup proof, returning the chain tx hash.
    async fn send_rollup_proof(
        &self,
        encoded_proof: Vec<u8>,
        offchain_tx_data: Vec<Vec<u8>>,
    ) -> eyre::Result<[u8; 32]>;
}

const DEV_GAS_BASE: u64 = 550_000;
const DEV_GAS_PER_TX: u64 = 50_000;
const DEV_GAS_PRICE_WEI: u128 = 30_000_000_000;

#[derive(Default)]
struct ChainState {
    blocks: Vec<Block>,
    subscribers: Vec<mpsc::UnboundedSender<Block>>,
    balances: HashMap<u32, u128>,
    started_from: Option<u64>,
}

impl ChainState {
    fn broadcast(&mut self, block: &Block) {
        self.subscribers
            .retain(|subscriber| subscriber.send(block.clone()).is_ok());
    }
}

/// An in-process loopback chain: published proofs settle immediately as
/// the next block. Backs dev mode and the scenario tests; a production
/// deployment implements [`ChainSource`] against a real chain node.
pub struct LocalChainSource {
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl LocalChainSource {
    #[must_use]
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(ChainState::default()),
        }
    }

    /// Sets the live contract balance reported for `asset_id`.
    pub async fn set_rollup_balance(&self, asset_id: u32, balance: u128) {
        self.state.lock().await.balances.insert(asset_id, balance);
    }

    /// Appends an externally-settled block, e.g. a competitor's rollup,
    /// and delivers it to subscribers.
    ///
    /// # Errors
    /// Returns an error if the block does not extend the chain
    /// contiguously.
    pub async fn push_block(&self, block: Block) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        ensure!(
            block.rollup_id == state.blocks.len() as u64,
            "block {} does not extend chain of length {}",
            block.rollup_id,
            state.blocks.len(),
        );
        state.blocks.push(block.clone());
        if state.started_from.is_some() {
            state.broadcast(&block);
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for LocalChainSource {
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<Block> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.subscribers.push(tx);
        rx
    }

    async fn start(&self, from_rollup_id: u64) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        state.started_from = Some(from_rollup_id);
        let backlog: Vec<Block> = state
            .blocks
            .iter()
            .skip(usize::try_from(from_rollup_id).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        for block in &backlog {
            state.broadcast(block);
        }
        info!(
            from_rollup_id,
            backlog = backlog.len(),
            "started local chain source"
        );
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.started_from = None;
        state.subscribers.clear();
    }

    async fn get_chain_id(&self) -> eyre::Result<u64> {
        Ok(self.chain_id)
    }

    async fn get_blocks(&self, from: u64) -> eyre::Result<Vec<Block>> {
        let state = self.state.lock().await;
        Ok(state
            .blocks
            .iter()
            .skip(usize::try_from(from).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_rollup_balance(&self, asset_id: u32) -> eyre::Result<u128> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(&asset_id)
            .copied()
            .unwrap_or(0))
    }

    async fn send_rollup_proof(
        &self,
        encoded_proof: Vec<u8>,
        offchain_tx_data: Vec<Vec<u8>>,
    ) -> eyre::Result<[u8; 32]> {
        let proof = RollupProofData::from_bytes(&encoded_proof)
            .wrap_err("published rollup proof failed to decode")?;
        let eth_tx_hash: [u8; 32] = Sha256::digest(&encoded_proof).into();
        let real_txs = proof.real_proofs().count() as u64;

        let interaction_result = proof
            .bridge_ids
            .iter()
            .enumerate()
            .filter(|(_, bridge_id)| **bridge_id != [0u8; 32])
            .map(|(slot, bridge_id)| DefiInteractionNote {
                bridge_id: *bridge_id,
                nonce: u32::try_from(
                    proof.rollup_id * NUM_BRIDGE_CALLS_PER_BLOCK as u64 + slot as u64,
                )
                .unwrap_or(u32::MAX),
                total_input_value: 0,
                total_output_value_a: 0,
                total_output_value_b: 0,
                result: true,
            })
            .collect();

        let block = Block {
            rollup_id: proof.rollup_id,
            created: now_millis(),
            eth_tx_hash,
            rollup_size: proof.rollup_size,
            rollup_proof_data: encoded_proof,
            offchain_tx_data,
            interaction_result,
            gas_used: DEV_GAS_BASE + DEV_GAS_PER_TX * real_txs,
            gas_price: {
                let mut price = [0u8; 32];
                price[16..].copy_from_slice(&DEV_GAS_PRICE_WEI.to_be_bytes());
                price
            },
        };
        self.push_block(block)
            .await
            .wrap_err("published rollup lost the race for its rollup id")?;
        Ok(eth_tx_hash)
    }
}
