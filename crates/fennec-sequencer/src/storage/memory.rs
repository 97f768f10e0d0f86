//! The in-memory relational store. It defines the reference semantics for
//! settled, unsettled, orphaned, and pending rows; durable backends must
//! match it observably.

use std::collections::{
    BTreeMap,
    HashMap,
    HashSet,
};

use async_trait::async_trait;
use fennec_core::dao::{
    AccountDao,
    AssetMetricsDao,
    ClaimDao,
    RollupDao,
    RollupProofDao,
    TxDao,
};
use tokio::sync::Mutex;

use super::{
    MinedRollup,
    RollupProof,
    RollupStore,
};

#[derive(Debug, Default)]
struct State {
    txs: HashMap<[u8; 32], TxDao>,
    /// Pool-entry order of tx ids, for pending queries.
    tx_order: Vec<[u8; 32]>,
    rollup_proofs: HashMap<[u8; 32], RollupProofDao>,
    rollups: BTreeMap<u64, RollupDao>,
    claims: BTreeMap<u64, ClaimDao>,
    accounts: Vec<AccountDao>,
    /// Latest settled metrics snapshot per asset.
    asset_metrics: HashMap<u32, AssetMetricsDao>,
}

impl State {
    fn referenced_proof_hashes(&self) -> HashSet<[u8; 32]> {
        self.rollups.values().map(|rollup| rollup.rollup_proof_hash).collect()
    }

    fn rolled_up_tx_ids(&self) -> HashSet<[u8; 32]> {
        self.rollup_proofs
            .values()
            .flat_map(|proof| proof.tx_ids.iter().copied())
            .collect()
    }

    fn record_metrics(&mut self, metrics: &[AssetMetricsDao]) {
        for snapshot in metrics {
            self.asset_metrics.insert(snapshot.asset_id, snapshot.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transaction to the pool. This is the enclosing service's
    /// ingress path, not part of the synchronizer's query set.
    pub async fn add_tx(&self, tx: TxDao) {
        let mut state = self.state.lock().await;
        if !state.txs.contains_key(&tx.id) {
            state.tx_order.push(tx.id);
        }
        state.txs.insert(tx.id, tx);
    }

    /// All claim rows, ordered by leaf index.
    pub async fn claims(&self) -> Vec<ClaimDao> {
        self.state.lock().await.claims.values().cloned().collect()
    }

    pub async fn unsettled_rollup_count(&self) -> usize {
        let state = self.state.lock().await;
        state.rollups.values().filter(|rollup| !rollup.is_settled()).count()
    }

    pub async fn orphaned_rollup_proof_count(&self) -> usize {
        let state = self.state.lock().await;
        let referenced = state.referenced_proof_hashes();
        state
            .rollup_proofs
            .keys()
            .filter(|hash| !referenced.contains(*hash))
            .count()
    }

    pub async fn account_count(&self) -> usize {
        self.state.lock().await.accounts.len()
    }
}

#[async_trait]
impl RollupStore for MemoryStore {
    async fn get_next_rollup_id(&self) -> eyre::Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .rollups
            .values()
            .filter(|rollup| rollup.is_settled())
            .map(|rollup| rollup.id + 1)
            .max()
            .unwrap_or(0))
    }

    async fn get_settled_rollups(&self, from: u64) -> eyre::Result<Vec<RollupDao>> {
        let state = self.state.lock().await;
        Ok(state
            .rollups
            .range(from..)
            .map(|(_, rollup)| rollup)
            .filter(|rollup| rollup.is_settled())
            .cloned()
            .collect())
    }

    async fn get_rollup(&self, id: u64) -> eyre::Result<Option<RollupDao>> {
        Ok(self.state.lock().await.rollups.get(&id).cloned())
    }

    async fn get_rollup_proof(
        &self,
        rollup_hash: &[u8; 32],
        include_txs: bool,
    ) -> eyre::Result<Option<RollupProof>> {
        let state = self.state.lock().await;
        let Some(proof) = state.rollup_proofs.get(rollup_hash).cloned() else {
            return Ok(None);
        };
        let txs = if include_txs {
            proof
                .tx_ids
                .iter()
                .filter_map(|id| state.txs.get(id))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        Ok(Some(RollupProof {
            proof,
            txs,
        }))
    }

    async fn add_rollup_proof(
        &self,
        proof: RollupProofDao,
        txs: Vec<TxDao>,
    ) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        for tx in txs {
            if !state.txs.contains_key(&tx.id) {
                state.tx_order.push(tx.id);
                state.txs.insert(tx.id, tx);
            }
        }
        state.rollup_proofs.insert(proof.rollup_hash, proof);
        Ok(())
    }

    async fn add_rollup(&self, rollup: RollupDao) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        if rollup.is_settled() {
            state.record_metrics(&rollup.asset_metrics);
        }
        state.rollups.insert(rollup.id, rollup);
        Ok(())
    }

    async fn confirm_mined(&self, mined: MinedRollup) -> eyre::Result<RollupDao> {
        let mut state = self.state.lock().await;
        state.record_metrics(&mined.asset_metrics);
        for tx_id in &mined.tx_ids {
            if let Some(tx) = state.txs.get_mut(tx_id) {
                tx.mined = Some(mined.mined_at);
            }
        }
        let rollup = state.rollups.entry(mined.id).or_insert_with(|| RollupDao {
            id: mined.id,
            data_root: mined.data_root,
            rollup_proof_hash: mined.rollup_proof_hash,
            eth_tx_hash: None,
            created: mined.mined_at,
            mined: None,
            interaction_result: Vec::new(),
            gas_used: None,
            gas_price: None,
            asset_metrics: Vec::new(),
        });
        rollup.mined = Some(mined.mined_at);
        rollup.eth_tx_hash = Some(mined.eth_tx_hash);
        rollup.gas_used = Some(mined.gas_used);
        rollup.gas_price = Some(mined.gas_price);
        rollup.interaction_result = mined.interaction_result;
        rollup.asset_metrics = mined.asset_metrics;
        Ok(rollup.clone())
    }

    async fn delete_unsettled_rollups(&self) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        state.rollups.retain(|_, rollup| rollup.is_settled());
        Ok(())
    }

    async fn delete_orphaned_rollup_proofs(&self) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        let referenced = state.referenced_proof_hashes();
        state.rollup_proofs.retain(|hash, _| referenced.contains(hash));
        Ok(())
    }

    async fn delete_pending_txs(&self) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        let rolled_up = state.rolled_up_tx_ids();
        state
            .txs
            .retain(|id, tx| tx.mined.is_some() || rolled_up.contains(id));
        let remaining: HashSet<[u8; 32]> = state.txs.keys().copied().collect();
        state.tx_order.retain(|id| remaining.contains(id));
        Ok(())
    }

    async fn get_pending_txs(&self, limit: usize) -> eyre::Result<Vec<TxDao>> {
        let state = self.state.lock().await;
        let rolled_up = state.rolled_up_tx_ids();
        Ok(state
            .tx_order
            .iter()
            .filter_map(|id| state.txs.get(id))
            .filter(|tx| tx.mined.is_none() && !rolled_up.contains(&tx.id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn add_claim(&self, claim: ClaimDao) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        state.claims.insert(claim.leaf_index, claim);
        Ok(())
    }

    async fn confirm_claimed(&self, nullifier: &[u8; 32], mined_at: u64) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        for claim in state.claims.values_mut() {
            if claim.nullifier == *nullifier {
                claim.claimed = Some(mined_at);
            }
        }
        Ok(())
    }

    async fn update_claims_with_result_rollup_id(
        &self,
        nonce: u64,
        rollup_id: u64,
    ) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        for claim in state.claims.values_mut() {
            if claim.interaction_nonce == nonce {
                claim.interaction_result_rollup_id = Some(rollup_id);
            }
        }
        Ok(())
    }

    async fn add_accounts(&self, accounts: Vec<AccountDao>) -> eyre::Result<()> {
        self.state.lock().await.accounts.extend(accounts);
        Ok(())
    }

    async fn get_asset_metrics(&self, asset_id: u32) -> eyre::Result<Option<AssetMetricsDao>> {
        Ok(self.state.lock().await.asset_metrics.get(&asset_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use fennec_core::proof::TxType;

    use super::*;

    fn tx(seed: u8) -> TxDao {
        TxDao {
            id: [seed; 32],
            proof_data: vec![seed],
            offchain_tx_data: Vec::new(),
            nullifier1: Some([seed; 32]),
            nullifier2: None,
            created: u64::from(seed),
            mined: None,
            tx_type: TxType::Transfer,
            excess_gas: 0,
        }
    }

    fn proof(hash: u8, tx_ids: Vec<[u8; 32]>) -> RollupProofDao {
        RollupProofDao {
            rollup_hash: [hash; 32],
            tx_ids,
            rollup_size: 4,
            data_start_index: 0,
            proof_data: vec![hash],
            created: 0,
        }
    }

    fn rollup(id: u64, proof_hash: u8, mined: Option<u64>) -> RollupDao {
        RollupDao {
            id,
            data_root: [0; 32],
            rollup_proof_hash: [proof_hash; 32],
            eth_tx_hash: None,
            created: 0,
            mined,
            interaction_result: Vec::new(),
            gas_used: None,
            gas_price: None,
            asset_metrics: Vec::new(),
        }
    }

    #[tokio::test]
    async fn next_rollup_id_ignores_unsettled_rows() {
        let store = MemoryStore::new();
        assert_eq!(0, store.get_next_rollup_id().await.unwrap());
        store.add_rollup(rollup(0, 1, Some(10))).await.unwrap();
        store.add_rollup(rollup(1, 2, None)).await.unwrap();
        assert_eq!(1, store.get_next_rollup_id().await.unwrap());
    }

    #[tokio::test]
    async fn pending_txs_exclude_rolled_up_and_mined() {
        let store = MemoryStore::new();
        store.add_tx(tx(1)).await;
        store.add_tx(tx(2)).await;
        store.add_tx(tx(3)).await;
        store
            .add_rollup_proof(proof(9, vec![[2; 32]]), Vec::new())
            .await
            .unwrap();
        let pending = store.get_pending_txs(10).await.unwrap();
        let ids: Vec<[u8; 32]> = pending.iter().map(|tx| tx.id).collect();
        assert_eq!(vec![[1; 32], [3; 32]], ids);
    }

    #[tokio::test]
    async fn sweep_order_turns_proofs_into_orphans() {
        let store = MemoryStore::new();
        store
            .add_rollup_proof(proof(9, Vec::new()), Vec::new())
            .await
            .unwrap();
        store.add_rollup(rollup(0, 9, None)).await.unwrap();
        assert_eq!(0, store.orphaned_rollup_proof_count().await);

        store.delete_unsettled_rollups().await.unwrap();
        assert_eq!(1, store.orphaned_rollup_proof_count().await);
        store.delete_orphaned_rollup_proofs().await.unwrap();
        assert_eq!(0, store.orphaned_rollup_proof_count().await);
    }

    #[tokio::test]
    async fn confirm_mined_settles_txs_and_creates_missing_rows() {
        let store = MemoryStore::new();
        store.add_tx(tx(1)).await;
        store
            .add_rollup_proof(proof(9, vec![[1; 32]]), Vec::new())
            .await
            .unwrap();
        let mined = store
            .confirm_mined(MinedRollup {
                id: 0,
                rollup_proof_hash: [9; 32],
                data_root: [3; 32],
                gas_used: 1_000_000,
                gas_price: [0; 32],
                mined_at: 42,
                eth_tx_hash: [7; 32],
                interaction_result: Vec::new(),
                tx_ids: vec![[1; 32]],
                asset_metrics: vec![AssetMetricsDao {
                    rollup_id: 0,
                    asset_id: 0,
                    total_deposited: 5,
                    ..AssetMetricsDao::default()
                }],
            })
            .await
            .unwrap();
        assert_eq!(Some(42), mined.mined);
        assert!(store.get_pending_txs(10).await.unwrap().is_empty());
        assert_eq!(1, store.get_next_rollup_id().await.unwrap());
        let metrics = store.get_asset_metrics(0).await.unwrap().unwrap();
        assert_eq!(5, metrics.total_deposited);
    }

    #[tokio::test]
    async fn claims_settle_by_nullifier_and_nonce() {
        let store = MemoryStore::new();
        store
            .add_claim(ClaimDao {
                leaf_index: 14,
                nullifier: [5; 32],
                bridge_id: [1; 32],
                deposit_value: 100,
                partial_state: [0; 32],
                partial_state_secret_eph_pub_key: [0; 64],
                input_nullifier: [6; 32],
                interaction_nonce: 10,
                fee: 5,
                created: 0,
                claimed: None,
                interaction_result_rollup_id: None,
            })
            .await
            .unwrap();
        store.update_claims_with_result_rollup_id(10, 2).await.unwrap();
        store.confirm_claimed(&[5; 32], 77).await.unwrap();
        let claim = &store.claims().await[0];
        assert_eq!(Some(2), claim.interaction_result_rollup_id);
        assert_eq!(Some(77), claim.claimed);
    }
}
