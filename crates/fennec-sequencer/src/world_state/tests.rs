use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};

use fennec_core::{
    block::Block,
    dao::{
        RollupDao,
        RollupProofDao,
        TxDao,
    },
    defi::{
        bridge_id_from_slots,
        BridgeId,
        OffchainDefiDepositData,
    },
    notes::Sha256NoteAlgorithms,
    proof::{
        InnerProofData,
        ProofId,
        RollupProofData,
        TxType,
    },
    NUM_ASSETS,
    NUM_BRIDGE_CALLS_PER_BLOCK,
    UNUSED_ASSET_ID,
};

use super::*;
use crate::{
    chain::LocalChainSource,
    metrics::Metrics,
    pipeline::{
        LocalRollupAssembler,
        RollupAssembler as _,
    },
    storage::MemoryStore,
    trees::WorldStateTrees,
};

const CHAIN_ID: u64 = 7;
const ROLLUP_SIZE: u32 = 4;
/// Long enough that pipelines never publish on their own in tests.
const IDLE_PUBLISH_INTERVAL: Duration = Duration::from_secs(3600);

struct Harness {
    world_state: WorldState,
    trees_dyn: Arc<dyn TreeStore>,
    store: Arc<MemoryStore>,
    chain: Arc<LocalChainSource>,
    _data_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(ROLLUP_SIZE, tempfile::tempdir().unwrap())
}

fn harness_with(rollup_size: u32, data_dir: tempfile::TempDir) -> Harness {
    let trees_dyn: Arc<dyn TreeStore> = Arc::new(WorldStateTrees::new());
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(LocalChainSource::new(CHAIN_ID));
    let world_state = Builder {
        trees: trees_dyn.clone(),
        store: store.clone(),
        chain: chain.clone(),
        note_algorithms: Arc::new(Sha256NoteAlgorithms),
        assembler: Arc::new(LocalRollupAssembler::new(rollup_size)),
        metrics: Metrics::register(),
        data_dir: data_dir.path().to_path_buf(),
        publish_interval: IDLE_PUBLISH_INTERVAL,
        rollup_size,
    }
    .build();
    Harness {
        world_state,
        trees_dyn,
        store,
        chain,
        _data_dir: data_dir,
    }
}

impl Harness {
    fn inner(&self) -> &Arc<Inner> {
        &self.world_state.inner
    }

    async fn pipeline_running(&self) -> bool {
        self.inner().pipeline.lock().await.is_some()
    }

    async fn assert_roots_match(&self, proof: &RollupProofData) {
        assert_eq!(proof.new_data_root, self.trees_dyn.get_root(TreeTag::Data).await);
        assert_eq!(proof.new_null_root, self.trees_dyn.get_root(TreeTag::Null).await);
        assert_eq!(
            proof.new_data_roots_root,
            self.trees_dyn.get_root(TreeTag::Root).await
        );
        assert_eq!(proof.new_defi_root, self.trees_dyn.get_root(TreeTag::Defi).await);
    }
}

/// An independent rollup provider with its own trees and chain, used to
/// fabricate competitor blocks.
struct Producer {
    trees: Arc<dyn TreeStore>,
    chain: LocalChainSource,
    assembler: LocalRollupAssembler,
    next_rollup_id: u64,
}

impl Producer {
    fn new(rollup_size: u32) -> Self {
        Self {
            trees: Arc::new(WorldStateTrees::new()),
            chain: LocalChainSource::new(CHAIN_ID),
            assembler: LocalRollupAssembler::new(rollup_size),
            next_rollup_id: 0,
        }
    }

    async fn produce(&mut self, txs: &[TxDao]) -> Block {
        let assembled = self
            .assembler
            .assemble(self.next_rollup_id, txs, &self.trees)
            .await
            .unwrap();
        self.chain
            .send_rollup_proof(
                assembled.proof_data.to_bytes(),
                assembled.offchain_tx_data,
            )
            .await
            .unwrap();
        let block = self
            .chain
            .get_blocks(self.next_rollup_id)
            .await
            .unwrap()
            .remove(0);
        self.next_rollup_id += 1;
        block
    }
}

fn payment_tx(seed: u8, proof_id: ProofId, asset_id: u32, value: u128, fee: u128) -> TxDao {
    let proof = InnerProofData {
        proof_id,
        public_value: value,
        public_asset_id: asset_id,
        tx_fee: fee,
        note_commitment1: [seed; 32],
        note_commitment2: [seed.wrapping_add(100); 32],
        nullifier1: [seed.wrapping_add(1); 32],
        nullifier2: [seed.wrapping_add(2); 32],
    };
    TxDao {
        id: proof.tx_id(),
        proof_data: proof.to_bytes(),
        offchain_tx_data: Vec::new(),
        nullifier1: Some(proof.nullifier1),
        nullifier2: Some(proof.nullifier2),
        created: 1_000,
        mined: None,
        tx_type: TxType::from_proof_id(proof_id).unwrap(),
        excess_gas: 0,
    }
}

fn defi_tx(seed: u8, bridge_id: BridgeId, deposit_value: u128, tx_fee: u128) -> TxDao {
    let proof = InnerProofData {
        proof_id: ProofId::DefiDeposit,
        public_value: 0,
        public_asset_id: 0,
        tx_fee: 0,
        note_commitment1: [seed; 32],
        note_commitment2: [seed.wrapping_add(100); 32],
        nullifier1: [seed.wrapping_add(1); 32],
        nullifier2: [seed.wrapping_add(2); 32],
    };
    let offchain = OffchainDefiDepositData {
        bridge_id,
        partial_state: [seed.wrapping_add(3); 32],
        partial_state_secret_eph_pub_key: [seed.wrapping_add(4); 64],
        deposit_value,
        tx_fee,
    };
    TxDao {
        id: proof.tx_id(),
        proof_data: proof.to_bytes(),
        offchain_tx_data: offchain.to_bytes(),
        nullifier1: Some(proof.nullifier1),
        nullifier2: Some(proof.nullifier2),
        created: 1_000,
        mined: None,
        tx_type: TxType::DefiDeposit,
        excess_gas: 0,
    }
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

// Cold start against an empty chain leaves empty trees, an empty
// cache, and a running pipeline.
#[tokio::test]
async fn cold_start_without_init_files() {
    let harness = harness();
    harness.world_state.start().await.unwrap();

    let empty = WorldStateTrees::new();
    for tag in [TreeTag::Data, TreeTag::Null, TreeTag::Root, TreeTag::Defi] {
        assert_eq!(
            empty.get_root(tag).await,
            harness.trees_dyn.get_root(tag).await,
            "{tag} tree must stay at its empty root",
        );
    }
    assert!(harness.world_state.get_block_buffers(0).is_empty());
    assert!(harness.pipeline_running().await);
    assert_eq!(0, harness.store.get_next_rollup_id().await.unwrap());

    harness.world_state.stop().await;
    assert!(!harness.pipeline_running().await);
}

// Initial accounts are installed from files and verified against the
// expected roots; three account rows land in the store.
#[tokio::test]
async fn init_from_files_installs_accounts() {
    let accounts: Vec<init::InitAccount> = (0..3u8)
        .map(|i| init::InitAccount {
            alias_hash: [i + 1; 32],
            account_public_key: [i + 10; 64],
            nonce: u32::from(i),
            note_commitments: [[i + 20; 32], [i + 40; 32]],
            nullifiers: vec![[i + 60; 32]],
        })
        .collect();

    // Derive the roots the roster must hash to on a scratch tree.
    let scratch = WorldStateTrees::new();
    for (position, account) in accounts.iter().enumerate() {
        let index = 2 * position as u128;
        scratch.put(TreeTag::Data, index, &account.note_commitments[0]).await.unwrap();
        scratch
            .put(TreeTag::Data, index + 1, &account.note_commitments[1])
            .await
            .unwrap();
        for nullifier in &account.nullifiers {
            scratch
                .put(TreeTag::Null, nullifier_index(nullifier), &one_leaf())
                .await
                .unwrap();
        }
    }
    let data_root = scratch.get_root(TreeTag::Data).await;
    scratch.put(TreeTag::Root, 0, &data_root).await.unwrap();

    let data_dir = tempfile::tempdir().unwrap();
    write_init_files(
        data_dir.path(),
        &accounts,
        scratch.get_root(TreeTag::Data).await,
        scratch.get_root(TreeTag::Null).await,
        scratch.get_root(TreeTag::Root).await,
    );

    let harness = harness_with(ROLLUP_SIZE, data_dir);
    harness.world_state.start().await.unwrap();
    assert_eq!(3, harness.store.account_count().await);
    assert_eq!(
        scratch.get_root(TreeTag::Data).await,
        harness.trees_dyn.get_root(TreeTag::Data).await,
    );
    harness.world_state.stop().await;
}

#[tokio::test]
async fn init_root_mismatch_aborts_startup() {
    let data_dir = tempfile::tempdir().unwrap();
    let accounts = vec![init::InitAccount {
        alias_hash: [1; 32],
        account_public_key: [2; 64],
        nonce: 0,
        note_commitments: [[3; 32], [4; 32]],
        nullifiers: vec![[5; 32]],
    }];
    write_init_files(data_dir.path(), &accounts, [9; 32], [9; 32], [9; 32]);

    let harness = harness_with(ROLLUP_SIZE, data_dir);
    assert!(harness.world_state.start().await.is_err());
}

fn write_init_files(
    data_dir: &std::path::Path,
    accounts: &[init::InitAccount],
    data_root: [u8; 32],
    null_root: [u8; 32],
    roots_root: [u8; 32],
) {
    let base = data_dir.join(format!("init/chain-{CHAIN_ID}"));
    std::fs::create_dir_all(&base).unwrap();
    let accounts_json: Vec<serde_json::Value> = accounts
        .iter()
        .map(|account| {
            serde_json::json!({
                "alias_hash": hex::encode(account.alias_hash),
                "account_public_key": hex::encode(account.account_public_key),
                "nonce": account.nonce,
                "note_commitments": [
                    hex::encode(account.note_commitments[0]),
                    hex::encode(account.note_commitments[1]),
                ],
                "nullifiers": account
                    .nullifiers
                    .iter()
                    .map(hex::encode)
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    std::fs::write(
        base.join("accounts.json"),
        serde_json::to_string(&accounts_json).unwrap(),
    )
    .unwrap();
    std::fs::write(
        base.join("roots.json"),
        serde_json::json!({
            "data_root": hex::encode(data_root),
            "null_root": hex::encode(null_root),
            "roots_root": hex::encode(roots_root),
        })
        .to_string(),
    )
    .unwrap();
}

// Our pipeline publishes, the block comes back, the staged tree
// writes are committed and the rollup is confirmed mined with the
// block's gas accounting.
#[tokio::test]
async fn our_rollup_lands_and_is_confirmed() {
    let harness = harness();
    harness.world_state.start().await.unwrap();

    harness.store.add_tx(payment_tx(1, ProofId::Deposit, 0, 1_000, 10)).await;
    harness.store.add_tx(payment_tx(2, ProofId::Send, 0, 0, 5)).await;
    harness.world_state.flush_txs().await;

    let store = harness.store.clone();
    eventually("our rollup settles", || {
        let store = store.clone();
        async move { store.get_next_rollup_id().await.unwrap() == 1 }
    })
    .await;

    let rollup = harness.store.get_rollup(0).await.unwrap().unwrap();
    assert!(rollup.is_settled());
    assert!(rollup.gas_used.unwrap() > 0);
    assert!(rollup.eth_tx_hash.is_some());

    // The settled block's roots are the committed tree roots.
    let buffers = harness.world_state.get_block_buffers(0);
    assert_eq!(1, buffers.len());
    let block = Block::from_buf(&buffers[0]).unwrap();
    let proof = RollupProofData::from_bytes(&block.rollup_proof_data).unwrap();
    harness.assert_roots_match(&proof).await;

    // Both txs are mined and no longer pending.
    assert!(harness.store.get_pending_txs(10).await.unwrap().is_empty());
    let stored = harness
        .store
        .get_rollup_proof(&rollup.rollup_proof_hash, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(2, stored.txs.len());
    assert!(stored.txs.iter().all(|tx| tx.mined == Some(block.created)));

    harness.world_state.stop().await;
}

// We staged a rollup for the slot but a competitor's block arrives.
// The staged writes are discarded, the competitor's leaves are applied,
// and our proof becomes an orphan swept at the next reset.
#[tokio::test]
async fn competitor_rollup_wins_the_slot() {
    let harness = harness();
    harness.trees_dyn.start().await.unwrap();

    // Simulate the pipeline having staged and published our rollup.
    let our_tx = payment_tx(1, ProofId::Deposit, 0, 500, 5);
    harness.store.add_tx(our_tx.clone()).await;
    let our_assembler = LocalRollupAssembler::new(ROLLUP_SIZE);
    let ours = our_assembler
        .assemble(0, &[our_tx.clone()], &harness.trees_dyn)
        .await
        .unwrap();
    let our_hash = ours.proof_data.rollup_hash();
    harness
        .store
        .add_rollup_proof(
            RollupProofDao {
                rollup_hash: our_hash,
                tx_ids: vec![our_tx.id],
                rollup_size: ROLLUP_SIZE,
                data_start_index: 0,
                proof_data: ours.proof_data.to_bytes(),
                created: 1_000,
            },
            Vec::new(),
        )
        .await
        .unwrap();
    harness
        .store
        .add_rollup(RollupDao {
            id: 0,
            data_root: ours.proof_data.new_data_root,
            rollup_proof_hash: our_hash,
            eth_tx_hash: Some([1; 32]),
            created: 1_000,
            mined: None,
            interaction_result: Vec::new(),
            gas_used: None,
            gas_price: None,
            asset_metrics: Vec::new(),
        })
        .await
        .unwrap();

    // The competitor's block for the same rollup id, different contents.
    let mut competitor = Producer::new(ROLLUP_SIZE);
    let block = competitor.produce(&[payment_tx(9, ProofId::Deposit, 0, 900, 9)]).await;
    let their_proof = RollupProofData::from_bytes(&block.rollup_proof_data).unwrap();
    assert_ne!(our_hash, their_proof.rollup_hash());

    harness.inner().update_dbs(&block).await.unwrap();

    // Trees converged to the competitor's roots.
    harness.assert_roots_match(&their_proof).await;
    let settled = harness.store.get_rollup(0).await.unwrap().unwrap();
    assert!(settled.is_settled());
    assert_eq!(their_proof.rollup_hash(), settled.rollup_proof_hash);

    // Their proof row was rebuilt from the inner proofs.
    let theirs = harness
        .store
        .get_rollup_proof(&their_proof.rollup_hash(), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(1, theirs.txs.len());
    assert_eq!(TxType::Deposit, theirs.txs[0].tx_type);

    // Our proof lost its rollup row and is now an orphan; reset sweeps it.
    assert_eq!(1, harness.store.orphaned_rollup_proof_count().await);
    harness.inner().reset_pipeline().await.unwrap();
    assert_eq!(0, harness.store.orphaned_rollup_proof_count().await);
    assert!(harness.pipeline_running().await);
    harness.inner().stop_pipeline().await;
}

// Defi deposit bookkeeping: inner proof 7 of rollup 2 deposits into
// the bridge at slot 2, so its claim carries interaction nonce
// `2 + 2 * 4` and half the fee rounds onto the claim.
#[tokio::test]
async fn defi_deposit_claims_carry_nonce_and_fee() {
    let harness = harness_with(8, tempfile::tempdir().unwrap());
    harness.trees_dyn.start().await.unwrap();

    let bridges: Vec<BridgeId> = (0..NUM_BRIDGE_CALLS_PER_BLOCK as u32)
        .map(|slot| bridge_id_from_slots(100 + slot, 0, 1, 0))
        .collect();
    let mut producer = Producer::new(8);
    let block0 = producer.produce(&[payment_tx(1, ProofId::Deposit, 0, 100, 1)]).await;
    let block1 = producer.produce(&[payment_tx(2, ProofId::Deposit, 0, 100, 1)]).await;

    // Rollup 2: positions 0..4 claim all four bridge slots in order,
    // positions 4..7 are payments, position 7 deposits into bridge 2.
    let txs = vec![
        defi_tx(10, bridges[0], 100, 2),
        defi_tx(11, bridges[1], 100, 2),
        defi_tx(12, bridges[2], 100, 2),
        defi_tx(13, bridges[3], 100, 2),
        payment_tx(14, ProofId::Send, 0, 0, 1),
        payment_tx(15, ProofId::Send, 0, 0, 1),
        payment_tx(16, ProofId::Send, 0, 0, 1),
        defi_tx(17, bridges[2], 5_000, 10),
    ];
    let block2 = producer.produce(&txs).await;
    let proof2 = RollupProofData::from_bytes(&block2.rollup_proof_data).unwrap();
    assert_eq!(bridges, proof2.bridge_ids.to_vec());

    for block in [&block0, &block1, &block2] {
        harness.inner().update_dbs(block).await.unwrap();
    }

    let expected_leaf = proof2.data_start_index + 14;
    let claims = harness.store.claims().await;
    let claim = claims
        .iter()
        .find(|claim| claim.leaf_index == expected_leaf)
        .expect("position 7 must have minted a claim");
    assert_eq!(2 + 2 * NUM_BRIDGE_CALLS_PER_BLOCK as u64, claim.interaction_nonce);
    assert_eq!(10 - 5, claim.fee);
    assert_eq!(5_000, claim.deposit_value);
    assert_eq!(bridges[2], claim.bridge_id);

    // The loopback chain settles every bridge slot, so each claim is
    // stamped with the rollup that resolved its nonce.
    assert!(claims
        .iter()
        .filter(|claim| claim.interaction_nonce / NUM_BRIDGE_CALLS_PER_BLOCK as u64 == 2)
        .all(|claim| claim.interaction_result_rollup_id == Some(2)));
}

// Reset: pending txs, an unsettled rollup, and staged tree writes
// all disappear; the pipeline is running afterwards.
#[tokio::test]
async fn reset_pipeline_restores_a_clean_slate() {
    let harness = harness();
    harness.trees_dyn.start().await.unwrap();

    let committed_root = harness.trees_dyn.get_root(TreeTag::Data).await;
    for seed in 1..=3u8 {
        harness.store.add_tx(payment_tx(seed, ProofId::Send, 0, 0, 1)).await;
    }
    harness.trees_dyn.put(TreeTag::Data, 0, &[9u8; 32]).await.unwrap();
    harness
        .store
        .add_rollup_proof(
            RollupProofDao {
                rollup_hash: [8; 32],
                tx_ids: vec![[1; 32]],
                rollup_size: ROLLUP_SIZE,
                data_start_index: 0,
                proof_data: Vec::new(),
                created: 0,
            },
            Vec::new(),
        )
        .await
        .unwrap();
    harness
        .store
        .add_rollup(RollupDao {
            id: 0,
            data_root: [0; 32],
            rollup_proof_hash: [8; 32],
            eth_tx_hash: None,
            created: 0,
            mined: None,
            interaction_result: Vec::new(),
            gas_used: None,
            gas_price: None,
            asset_metrics: Vec::new(),
        })
        .await
        .unwrap();

    harness.world_state.reset_pipeline().await.unwrap();

    assert!(harness.pipeline_running().await);
    assert!(harness.store.get_pending_txs(10).await.unwrap().is_empty());
    assert_eq!(0, harness.store.unsettled_rollup_count().await);
    assert_eq!(0, harness.store.orphaned_rollup_proof_count().await);
    assert_eq!(committed_root, harness.trees_dyn.get_root(TreeTag::Data).await);
    harness.inner().stop_pipeline().await;
}

// Replaying a block is a no-op for trees, relational state,
// and the cache.
#[tokio::test]
async fn update_dbs_is_idempotent() {
    let harness = harness();
    harness.trees_dyn.start().await.unwrap();

    let mut producer = Producer::new(ROLLUP_SIZE);
    let block = producer
        .produce(&[
            payment_tx(1, ProofId::Deposit, 0, 700, 7),
            defi_tx(2, bridge_id_from_slots(1, 0, 1, 0), 300, 4),
        ])
        .await;

    harness.inner().update_dbs(&block).await.unwrap();
    let data_root = harness.trees_dyn.get_root(TreeTag::Data).await;
    let data_size = harness.trees_dyn.get_size(TreeTag::Data).await;
    let null_size = harness.trees_dyn.get_size(TreeTag::Null).await;
    let claims = harness.store.claims().await;
    let rollups = harness.store.get_settled_rollups(0).await.unwrap();
    let metrics = harness.store.get_asset_metrics(0).await.unwrap();
    let cache_len = harness.world_state.get_block_buffers(0).len();

    harness.inner().update_dbs(&block).await.unwrap();
    assert_eq!(data_root, harness.trees_dyn.get_root(TreeTag::Data).await);
    assert_eq!(data_size, harness.trees_dyn.get_size(TreeTag::Data).await);
    assert_eq!(null_size, harness.trees_dyn.get_size(TreeTag::Null).await);
    assert_eq!(claims, harness.store.claims().await);
    assert_eq!(rollups, harness.store.get_settled_rollups(0).await.unwrap());
    assert_eq!(metrics, harness.store.get_asset_metrics(0).await.unwrap());
    assert_eq!(cache_len, harness.world_state.get_block_buffers(0).len());
}

// Off-chain blobs pair with non-padding proofs by off-chain
// index, skipping padding positions.
#[tokio::test]
async fn offchain_data_is_indexed_by_real_proof_position() {
    let harness = harness();
    harness.trees_dyn.start().await.unwrap();

    let bridge = bridge_id_from_slots(1, 0, 1, 0);
    let defi = defi_tx(1, bridge, 2_500, 8);
    let payment = payment_tx(2, ProofId::Send, 0, 0, 1);
    let defi_proof = InnerProofData::from_bytes(&defi.proof_data).unwrap();
    let payment_proof = InnerProofData::from_bytes(&payment.proof_data).unwrap();

    // Padding interleaved before and between the real proofs: the defi
    // deposit sits at position 1 but is off-chain blob 0.
    let mut bridge_ids = [[0u8; 32]; NUM_BRIDGE_CALLS_PER_BLOCK];
    bridge_ids[0] = bridge;
    let proof = RollupProofData {
        rollup_id: 0,
        rollup_size: 4,
        data_start_index: 0,
        new_data_root: [1; 32],
        new_null_root: [2; 32],
        new_data_roots_root: [3; 32],
        new_defi_root: [4; 32],
        bridge_ids,
        asset_ids: [UNUSED_ASSET_ID; NUM_ASSETS],
        defi_interaction_notes: [[0; 32]; NUM_BRIDGE_CALLS_PER_BLOCK],
        inner_proofs: vec![
            InnerProofData::padding(),
            defi_proof,
            InnerProofData::padding(),
            payment_proof,
        ],
    };
    let block = Block {
        rollup_id: 0,
        created: 5_000,
        eth_tx_hash: [6; 32],
        rollup_size: 4,
        rollup_proof_data: proof.to_bytes(),
        offchain_tx_data: vec![defi.offchain_tx_data.clone(), Vec::new()],
        interaction_result: Vec::new(),
        gas_used: 1,
        gas_price: [0; 32],
    };

    harness.inner().update_dbs(&block).await.unwrap();

    // The claim derives from blob 0 and sits at the defi proof's
    // position, leaf `2 * 1`.
    let claims = harness.store.claims().await;
    assert_eq!(1, claims.len());
    assert_eq!(2, claims[0].leaf_index);
    assert_eq!(2_500, claims[0].deposit_value);

    // The rebuilt txs keep the same pairing.
    let stored = harness
        .store
        .get_rollup_proof(&proof.rollup_hash(), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(2, stored.txs.len());
    assert_eq!(defi.offchain_tx_data, stored.txs[0].offchain_tx_data);
    assert!(stored.txs[1].offchain_tx_data.is_empty());
}

// A crash after the tree commit but before the relational
// writes recovers to the post-block state with no orphans.
#[tokio::test]
async fn crash_between_tree_and_relational_commit_recovers() {
    let trees_dyn: Arc<dyn TreeStore> = Arc::new(WorldStateTrees::new());
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(LocalChainSource::new(CHAIN_ID));

    // Two blocks settle on-chain from another provider.
    let mut producer = Producer::new(ROLLUP_SIZE);
    let block0 = producer.produce(&[payment_tx(1, ProofId::Deposit, 0, 100, 1)]).await;
    let block1 = producer.produce(&[payment_tx(2, ProofId::Send, 0, 0, 1)]).await;
    chain.push_block(block0.clone()).await.unwrap();
    chain.push_block(block1.clone()).await.unwrap();

    let data_dir = tempfile::tempdir().unwrap();
    let build = || {
        Builder {
            trees: trees_dyn.clone(),
            store: store.clone(),
            chain: chain.clone(),
            note_algorithms: Arc::new(Sha256NoteAlgorithms),
            assembler: Arc::new(LocalRollupAssembler::new(ROLLUP_SIZE)),
            metrics: Metrics::register(),
            data_dir: data_dir.path().to_path_buf(),
            publish_interval: IDLE_PUBLISH_INTERVAL,
            rollup_size: ROLLUP_SIZE,
        }
        .build()
    };

    // First process applies block 0 fully, then "crashes" having
    // committed block 1's trees but none of its relational writes.
    let crashed = build();
    crashed.inner.update_dbs(&block0).await.unwrap();
    let proof1 = RollupProofData::from_bytes(&block1.rollup_proof_data).unwrap();
    crashed.inner.apply_rollup_to_trees(&proof1).await.unwrap();
    assert_eq!(1, store.get_next_rollup_id().await.unwrap());
    drop(crashed);

    // Restart: sync-from-chain replays block 1; the tree guard makes the
    // replay a no-op on the trees, the relational writes are repaired.
    let recovered = build();
    recovered.start().await.unwrap();
    assert_eq!(2, store.get_next_rollup_id().await.unwrap());
    assert_eq!(proof1.new_data_root, trees_dyn.get_root(TreeTag::Data).await);
    assert_eq!(0, store.unsettled_rollup_count().await);
    assert_eq!(0, store.orphaned_rollup_proof_count().await);
    assert_eq!(2, recovered.get_block_buffers(0).len());
    recovered.stop().await;
}

// Startup replays the whole chain into empty trees and the cache is
// prefix-consistent with the settled rollups.
#[tokio::test]
async fn fresh_node_syncs_an_existing_chain() {
    let mut producer = Producer::new(ROLLUP_SIZE);
    let block0 = producer.produce(&[payment_tx(1, ProofId::Deposit, 2, 100, 1)]).await;
    let block1 = producer
        .produce(&[
            payment_tx(2, ProofId::Withdraw, 2, 40, 1),
            payment_tx(3, ProofId::Send, 2, 0, 1),
        ])
        .await;

    let harness = harness();
    harness.chain.push_block(block0).await.unwrap();
    harness.chain.push_block(block1.clone()).await.unwrap();
    harness.chain.set_rollup_balance(2, 60).await;

    harness.world_state.start().await.unwrap();

    assert_eq!(2, harness.store.get_next_rollup_id().await.unwrap());
    let proof1 = RollupProofData::from_bytes(&block1.rollup_proof_data).unwrap();
    harness.assert_roots_match(&proof1).await;

    let buffers = harness.world_state.get_block_buffers(0);
    assert_eq!(2, buffers.len());
    for (index, buffer) in buffers.iter().enumerate() {
        assert_eq!(index as u64, Block::from_buf(buffer).unwrap().rollup_id);
    }
    harness.world_state.stop().await;
}

// Metrics accumulate flows for the rollup's assets and read the
// live contract balance.
#[tokio::test]
async fn asset_metrics_accumulate_across_rollups() {
    let harness = harness();
    harness.trees_dyn.start().await.unwrap();
    harness.chain.set_rollup_balance(0, 1_000).await;

    let mut producer = Producer::new(ROLLUP_SIZE);
    let block0 = producer.produce(&[payment_tx(1, ProofId::Deposit, 0, 700, 7)]).await;
    let block1 = producer
        .produce(&[
            payment_tx(2, ProofId::Deposit, 0, 300, 3),
            payment_tx(3, ProofId::Withdraw, 0, 100, 2),
        ])
        .await;

    harness.inner().update_dbs(&block0).await.unwrap();
    harness.inner().update_dbs(&block1).await.unwrap();

    let metrics = harness.store.get_asset_metrics(0).await.unwrap().unwrap();
    assert_eq!(1, metrics.rollup_id);
    assert_eq!(1_000, metrics.contract_balance);
    assert_eq!(1_000, metrics.total_deposited);
    assert_eq!(100, metrics.total_withdrawn);
    assert_eq!(12, metrics.total_fees);
}
