//! The world-state tree store: four authenticated trees whose committed
//! roots must track the roots published by settled rollups.

use async_trait::async_trait;
use eyre::WrapErr as _;
use fennec_core::{
    proof::InnerProofData,
    NUM_BRIDGE_CALLS_PER_BLOCK,
};
use fennec_merkle::SparseTree;
use tokio::sync::Mutex;

/// Selects one of the four world-state trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeTag {
    /// Note commitments, appended two per transaction.
    Data,
    /// Spent nullifiers, keyed by the nullifier value.
    Null,
    /// Historic data-tree roots, one per rollup.
    Root,
    /// Defi interaction note commitments, keyed by interaction nonce.
    Defi,
}

impl std::fmt::Display for TreeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            TreeTag::Data => "data",
            TreeTag::Null => "null",
            TreeTag::Root => "root",
            TreeTag::Defi => "defi",
        };
        f.write_str(tag)
    }
}

/// The capability set the synchronizer requires of a tree backend.
///
/// All mutating calls are serialized by a single writer. Reads observe the
/// last committed state plus the current writer's staged writes; `commit`
/// durably persists every staged write across all four trees atomically,
/// `rollback` discards them. A failed `put` is fatal to the caller.
#[async_trait]
pub trait TreeStore: Send + Sync {
    async fn start(&self) -> eyre::Result<()>;

    async fn stop(&self) -> eyre::Result<()>;

    async fn get_size(&self, tag: TreeTag) -> u64;

    async fn get_root(&self, tag: TreeTag) -> [u8; 32];

    async fn put(&self, tag: TreeTag, index: u128, leaf: &[u8]) -> eyre::Result<()>;

    async fn commit(&self) -> eyre::Result<()>;

    async fn rollback(&self) -> eyre::Result<()>;
}

/// Reduces a 32-byte big-endian nullifier to its tree index.
#[must_use]
pub fn nullifier_index(nullifier: &[u8; 32]) -> u128 {
    let mut high = [0u8; 16];
    high.copy_from_slice(&nullifier[..16]);
    u128::from_be_bytes(high)
}

/// The 32-byte big-endian `1` marking a spent nullifier.
#[must_use]
pub fn one_leaf() -> [u8; 32] {
    let mut leaf = [0u8; 32];
    leaf[31] = 1;
    leaf
}

/// Stages the tree effects of one rollup without committing them: data
/// leaves two per inner-proof position, nonzero nullifiers, the new data
/// root into the roots tree, and nonzero defi interaction notes into
/// their nonce slots.
pub async fn stage_rollup_leaves(
    trees: &dyn TreeStore,
    rollup_id: u64,
    data_start_index: u64,
    inner_proofs: &[InnerProofData],
    defi_interaction_notes: &[[u8; 32]; NUM_BRIDGE_CALLS_PER_BLOCK],
) -> eyre::Result<()> {
    for (position, proof) in inner_proofs.iter().enumerate() {
        if proof.is_padding() {
            continue;
        }
        let leaf_index = u128::from(data_start_index) + 2 * position as u128;
        trees.put(TreeTag::Data, leaf_index, &proof.note_commitment1).await?;
        trees
            .put(TreeTag::Data, leaf_index + 1, &proof.note_commitment2)
            .await?;
        for nullifier in [&proof.nullifier1, &proof.nullifier2] {
            if *nullifier != [0u8; 32] {
                trees
                    .put(TreeTag::Null, nullifier_index(nullifier), &one_leaf())
                    .await?;
            }
        }
    }
    let data_root = trees.get_root(TreeTag::Data).await;
    trees
        .put(TreeTag::Root, u128::from(rollup_id) + 1, &data_root)
        .await?;
    for (slot, note) in defi_interaction_notes.iter().enumerate() {
        if *note == [0u8; 32] {
            continue;
        }
        let index =
            u128::from(rollup_id) * NUM_BRIDGE_CALLS_PER_BLOCK as u128 + slot as u128;
        trees.put(TreeTag::Defi, index, note).await?;
    }
    Ok(())
}

struct Trees {
    data: SparseTree,
    null: SparseTree,
    root: SparseTree,
    defi: SparseTree,
}

impl Trees {
    fn tree(&self, tag: TreeTag) -> &SparseTree {
        match tag {
            TreeTag::Data => &self.data,
            TreeTag::Null => &self.null,
            TreeTag::Root => &self.root,
            TreeTag::Defi => &self.defi,
        }
    }

    fn tree_mut(&mut self, tag: TreeTag) -> &mut SparseTree {
        match tag {
            TreeTag::Data => &mut self.data,
            TreeTag::Null => &mut self.null,
            TreeTag::Root => &mut self.root,
            TreeTag::Defi => &mut self.defi,
        }
    }
}

/// In-memory [`TreeStore`] over four [`SparseTree`]s: data, root, and defi
/// trees of depth 32 and a depth-128 nullifier tree.
pub struct WorldStateTrees {
    inner: Mutex<Trees>,
}

impl WorldStateTrees {
    /// # Panics
    /// The tree depths are compile-time constants within the supported
    /// range, so construction cannot actually fail.
    #[must_use]
    pub fn new() -> Self {
        let build = |depth| {
            SparseTree::new(depth).expect("tree depths are static and within bounds")
        };
        Self {
            inner: Mutex::new(Trees {
                data: build(32),
                null: build(128),
                root: build(32),
                defi: build(32),
            }),
        }
    }
}

impl Default for WorldStateTrees {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TreeStore for WorldStateTrees {
    async fn start(&self) -> eyre::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> eyre::Result<()> {
        Ok(())
    }

    async fn get_size(&self, tag: TreeTag) -> u64 {
        let inner = self.inner.lock().await;
        match tag {
            // The nullifier tree is sparse; its size is the number of
            // nullifiers inserted, not the highest index.
            TreeTag::Null => inner.tree(tag).leaf_count(),
            _ => u64::try_from(inner.tree(tag).size()).unwrap_or(u64::MAX),
        }
    }

    async fn get_root(&self, tag: TreeTag) -> [u8; 32] {
        self.inner.lock().await.tree(tag).root()
    }

    async fn put(&self, tag: TreeTag, index: u128, leaf: &[u8]) -> eyre::Result<()> {
        self.inner
            .lock()
            .await
            .tree_mut(tag)
            .put(index, leaf)
            .wrap_err_with(|| format!("failed writing leaf {index} to the {tag} tree"))
    }

    async fn commit(&self) -> eyre::Result<()> {
        let mut inner = self.inner.lock().await;
        for tag in [TreeTag::Data, TreeTag::Null, TreeTag::Root, TreeTag::Defi] {
            inner.tree_mut(tag).commit();
        }
        Ok(())
    }

    async fn rollback(&self) -> eyre::Result<()> {
        let mut inner = self.inner.lock().await;
        for tag in [TreeTag::Data, TreeTag::Null, TreeTag::Root, TreeTag::Defi] {
            inner.tree_mut(tag).rollback();
        }
        Ok(())
    }
}
