#![doc = include_str!("../README.md")]

use std::collections::HashMap;

use sha2::{
    Digest as _,
    Sha256,
};

/// Domain prefix for leaf hashes.
const LEAF_PREFIX: [u8; 1] = [0x00];
/// Domain prefix for internal node hashes.
const NODE_PREFIX: [u8; 1] = [0x01];

/// The deepest tree this crate supports. Leaf indices are `u128`, so paths
/// longer than 128 bits cannot be addressed.
pub const MAX_DEPTH: u32 = 128;

/// Hashes `leaf` into its 32-byte leaf node, domain-separated from
/// internal nodes.
#[must_use]
pub fn hash_leaf(leaf: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(LEAF_PREFIX);
    hasher.update(leaf);
    hasher.finalize().into()
}

fn combine(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(NODE_PREFIX);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("tree depth {depth} exceeds the supported maximum of {MAX_DEPTH}")]
    DepthTooLarge { depth: u32 },
    #[error("leaf index {index} does not fit a depth-{depth} tree")]
    IndexOutOfRange { index: u128, depth: u32 },
}

/// One layer of tree state: node hashes keyed by `(level, index)`, where
/// level 0 holds leaf hashes and level `depth` holds the root.
#[derive(Debug, Default, Clone)]
struct Layer {
    nodes: HashMap<(u32, u128), [u8; 32]>,
    next_index: u128,
    leaf_count: u64,
}

/// A fixed-depth sparse Merkle tree with a staged-write overlay.
///
/// Readers observe the union of the committed layer and the staged layer;
/// [`SparseTree::commit`] folds the staged layer into the committed one and
/// [`SparseTree::rollback`] discards it.
#[derive(Debug)]
pub struct SparseTree {
    depth: u32,
    /// `empty_hashes[level]` is the hash of a fully-empty subtree whose
    /// leaves sit `level` levels below it.
    empty_hashes: Vec<[u8; 32]>,
    committed: Layer,
    staged: Layer,
}

impl SparseTree {
    /// Creates an empty tree of the given depth.
    ///
    /// # Errors
    /// Returns an error if `depth` exceeds [`MAX_DEPTH`].
    pub fn new(depth: u32) -> Result<Self, Error> {
        if depth > MAX_DEPTH {
            return Err(Error::DepthTooLarge {
                depth,
            });
        }
        let mut empty_hashes = Vec::with_capacity(depth as usize + 1);
        empty_hashes.push(hash_leaf(&[0u8; 32]));
        for level in 0..depth as usize {
            let child = empty_hashes[level];
            empty_hashes.push(combine(&child, &child));
        }
        Ok(Self {
            depth,
            empty_hashes,
            committed: Layer::default(),
            staged: Layer::default(),
        })
    }

    fn node(&self, level: u32, index: u128) -> [u8; 32] {
        self.staged
            .nodes
            .get(&(level, index))
            .or_else(|| self.committed.nodes.get(&(level, index)))
            .copied()
            .unwrap_or(self.empty_hashes[level as usize])
    }

    fn committed_node(&self, level: u32, index: u128) -> [u8; 32] {
        self.committed
            .nodes
            .get(&(level, index))
            .copied()
            .unwrap_or(self.empty_hashes[level as usize])
    }

    /// Stages `leaf` at `index`, rehashing the path to the root in the
    /// staged layer.
    ///
    /// # Errors
    /// Returns an error if `index` does not fit the tree's depth.
    pub fn put(&mut self, index: u128, leaf: &[u8]) -> Result<(), Error> {
        if self.depth < MAX_DEPTH && index >> self.depth != 0 {
            return Err(Error::IndexOutOfRange {
                index,
                depth: self.depth,
            });
        }
        let is_new_leaf = !self.staged.nodes.contains_key(&(0, index))
            && !self.committed.nodes.contains_key(&(0, index));
        self.staged.nodes.insert((0, index), hash_leaf(leaf));
        let mut child = index;
        for level in 0..self.depth {
            let parent = child >> 1;
            let hash = combine(&self.node(level, parent << 1), &self.node(level, (parent << 1) | 1));
            self.staged.nodes.insert((level + 1, parent), hash);
            child = parent;
        }
        if is_new_leaf {
            self.staged.leaf_count += 1;
        }
        self.staged.next_index = self.staged.next_index.max(index.saturating_add(1));
        Ok(())
    }

    /// The root over committed and staged writes.
    #[must_use]
    pub fn root(&self) -> [u8; 32] {
        self.node(self.depth, 0)
    }

    /// The root over committed writes only.
    #[must_use]
    pub fn committed_root(&self) -> [u8; 32] {
        self.committed_node(self.depth, 0)
    }

    /// One past the highest written leaf index, staged writes included.
    #[must_use]
    pub fn size(&self) -> u128 {
        self.committed.next_index.max(self.staged.next_index)
    }

    /// The number of distinct leaves ever written, staged writes included.
    #[must_use]
    pub fn leaf_count(&self) -> u64 {
        self.committed.leaf_count + self.staged.leaf_count
    }

    /// Whether any writes are staged.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.staged.nodes.is_empty()
    }

    /// Folds the staged layer into the committed layer.
    pub fn commit(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        self.committed.nodes.extend(staged.nodes);
        self.committed.leaf_count += staged.leaf_count;
        if staged.next_index > self.committed.next_index {
            self.committed.next_index = staged.next_index;
        }
    }

    /// Discards the staged layer.
    pub fn rollback(&mut self) {
        self.staged = Layer::default();
    }
}
