//! A cache of serialized settled blocks served to catching-up clients.

use std::sync::RwLock;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("rollup id {rollup_id} would leave a gap in the block cache of length {len}")]
    Gap { rollup_id: u64, len: u64 },
}

/// Ordered block buffers indexed by rollup id.
///
/// The cache is rebuilt from the relational store at startup and is
/// append-only afterwards; re-inserting an existing id replaces the buffer
/// in place so block replay stays idempotent. The stored prefix always
/// mirrors the settled rollups in id order.
#[derive(Debug, Default)]
pub struct BlockCache {
    inner: RwLock<Vec<Vec<u8>>>,
}

impl BlockCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cache contents with `buffers`, in rollup-id order.
    pub fn reset(&self, buffers: Vec<Vec<u8>>) {
        *self.inner.write().expect("block cache lock must not be poisoned") = buffers;
    }

    /// Inserts `buffer` at `rollup_id`, replacing an existing entry.
    ///
    /// # Errors
    /// Returns an error if `rollup_id` would leave a gap; blocks are
    /// handled strictly in order, so a gap means the caller skipped one.
    pub fn insert(&self, rollup_id: u64, buffer: Vec<u8>) -> Result<(), Error> {
        let mut inner = self.inner.write().expect("block cache lock must not be poisoned");
        let len = inner.len() as u64;
        if rollup_id > len {
            return Err(Error::Gap {
                rollup_id,
                len,
            });
        }
        if rollup_id == len {
            inner.push(buffer);
        } else {
            inner[usize::try_from(rollup_id).expect("rollup id below cache length")] = buffer;
        }
        Ok(())
    }

    /// Returns the buffers from `from` onwards.
    #[must_use]
    pub fn get_from(&self, from: u64) -> Vec<Vec<u8>> {
        let inner = self.inner.read().expect("block cache lock must not be poisoned");
        let from = usize::try_from(from).unwrap_or(usize::MAX).min(inner.len());
        inner[from..].to_vec()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.read().expect("block cache lock must not be poisoned").len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
