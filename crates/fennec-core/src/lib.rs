//! # fennec-core
//!
//! The data model shared between rollup clients and the sequencer: blocks
//! observed on-chain, the rollup proof byte layout, defi interaction data,
//! the relational row types the sequencer persists, and the note-hashing
//! boundary.
//!
//! The byte codecs in [`proof`], [`defi`], and [`block`] are consensus
//! critical and bit-exact: the same decoder runs in clients and in the
//! sequencer, and `encode` followed by `decode` is the identity.

pub mod block;
pub(crate) mod codec;
pub use codec::DecodeError;
pub mod dao;
pub mod defi;
pub mod notes;
pub mod proof;

/// Number of bridge interaction slots per rollup.
pub const NUM_BRIDGE_CALLS_PER_BLOCK: usize = 4;

/// Number of asset id slots in a rollup header.
pub const NUM_ASSETS: usize = 16;

/// Sentinel marking an unused asset slot.
pub const UNUSED_ASSET_ID: u32 = 1 << 30;

/// Width of one field element on the wire.
pub const WORD_SIZE: usize = 32;
