//! # fennec-sequencer
//!
//! The rollup service. Its heart is the [`world_state::WorldState`]
//! synchronizer: it ingests settled blocks from the chain source strictly
//! in rollup-id order, reconciles the four authenticated world-state trees
//! and the relational store against each block (committing our own staged
//! rollups, replaying competitors'), and coordinates the publish
//! [`pipeline`] around every block event. Clients catch up from the
//! [`block_cache`]; recovery at startup sweeps unsettled rollups and
//! orphaned proofs so a crash at any point converges to a consistent
//! state.

pub mod block_cache;
pub mod chain;
pub mod config;
pub mod init;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod trees;
pub(crate) mod util;
pub mod world_state;

pub use config::Config;
pub use world_state::WorldState;
