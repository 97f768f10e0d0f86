//! Crate-specific metrics functionality.
//!
//! Registers metrics and lists constants to be used as metric names
//! throughout the crate.

use std::time::Duration;

use metrics::{
    counter,
    describe_counter,
    describe_histogram,
    histogram,
    Counter,
    Histogram,
    Unit,
};

pub const PROCESS_BLOCK_DURATION_SECONDS: &str =
    "fennec_sequencer_process_block_duration_seconds";
pub const TX_SETTLEMENT_DURATION_MILLISECONDS: &str =
    "fennec_sequencer_tx_settlement_duration_milliseconds";
pub const ROLLUPS_RECEIVED_COUNT: &str = "fennec_sequencer_rollups_received_count";

/// Handles to the sequencer's metrics, registered once and shared as a
/// `&'static` reference.
pub struct Metrics {
    process_block_duration: Histogram,
    tx_settlement_duration: Histogram,
    rollups_received: Counter,
}

impl Metrics {
    /// Describes and registers all metrics, leaking the handle struct for
    /// the lifetime of the process.
    #[must_use]
    pub fn register() -> &'static Self {
        describe_histogram!(
            PROCESS_BLOCK_DURATION_SECONDS,
            Unit::Seconds,
            "The time spent reconciling trees and relational state against one settled block"
        );
        describe_histogram!(
            TX_SETTLEMENT_DURATION_MILLISECONDS,
            Unit::Milliseconds,
            "Per-transaction duration from pool entry to on-chain settlement"
        );
        describe_counter!(
            ROLLUPS_RECEIVED_COUNT,
            Unit::Count,
            "The number of settled rollups ingested from the chain source"
        );
        Box::leak(Box::new(Self {
            process_block_duration: histogram!(PROCESS_BLOCK_DURATION_SECONDS),
            tx_settlement_duration: histogram!(TX_SETTLEMENT_DURATION_MILLISECONDS),
            rollups_received: counter!(ROLLUPS_RECEIVED_COUNT),
        }))
    }

    pub fn record_process_block_duration(&self, duration: Duration) {
        self.process_block_duration.record(duration.as_secs_f64());
    }

    pub fn record_tx_settlement_duration(&self, millis: u64) {
        #[allow(clippy::cast_precision_loss)]
        self.tx_settlement_duration.record(millis as f64);
    }

    pub fn increment_rollups_received(&self) {
        self.rollups_received.increment(1);
    }
}
