//! Publish deadline bookkeeping for the pipeline.

use std::{
    collections::HashMap,
    time::Duration,
};

use fennec_core::{
    dao::TxDao,
    defi::{
        BridgeId,
        OffchainDefiDepositData,
    },
    proof::TxType,
};

/// The deadlines the pipeline is working towards: one for the pool as a
/// whole, one per bridge with pending defi deposits. All values are unix
/// milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishTimes {
    pub base_timeout: Option<u64>,
    pub bridge_timeouts: HashMap<BridgeId, u64>,
}

/// A read-only snapshot of the pending pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxPoolProfile {
    pub pending_tx_count: u64,
    pub pending_bridge_counts: HashMap<BridgeId, u64>,
}

/// Derives deadlines and pool profiles from the pending transactions.
#[derive(Debug, Clone, Copy)]
pub(super) struct PublishTimeManager {
    publish_interval: Duration,
}

impl PublishTimeManager {
    pub(super) fn new(publish_interval: Duration) -> Self {
        Self {
            publish_interval,
        }
    }

    /// A transaction's publish deadline is its pool-entry time plus the
    /// publish interval; the pool deadline is the oldest transaction's.
    pub(super) fn publish_times(&self, pending: &[TxDao]) -> PublishTimes {
        let interval = u64::try_from(self.publish_interval.as_millis()).unwrap_or(u64::MAX);
        let base_timeout = pending
            .iter()
            .map(|tx| tx.created)
            .min()
            .map(|oldest| oldest.saturating_add(interval));
        let mut bridge_timeouts: HashMap<BridgeId, u64> = HashMap::new();
        for (bridge_id, tx) in pending_bridge_txs(pending) {
            let deadline = tx.created.saturating_add(interval);
            bridge_timeouts
                .entry(bridge_id)
                .and_modify(|current| *current = (*current).min(deadline))
                .or_insert(deadline);
        }
        PublishTimes {
            base_timeout,
            bridge_timeouts,
        }
    }

    pub(super) fn profile(&self, pending: &[TxDao]) -> TxPoolProfile {
        let mut pending_bridge_counts: HashMap<BridgeId, u64> = HashMap::new();
        for (bridge_id, _) in pending_bridge_txs(pending) {
            *pending_bridge_counts.entry(bridge_id).or_insert(0) += 1;
        }
        TxPoolProfile {
            pending_tx_count: pending.len() as u64,
            pending_bridge_counts,
        }
    }
}

/// Pending defi deposits paired with their bridge, read from the off-chain
/// payload. Transactions with unreadable payloads are skipped; they cannot
/// be rolled up anyway.
fn pending_bridge_txs(pending: &[TxDao]) -> impl Iterator<Item = (BridgeId, &TxDao)> {
    pending
        .iter()
        .filter(|tx| tx.tx_type == TxType::DefiDeposit)
        .filter_map(|tx| {
            OffchainDefiDepositData::from_bytes(&tx.offchain_tx_data)
                .ok()
                .map(|data| (data.bridge_id, tx))
        })
}

#[cfg(test)]
mod tests {
    use fennec_core::defi::bridge_id_from_slots;

    use super::*;

    fn tx(seed: u8, created: u64, tx_type: TxType, offchain: Vec<u8>) -> TxDao {
        TxDao {
            id: [seed; 32],
            proof_data: Vec::new(),
            offchain_tx_data: offchain,
            nullifier1: None,
            nullifier2: None,
            created,
            mined: None,
            tx_type,
            excess_gas: 0,
        }
    }

    fn defi_offchain(bridge_id: BridgeId) -> Vec<u8> {
        OffchainDefiDepositData {
            bridge_id,
            partial_state: [0; 32],
            partial_state_secret_eph_pub_key: [0; 64],
            deposit_value: 100,
            tx_fee: 10,
        }
        .to_bytes()
    }

    #[test]
    fn empty_pool_has_no_deadlines() {
        let manager = PublishTimeManager::new(Duration::from_secs(10));
        let times = manager.publish_times(&[]);
        assert_eq!(None, times.base_timeout);
        assert!(times.bridge_timeouts.is_empty());
    }

    #[test]
    fn oldest_tx_sets_the_base_deadline() {
        let manager = PublishTimeManager::new(Duration::from_secs(10));
        let pending = vec![
            tx(1, 5_000, TxType::Transfer, Vec::new()),
            tx(2, 1_000, TxType::Deposit, Vec::new()),
        ];
        assert_eq!(Some(11_000), manager.publish_times(&pending).base_timeout);
    }

    #[test]
    fn bridges_get_their_own_deadlines() {
        let manager = PublishTimeManager::new(Duration::from_secs(10));
        let bridge_a = bridge_id_from_slots(1, 0, 0, 0);
        let bridge_b = bridge_id_from_slots(2, 0, 0, 0);
        let pending = vec![
            tx(1, 3_000, TxType::DefiDeposit, defi_offchain(bridge_a)),
            tx(2, 1_000, TxType::DefiDeposit, defi_offchain(bridge_a)),
            tx(3, 8_000, TxType::DefiDeposit, defi_offchain(bridge_b)),
            tx(4, 0, TxType::Transfer, Vec::new()),
        ];
        let times = manager.publish_times(&pending);
        assert_eq!(Some(&11_000), times.bridge_timeouts.get(&bridge_a));
        assert_eq!(Some(&18_000), times.bridge_timeouts.get(&bridge_b));

        let profile = manager.profile(&pending);
        assert_eq!(4, profile.pending_tx_count);
        assert_eq!(Some(&2), profile.pending_bridge_counts.get(&bridge_a));
        assert_eq!(Some(&1), profile.pending_bridge_counts.get(&bridge_b));
    }
}
