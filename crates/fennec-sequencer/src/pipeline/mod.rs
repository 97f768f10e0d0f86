//! The rollup-construction pipeline.
//!
//! A pipeline instance is a single long-running task: it watches the
//! pending pool, and at each safe point decides whether to publish. The
//! synchronizer stops it before reconciling a block and starts a fresh
//! one afterwards, so pipeline writes never interleave with block
//! ingestion. Everything the pipeline persists is unsettled (a tentative
//! proof row plus an unmined rollup row), leaving `delete_unsettled_rollups`
//! and a tree rollback sufficient to erase it.

use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::Duration,
};

use eyre::WrapErr as _;
use fennec_core::dao::{
    RollupDao,
    RollupProofDao,
    TxDao,
};
use tokio::{
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    instrument,
    warn,
};

mod assembler;
mod publish_time;

pub use assembler::{
    AssembledRollup,
    LocalRollupAssembler,
    RollupAssembler,
};
pub use publish_time::{
    PublishTimes,
    TxPoolProfile,
};
use publish_time::PublishTimeManager;

use crate::{
    chain::ChainSource,
    storage::RollupStore,
    trees::TreeStore,
    util::now_millis,
};

/// How often the pipeline wakes to reassess the pool between deadlines.
const SAFE_POINT_CADENCE: Duration = Duration::from_millis(25);

/// Creates pipeline instances. The synchronizer discards a pipeline on
/// every block and asks the factory for a fresh one.
pub struct PipelineFactory {
    store: Arc<dyn RollupStore>,
    chain: Arc<dyn ChainSource>,
    trees: Arc<dyn TreeStore>,
    assembler: Arc<dyn RollupAssembler>,
    publish_interval: Duration,
    rollup_size: u32,
}

impl PipelineFactory {
    #[must_use]
    pub fn new(
        store: Arc<dyn RollupStore>,
        chain: Arc<dyn ChainSource>,
        trees: Arc<dyn TreeStore>,
        assembler: Arc<dyn RollupAssembler>,
        publish_interval: Duration,
        rollup_size: u32,
    ) -> Self {
        Self {
            store,
            chain,
            trees,
            assembler,
            publish_interval,
            rollup_size,
        }
    }

    /// Spawns a new pipeline task and returns its handle immediately.
    ///
    /// # Errors
    /// Returns an error if the next rollup id cannot be read.
    pub async fn start_new(&self) -> eyre::Result<Pipeline> {
        let next_rollup_id = self
            .store
            .get_next_rollup_id()
            .await
            .wrap_err("failed reading next rollup id for new pipeline")?;
        let shared = Arc::new(Shared::default());
        let cancellation = CancellationToken::new();
        let runner = Runner {
            store: self.store.clone(),
            chain: self.chain.clone(),
            trees: self.trees.clone(),
            assembler: self.assembler.clone(),
            publish_time_manager: PublishTimeManager::new(self.publish_interval),
            rollup_size: self.rollup_size,
            next_rollup_id,
            shared: shared.clone(),
            cancellation: cancellation.clone(),
        };
        let task = tokio::spawn(runner.run_until_stopped());
        Ok(Pipeline {
            shared,
            cancellation,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }
}

#[derive(Default)]
struct Shared {
    flush_requested: AtomicBool,
    flush: tokio::sync::Notify,
    publish_times: Mutex<PublishTimes>,
    profile: Mutex<TxPoolProfile>,
}

/// Handle to a running pipeline task.
pub struct Pipeline {
    shared: Arc<Shared>,
    cancellation: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Stops the pipeline at its next safe point and waits for the task
    /// to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if task.await.is_err() {
                warn!("pipeline task panicked before exiting");
            }
        }
    }

    /// Requests a publish of whatever is pending at the next safe point.
    pub fn flush_txs(&self) {
        self.shared.flush_requested.store(true, Ordering::SeqCst);
        self.shared.flush.notify_one();
    }

    #[must_use]
    pub fn get_next_publish_time(&self) -> PublishTimes {
        self.shared
            .publish_times
            .lock()
            .expect("publish times lock must not be poisoned")
            .clone()
    }

    #[must_use]
    pub fn get_tx_pool_profile(&self) -> TxPoolProfile {
        self.shared
            .profile
            .lock()
            .expect("pool profile lock must not be poisoned")
            .clone()
    }
}

struct Runner {
    store: Arc<dyn RollupStore>,
    chain: Arc<dyn ChainSource>,
    trees: Arc<dyn TreeStore>,
    assembler: Arc<dyn RollupAssembler>,
    publish_time_manager: PublishTimeManager,
    rollup_size: u32,
    next_rollup_id: u64,
    shared: Arc<Shared>,
    cancellation: CancellationToken,
}

impl Runner {
    /// The pipeline loop. Failures are logged and end the task; the
    /// synchronizer starts a fresh pipeline on the next block, and the
    /// unsettled rows this task may have written are swept at reset or
    /// recovery.
    async fn run_until_stopped(mut self) {
        let mut safe_point = tokio::time::interval(SAFE_POINT_CADENCE);
        let reason = loop {
            select!(
                biased;

                () = self.cancellation.cancelled() => {
                    break Ok("received stop signal");
                }

                () = self.shared.flush.notified() => {}

                _ = safe_point.tick() => {}
            );
            match self.step().await {
                Ok(()) => {}
                Err(error) => break Err(error),
            }
        };
        match reason {
            Ok(reason) => info!(reason, "pipeline exiting"),
            Err(error) => error!(%error, "pipeline exiting with error"),
        }
    }

    async fn step(&mut self) -> eyre::Result<()> {
        let pending = self
            .store
            .get_pending_txs(self.rollup_size as usize)
            .await
            .wrap_err("failed reading pending txs")?;

        let publish_times = self.publish_time_manager.publish_times(&pending);
        let deadline_due = publish_times
            .base_timeout
            .is_some_and(|deadline| deadline <= now_millis());
        *self
            .shared
            .publish_times
            .lock()
            .expect("publish times lock must not be poisoned") = publish_times;
        *self
            .shared
            .profile
            .lock()
            .expect("pool profile lock must not be poisoned") =
            self.publish_time_manager.profile(&pending);

        let flush = self.shared.flush_requested.swap(false, Ordering::SeqCst);
        if pending.is_empty() || !(flush || deadline_due) {
            return Ok(());
        }

        self.publish(&pending).await
    }

    #[instrument(skip_all, fields(rollup_id = self.next_rollup_id, txs = pending.len()), err)]
    async fn publish(&mut self, pending: &[TxDao]) -> eyre::Result<()> {
        let assembled = self
            .assembler
            .assemble(self.next_rollup_id, pending, &self.trees)
            .await
            .wrap_err("failed assembling rollup proof")?;
        let proof_data = &assembled.proof_data;
        let rollup_hash = proof_data.rollup_hash();
        let created = now_millis();

        // Tentative rows only: the rollup is unsettled until the block
        // comes back from the chain and update-dbs confirms it.
        self.store
            .add_rollup_proof(
                RollupProofDao {
                    rollup_hash,
                    tx_ids: pending.iter().map(|tx| tx.id).collect(),
                    rollup_size: proof_data.rollup_size,
                    data_start_index: proof_data.data_start_index,
                    proof_data: proof_data.to_bytes(),
                    created,
                },
                Vec::new(),
            )
            .await
            .wrap_err("failed recording tentative rollup proof")?;

        let eth_tx_hash = self
            .chain
            .send_rollup_proof(proof_data.to_bytes(), assembled.offchain_tx_data.clone())
            .await
            .wrap_err("failed publishing rollup proof")?;

        self.store
            .add_rollup(RollupDao {
                id: proof_data.rollup_id,
                data_root: proof_data.new_data_root,
                rollup_proof_hash: rollup_hash,
                eth_tx_hash: Some(eth_tx_hash),
                created,
                mined: None,
                interaction_result: Vec::new(),
                gas_used: None,
                gas_price: None,
                asset_metrics: Vec::new(),
            })
            .await
            .wrap_err("failed recording unsettled rollup")?;

        info!(
            rollup_id = proof_data.rollup_id,
            rollup_hash = %hex::encode(rollup_hash),
            eth_tx_hash = %hex::encode(eth_tx_hash),
            "published rollup proof",
        );
        self.next_rollup_id += 1;
        Ok(())
    }
}
