use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use fennec_core::notes::NoteAlgorithms;
use tokio_util::sync::CancellationToken;

use super::{
    Inner,
    WorldState,
};
use crate::{
    block_cache::BlockCache,
    chain::ChainSource,
    metrics::Metrics,
    pipeline::{
        PipelineFactory,
        RollupAssembler,
    },
    queue::BlockQueue,
    storage::RollupStore,
    trees::TreeStore,
};

pub struct Builder {
    pub trees: Arc<dyn TreeStore>,
    pub store: Arc<dyn RollupStore>,
    pub chain: Arc<dyn ChainSource>,
    pub note_algorithms: Arc<dyn NoteAlgorithms>,
    pub assembler: Arc<dyn RollupAssembler>,
    pub metrics: &'static Metrics,
    pub data_dir: PathBuf,
    pub publish_interval: Duration,
    pub rollup_size: u32,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> WorldState {
        let Self {
            trees,
            store,
            chain,
            note_algorithms,
            assembler,
            metrics,
            data_dir,
            publish_interval,
            rollup_size,
        } = self;
        let pipeline_factory = PipelineFactory::new(
            store.clone(),
            chain.clone(),
            trees.clone(),
            assembler,
            publish_interval,
            rollup_size,
        );
        WorldState {
            inner: Arc::new(Inner {
                trees,
                store,
                chain,
                note_algorithms,
                pipeline_factory,
                metrics,
                data_dir,
                block_cache: BlockCache::new(),
                queue: BlockQueue::new(),
                pipeline: tokio::sync::Mutex::new(None),
                forwarder: tokio::sync::Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}
