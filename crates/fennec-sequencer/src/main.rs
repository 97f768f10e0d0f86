use std::{
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use eyre::WrapErr as _;
use fennec_core::notes::Sha256NoteAlgorithms;
use fennec_sequencer::{
    chain::LocalChainSource,
    metrics::Metrics,
    pipeline::LocalRollupAssembler,
    storage::MemoryStore,
    trees::WorldStateTrees,
    world_state,
    Config,
};
use tokio::{
    select,
    signal::unix::{
        signal,
        SignalKind,
    },
};
use tracing::{
    error,
    info,
};
use tracing_subscriber::EnvFilter;

// Following the BSD convention for failing to read config.
const EX_CONFIG: u8 = 78;

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match Config::get().wrap_err("failed reading config") {
        Err(error) => {
            eprintln!("failed to start sequencer:\n{error}");
            return ExitCode::from(EX_CONFIG);
        }
        Ok(cfg) => cfg,
    };

    if let Err(error) = init_tracing(&cfg.log) {
        eprintln!("failed to setup telemetry:\n{error}");
        return ExitCode::FAILURE;
    }
    info!(
        config = serde_json::to_string(&cfg).expect("config serializes to json"),
        "initializing sequencer"
    );

    let metrics = Metrics::register();
    let world_state = world_state::Builder {
        trees: Arc::new(WorldStateTrees::new()),
        store: Arc::new(MemoryStore::new()),
        chain: Arc::new(LocalChainSource::new(cfg.chain_id)),
        note_algorithms: Arc::new(Sha256NoteAlgorithms),
        assembler: Arc::new(LocalRollupAssembler::new(cfg.rollup_size)),
        metrics,
        data_dir: cfg.data_dir.clone(),
        publish_interval: Duration::from_millis(cfg.publish_interval_ms),
        rollup_size: cfg.rollup_size,
    }
    .build();

    if let Err(error) = world_state.start().await {
        error!(%error, "failed starting world state");
        return ExitCode::FAILURE;
    }

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            error!(%error, "failed installing SIGTERM handler");
            return ExitCode::FAILURE;
        }
    };
    select!(
        _ = sigterm.recv() => info!(reason = "received SIGTERM", "shutting down"),
        () = world_state.cancelled() => {
            error!(reason = "fatal block processing failure", "shutting down");
        }
    );

    world_state.stop().await;
    info!("sequencer stopped");
    ExitCode::SUCCESS
}

fn init_tracing(directives: &str) -> eyre::Result<()> {
    let filter = EnvFilter::try_new(directives).wrap_err("bad log directive")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| eyre::eyre!(error))
        .wrap_err("failed installing global tracing subscriber")
}
