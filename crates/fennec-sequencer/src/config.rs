//! The sequencer configuration.

use std::path::PathBuf;

use serde::{
    Deserialize,
    Serialize,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Log directive, e.g. `info` or `fennec_sequencer=debug`.
    pub log: String,

    /// Directory holding per-chain-id initial state files.
    pub data_dir: PathBuf,

    /// How long the pipeline lets a transaction pool age before publishing.
    pub publish_interval_ms: u64,

    /// Number of inner proof slots per rollup.
    pub rollup_size: u32,

    /// Chain id served by the dev-mode loopback chain.
    pub chain_id: u64,
}

impl Config {
    const PREFIX: &'static str = "FENNEC_SEQUENCER_";

    /// Reads the configuration from `FENNEC_SEQUENCER_`-prefixed
    /// environment variables layered over the defaults.
    ///
    /// # Errors
    /// Returns an error if a set variable fails to parse into its field.
    pub fn get() -> Result<Self, figment::Error> {
        Self::get_with_prefix(Self::PREFIX)
    }

    fn get_with_prefix(prefix: &str) -> Result<Self, figment::Error> {
        use figment::{
            providers::{
                Env,
                Serialized,
            },
            Figment,
        };
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(prefix))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: "info".to_string(),
            data_dir: PathBuf::from("./data"),
            publish_interval_ms: 10_000,
            rollup_size: 4,
            chain_id: 0xa57ec,
        }
    }
}
