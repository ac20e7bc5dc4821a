//! Node configuration: defaults, optional file, `KARST_`-prefixed
//! environment overrides.

use std::path::PathBuf;

use serde::Deserialize;

use karst_core::error::{KarstError, StorageError};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory for the RocksDB stores.
    pub data_dir: PathBuf,
    /// Worker count for the parallel pipeline stages. Zero means one per
    /// available CPU core.
    pub pipeline_parallelism: usize,
    /// Bounded capacity of the pipeline's inter-stage channels.
    pub channel_capacity: usize,
    /// Downgrade script verification failures to warnings (historical
    /// fast replay only).
    pub ignore_script_errors: bool,
    /// Event bus ring capacity.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./karst-data"),
            pipeline_parallelism: 0,
            channel_capacity: 64,
            ignore_script_errors: false,
            event_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `KARST_*` environment variables.
    pub fn load(file: Option<&str>) -> Result<Self, KarstError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("KARST"));
        let settings = builder
            .build()
            .map_err(|e| StorageError::Backend(format!("config: {e}")))?;
        settings
            .try_deserialize()
            .map_err(|e| StorageError::Backend(format!("config: {e}")).into())
    }

    /// Resolve the pipeline worker count, defaulting to the core count.
    pub fn effective_parallelism(&self) -> usize {
        if self.pipeline_parallelism > 0 {
            self.pipeline_parallelism
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }
}
