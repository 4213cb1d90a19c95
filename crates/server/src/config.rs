use std::path::PathBuf;

use admission_common::AppConfig;
use anyhow::Result;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "config/admissiond.yaml";

/// Resolved configuration with the source path for reloading.
pub struct DaemonConfig {
    pub config: AppConfig,
    pub config_path: PathBuf,
}

impl DaemonConfig {
    /// Load from the path given as the first argument, or the default path.
    pub fn from_args() -> Result<Self> {
        let path = std::env::args()
            .nth(1)
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        Self::load(&path)
    }

    pub fn load(path: &str) -> Result<Self> {
        info!(path = path, "loading configuration");
        let config = AppConfig::load(path)?;
        Ok(Self {
            config,
            config_path: PathBuf::from(path),
        })
    }
}
