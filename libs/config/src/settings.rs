//! Settings loading
//!
//! Loads a base TOML file, layers an optional per-environment override from
//! `config/environments/{env}.toml`, then applies `TRELLIS_` environment
//! variables (nested keys separated by `__`, e.g. `TRELLIS_CLUSTER__POOL_SIZE`).

use crate::{AppConfig, ClusterSettings};
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "TRELLIS";

/// Everything a member needs to join the mesh
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Local identity, published to the membership source
    pub app: AppConfig,

    #[serde(default)]
    pub cluster: ClusterSettings,
}

impl Settings {
    /// Load from `base_path` (default `config/trellis.toml`) with overrides
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new("config/trellis.toml"));
        let env_dir = base
            .parent()
            .map(|dir| dir.join("environments"))
            .unwrap_or_else(|| PathBuf::from("config/environments"));

        Self::load_from(base, &env_dir, environment)
    }

    /// Load with an explicit directory for environment overrides
    pub fn load_from(
        base: &Path,
        env_dir: &Path,
        environment: Option<&str>,
    ) -> Result<Self> {
        debug!("Loading settings from {:?}", base);

        let mut builder = Config::builder().add_source(File::from(base).required(true));

        if let Some(env) = environment {
            let env_file = env_dir.join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        settings
            .cluster
            .validate()
            .context("Invalid cluster settings")?;

        Ok(settings)
    }
}
