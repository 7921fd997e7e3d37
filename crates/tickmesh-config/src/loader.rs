//! Configuration loader with multi-source merging

use crate::{Paths, TickmeshConfig};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Keys whose environment values are comma-separated lists.
const LIST_KEYS: &[&str] = &["machine.clock_rates"];

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
    env_override: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "TICKMESH".to_string(),
            include_user_config: true,
            env_override: None,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "TICKMESH")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip `~/.config/tickmesh/config.toml`.
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Read environment overrides from `vars` instead of the process environment.
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_override = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<TickmeshConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = TickmeshConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2-4. User, project, and local files, lowest precedence first
        let mut paths = Paths::for_project(&self.project_dir);
        if !self.include_user_config {
            paths = paths.without_user_dir();
        }
        for (_, file) in paths.existing_files() {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (TICKMESH_<SECTION>__<KEY>)
        let mut environment = config::Environment::with_prefix(&self.env_prefix)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .try_parsing(true)
            .source(self.env_override.map(|vars| vars.into_iter().collect()));
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }
        builder = builder.add_source(environment);

        // Build and deserialize
        let config = builder.build().context("Failed to build configuration")?;

        let mut tickmesh_config: TickmeshConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        tickmesh_config
            .validate()
            .context("Configuration failed validation")?;

        // Resolve relative paths
        tickmesh_config.resolve_paths(&self.project_dir);

        Ok(tickmesh_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> TickmeshConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
