//! Engine configuration.
//!
//! Values are layered: built-in defaults, then an optional file, then
//! `REBAC_`-prefixed environment variables (e.g. `REBAC_MAX_CHECK_DEPTH=40`).

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

const ENV_PREFIX: &str = "REBAC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Relation levels a single Check may descend before failing with
    /// `RecursionLimitExceeded`. Counted like Expand's `depth`.
    pub max_check_depth: u32,
    /// Depth used by `list_subjects` and by callers without their own budget.
    pub default_expand_depth: u32,
    /// Upper bound on store queries in flight across all calls of one engine.
    pub max_concurrent_queries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_check_depth: 25,
            default_expand_depth: 10,
            max_concurrent_queries: 64,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        Self::load(Self::builder()?)
    }

    /// Defaults overridden by `path` (format taken from the extension), then the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Self::builder()?.add_source(File::from(path.as_ref())))
    }

    /// Defaults overridden by configuration text, then the environment.
    pub fn from_source(source: &str, format: FileFormat) -> Result<Self> {
        Self::load(Self::builder()?.add_source(File::from_str(source, format)))
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(Config::builder().add_source(Config::try_from(&EngineConfig::default())?))
    }

    fn load(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: EngineConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_queries == 0 {
            return Err(ConfigError::Message(
                "max_concurrent_queries must be greater than 0".to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub fn with_max_check_depth(mut self, depth: u32) -> Self {
        self.max_check_depth = depth;
        self
    }

    pub fn with_default_expand_depth(mut self, depth: u32) -> Self {
        self.default_expand_depth = depth;
        self
    }

    pub fn with_max_concurrent_queries(mut self, limit: usize) -> Self {
        self.max_concurrent_queries = limit;
        self
    }
}
