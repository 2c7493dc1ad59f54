//! Configuration for repair runs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{Error, Result};

/// Config file looked up (optionally) in the working directory
pub const CONFIG_FILE: &str = "shardfix";

/// Prefix for environment overrides (e.g. `SHARDFIX_STORE_NAME`)
pub const ENV_PREFIX: &str = "SHARDFIX";

/// Options for a single repair run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairOptions {
    /// Name of the metadata database to operate on
    #[serde(default = "default_store_name")]
    pub store_name: String,

    /// Detect and count only, never mutate
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,

    /// Emit per-step diagnostics
    #[serde(default)]
    pub verbose: bool,

    /// What to do when a renamed shard owns no chunks
    #[serde(default)]
    pub chunk_policy: ChunkPolicy,

    /// Bounded wait for majority acknowledgement of bulk updates
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Server versions (major.minor) the repair is known to be safe against
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,

    /// Append mutation records here (JSON lines)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Policy for shards that own zero chunks when their references are migrated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPolicy {
    /// Zero matching chunks is an error
    #[default]
    RequireChunks,
    /// A shard may legitimately own no chunks
    AllowEmpty,
}

fn default_store_name() -> String {
    "config".to_string()
}
fn default_dry_run() -> bool {
    true
}
fn default_write_timeout() -> u64 {
    30_000
}
fn default_supported_versions() -> Vec<String> {
    vec!["3.4".to_string(), "3.6".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            store_name: default_store_name(),
            dry_run: default_dry_run(),
            verbose: false,
            chunk_policy: ChunkPolicy::default(),
            write_timeout_ms: default_write_timeout(),
            supported_versions: default_supported_versions(),
            audit_log: None,
            log_level: default_log_level(),
        }
    }
}

impl RepairOptions {
    /// Load from `shardfix.toml` (if present) and `SHARDFIX_*` environment
    /// variables, on top of the defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Same as [`RepairOptions::load`] with an explicit config file stem/path
    pub fn load_from(file: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let options: RepairOptions = settings.try_deserialize()?;
        options.validate()?;
        Ok(options)
    }

    /// Reject option combinations a run cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.store_name.trim().is_empty() {
            return Err(Error::InvalidConfig("store name must not be empty".into()));
        }
        if self.write_timeout_ms == 0 {
            return Err(Error::InvalidConfig("write timeout must be positive".into()));
        }
        if self.supported_versions.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one supported server version is required".into(),
            ));
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.write_timeout_ms = u64::try_from(timeout.as_millis()).map_err(|_| {
            Error::InvalidConfig(format!("write timeout out of range: {:?}", timeout))
        })?;
        Ok(())
    }

    /// Execute mode, i.e. not a dry run
    pub fn executes(&self) -> bool {
        !self.dry_run
    }
}
