//! Error types for shardfix

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Environment Errors ===
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error("No shard records found in store '{store}'")]
    NoShards { store: String },

    // === Data Errors ===
    #[error("Shard {shard_id} has a malformed host '{host}': no replica set name before '/'")]
    MalformedHost { shard_id: String, host: String },

    #[error("Malformed document in '{collection}': {reason}")]
    MalformedDocument { collection: String, reason: String },

    // === Mutation Errors ===
    #[error("Failed to re-key shard {shard_id} to {new_id}: {reason}")]
    ShardReKey {
        shard_id: String,
        new_id: String,
        reason: String,
    },

    #[error(
        "Propagation to '{collection}' failed for shard {shard_id}: {reason} \
         (matched {matched}, modified {modified}, upserted {upserted})"
    )]
    Propagation {
        collection: String,
        shard_id: String,
        matched: u64,
        modified: u64,
        upserted: u64,
        reason: String,
    },

    #[error("Shard {shard_id} owns no chunks")]
    NoChunks { shard_id: String },

    #[error("Repair of shard {shard_id} incomplete: {remaining} documents still reference it")]
    IncompleteRepair { shard_id: String, remaining: u64 },

    #[error("Write to '{collection}' not acknowledged within {timeout:?}")]
    WriteTimeout {
        collection: String,
        timeout: Duration,
    },

    // === Store Errors ===
    #[error("Duplicate key {key} in '{collection}'")]
    DuplicateKey { collection: String, key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    // === Config Errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Did this error come out of the mutation phase of a shard repair?
    ///
    /// Classifies the failure only. Whether the store was actually written
    /// is tracked by the run, not derived from the error.
    pub fn is_mutation_anomaly(&self) -> bool {
        matches!(
            self,
            Error::ShardReKey { .. }
                | Error::Propagation { .. }
                | Error::NoChunks { .. }
                | Error::IncompleteRepair { .. }
                | Error::WriteTimeout { .. }
        )
    }

    /// Short machine-readable name of the error kind, used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Preflight(_) => "preflight",
            Error::NoShards { .. } => "no_shards",
            Error::MalformedHost { .. } => "malformed_host",
            Error::MalformedDocument { .. } => "malformed_document",
            Error::ShardReKey { .. } => "shard_rekey",
            Error::Propagation { .. } => "propagation",
            Error::NoChunks { .. } => "no_chunks",
            Error::IncompleteRepair { .. } => "incomplete_repair",
            Error::WriteTimeout { .. } => "write_timeout",
            Error::DuplicateKey { .. } => "duplicate_key",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            #[cfg(feature = "rocksdb")]
            Error::RocksDb(_) => "rocksdb",
            Error::Config(_) | Error::InvalidConfig(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
