//! # shardfix
//!
//! Repairs shard identifiers in the metadata store of a sharded cluster.
//!
//! Every shard record's `_id` should equal the name of the replica set that
//! backs it (the prefix of its `host` before `/`). When the two drift apart,
//! every database placement record and chunk record still points at the old
//! id. shardfix finds such shards and moves the shard record and all of its
//! references to the replica set name, one shard at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │              Run coordinator               │
//! │  preflight → load shards → repair each     │
//! └───────────┬────────────────────────────────┘
//!             │ one shard at a time
//! ┌───────────▼────────────────────────────────┐
//! │            Shard repair engine             │
//! │  re-key → databases → chunks → verify      │
//! └───────────┬────────────────────────────────┘
//!             │ count / find / remove / insert / bulk update
//! ┌───────────▼────────────────────────────────┐
//! │          Metadata store adapter            │
//! │  memory (+ JSON snapshot) │ RocksDB        │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Report what would change
//! shardfix repair --snapshot ./config-export.json
//!
//! # Apply the repair and write the snapshot back
//! shardfix repair --snapshot ./config-export.json --execute --audit-log ./repair.log
//!
//! # Check referential consistency
//! shardfix verify --snapshot ./config-export.json
//! ```

pub mod common;
pub mod metadata;
pub mod ops;

// Re-export commonly used types
pub use common::{ChunkPolicy, Error, RepairOptions, Result};
pub use metadata::{MemStore, MetadataStore, ShardRecord, Snapshot};
pub use ops::{run_repair, verify_store, RepairOutcome, RepairReport};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
