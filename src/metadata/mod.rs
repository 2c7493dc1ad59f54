//! Metadata store adapter
//!
//! The repair only needs a handful of primitives over three collections:
//! - `shards`: shard records (`_id`, `host`, ...)
//! - `databases`: database placement records (`_id`, `primary`, ...)
//! - `chunks`: chunk ownership records (`_id`, `ns`, `shard`, ...)
//!
//! Write primitives return typed acknowledgements so callers check counts
//! instead of poking at loosely shaped replies.

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;
pub mod snapshot;

pub use memory::{MemStore, OpStats};
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;
pub use snapshot::Snapshot;

use crate::common::{replica_set_name, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// A stored document
pub type Document = serde_json::Map<String, Value>;

/// Primary key field of every collection
pub const ID_FIELD: &str = "_id";
/// Replica set host string of a shard record
pub const HOST_FIELD: &str = "host";
/// Owning shard of a database placement record
pub const PRIMARY_FIELD: &str = "primary";
/// Owning shard of a chunk record
pub const CHUNK_SHARD_FIELD: &str = "shard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Shards,
    Databases,
    Chunks,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Shards, Collection::Databases, Collection::Chunks];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Shards => "shards",
            Collection::Databases => "databases",
            Collection::Chunks => "chunks",
        }
    }

    /// Field holding the shard identifier this collection references
    pub fn shard_field(&self) -> &'static str {
        match self {
            Collection::Shards => ID_FIELD,
            Collection::Databases => PRIMARY_FIELD,
            Collection::Chunks => CHUNK_SHARD_FIELD,
        }
    }

    /// Filter selecting every document of this collection that refers to `shard_id`
    pub fn references(&self, shard_id: &str) -> Filter {
        Filter::eq(self.shard_field(), shard_id)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Query filter
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every document
    All,
    /// Top-level field equals value
    Eq { field: String, value: Value },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => doc.get(field) == Some(value),
        }
    }
}

/// `$set` of a single top-level field
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub field: String,
    pub value: Value,
}

impl Update {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Apply to a document, returning whether it changed
    pub fn apply(&self, doc: &mut Document) -> bool {
        if doc.get(&self.field) == Some(&self.value) {
            return false;
        }
        doc.insert(self.field.clone(), self.value.clone());
        true
    }
}

/// Durability requested for a write: a majority of the replica set must
/// apply it within `timeout`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteConcern {
    /// Bounded wait for the acknowledgement
    pub timeout: Duration,
}

impl WriteConcern {
    pub fn majority(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Update every match rather than the first one
    pub multi: bool,
    pub write_concern: WriteConcern,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveResult {
    pub removed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertResult {
    pub inserted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    /// Set when the write was applied but the requested acknowledgement was not reached
    pub write_concern_error: Option<String>,
}

/// Kind of server process the store is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// Data-bearing server (config server replica set member)
    Storage,
    /// Stateless query router
    Router,
}

/// Facts about the server behind a store handle, used by preflight checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub process: ProcessKind,
    /// Replica set name, `None` for stand-alone servers
    #[serde(default)]
    pub replica_set: Option<String>,
    pub version: String,
    /// Database names present on the server
    #[serde(default)]
    pub databases: Vec<String>,
}

impl ServerInfo {
    /// A replica set member hosting the usual metadata databases
    pub fn replica_set(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            process: ProcessKind::Storage,
            replica_set: Some(name.into()),
            version: version.into(),
            databases: vec!["admin".into(), "config".into(), "local".into()],
        }
    }
}

/// Shard record decoded from the `shards` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub host: String,
    /// Remaining fields (state, tags, ...), carried across a re-key
    #[serde(flatten)]
    pub extra: Document,
}

impl ShardRecord {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            extra: Document::new(),
        }
    }

    pub fn from_document(doc: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(doc)).map_err(|e| Error::MalformedDocument {
            collection: Collection::Shards.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn into_document(self) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.into(), Value::String(self.id));
        doc.insert(HOST_FIELD.into(), Value::String(self.host));
        doc.extend(self.extra);
        doc
    }

    /// Replica set name from the host string
    pub fn replica_set_name(&self) -> &str {
        replica_set_name(&self.host)
    }

    /// Same record under another identifier
    pub fn rekeyed(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self.clone()
        }
    }
}

/// Render a document's `_id` as a string key
pub fn document_id(doc: &Document) -> Option<String> {
    match doc.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Primitive operations the repair needs from a metadata store.
///
/// Implementations operate on one metadata database; the handle is opened
/// once and passed to every component that needs it.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Facts about the attached server
    async fn server_info(&self) -> Result<ServerInfo>;

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64>;

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>>;

    /// Remove every match
    async fn remove(&self, collection: Collection, filter: &Filter) -> Result<RemoveResult>;

    /// Insert one document; unique index violations are errors
    async fn insert(&self, collection: Collection, doc: Document) -> Result<InsertResult>;

    /// Conditional update, never upserting
    async fn bulk_update(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult>;
}
