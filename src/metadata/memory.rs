//! In-memory metadata store
//!
//! Enforces the same unique indexes as a real config database (`_id` in
//! every collection, `host` in `shards`) and refuses to modify `_id` in
//! place, so the repair sees the constraints it is written against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use super::{
    document_id, Collection, Document, Filter, InsertResult, MetadataStore, RemoveResult,
    ServerInfo, Snapshot, Update, UpdateOptions, UpdateResult, HOST_FIELD, ID_FIELD,
};
use crate::common::{Error, Result};

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    pub reads: u64,
    pub writes: u64,
}

/// Metadata store held entirely in memory
pub struct MemStore {
    server: ServerInfo,
    collections: Mutex<BTreeMap<Collection, Vec<Document>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemStore {
    pub fn new(server: ServerInfo) -> Self {
        let collections = Collection::ALL.iter().map(|c| (*c, Vec::new())).collect();
        Self {
            server,
            collections: Mutex::new(collections),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Build a store from a snapshot, checking unique indexes
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        let store = Self::new(snapshot.server);
        store.seed(Collection::Shards, snapshot.shards)?;
        store.seed(Collection::Databases, snapshot.databases)?;
        store.seed(Collection::Chunks, snapshot.chunks)?;
        Ok(store)
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Result<Snapshot> {
        let guard = self.lock()?;
        Ok(Snapshot {
            server: self.server.clone(),
            shards: guard[&Collection::Shards].clone(),
            databases: guard[&Collection::Databases].clone(),
            chunks: guard[&Collection::Chunks].clone(),
        })
    }

    /// Load documents without touching the operation counters
    pub fn seed(&self, collection: Collection, docs: Vec<Document>) -> Result<()> {
        let mut guard = self.lock()?;
        let target = guard.entry(collection).or_default();
        for doc in docs {
            check_unique(collection, target, &doc)?;
            target.push(doc);
        }
        Ok(())
    }

    /// All documents of a collection, in storage order
    pub fn documents(&self, collection: Collection) -> Result<Vec<Document>> {
        Ok(self.lock()?[&collection].clone())
    }

    pub fn stats(&self) -> OpStats {
        OpStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<Collection, Vec<Document>>>> {
        self.collections
            .lock()
            .map_err(|_| Error::Other("metadata store lock poisoned".into()))
    }
}

fn check_unique(collection: Collection, existing: &[Document], doc: &Document) -> Result<()> {
    let id = document_id(doc).ok_or_else(|| Error::MalformedDocument {
        collection: collection.to_string(),
        reason: "missing _id".into(),
    })?;
    if existing.iter().any(|d| document_id(d).as_deref() == Some(id.as_str())) {
        return Err(Error::DuplicateKey {
            collection: collection.to_string(),
            key: format!("_id: {}", id),
        });
    }
    if collection == Collection::Shards {
        if let Some(host) = doc.get(HOST_FIELD) {
            if existing.iter().any(|d| d.get(HOST_FIELD) == Some(host)) {
                return Err(Error::DuplicateKey {
                    collection: collection.to_string(),
                    key: format!("host: {}", host),
                });
            }
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl MetadataStore for MemStore {
    async fn server_info(&self) -> Result<ServerInfo> {
        Ok(self.server.clone())
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.lock()?;
        Ok(guard[&collection].iter().filter(|d| filter.matches(d)).count() as u64)
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.lock()?;
        Ok(guard[&collection]
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn remove(&self, collection: Collection, filter: &Filter) -> Result<RemoveResult> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock()?;
        let docs = guard.entry(collection).or_default();
        let before = docs.len();
        docs.retain(|d| !filter.matches(d));
        let removed = (before - docs.len()) as u64;
        trace!(%collection, removed, "remove");
        Ok(RemoveResult { removed })
    }

    async fn insert(&self, collection: Collection, doc: Document) -> Result<InsertResult> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock()?;
        let docs = guard.entry(collection).or_default();
        check_unique(collection, docs, &doc)?;
        docs.push(doc);
        trace!(%collection, "insert");
        Ok(InsertResult { inserted: 1 })
    }

    async fn bulk_update(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if update.field == ID_FIELD {
            return Err(Error::Other(format!(
                "field '{}' is immutable in '{}'",
                ID_FIELD, collection
            )));
        }

        let mut guard = self.lock()?;
        let docs = guard.entry(collection).or_default();
        if collection == Collection::Shards
            && update.field == HOST_FIELD
            && docs
                .iter()
                .any(|d| d.get(HOST_FIELD) == Some(&update.value) && !filter.matches(d))
        {
            return Err(Error::DuplicateKey {
                collection: collection.to_string(),
                key: format!("host: {}", update.value),
            });
        }

        let mut result = UpdateResult::default();
        for doc in docs.iter_mut().filter(|d| filter.matches(d)) {
            result.matched += 1;
            if update.apply(doc) {
                result.modified += 1;
            }
            if !options.multi {
                break;
            }
        }
        trace!(%collection, matched = result.matched, modified = result.modified, "bulk update");
        Ok(result)
    }
}
