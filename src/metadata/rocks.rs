//! Metadata store using RocksDB
//!
//! Column families:
//! - `shards`, `databases`, `chunks`: `_id` → JSON document
//! - `meta`: server facts recorded at import time

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::debug;

use super::{
    document_id, Collection, Document, Filter, InsertResult, MetadataStore, RemoveResult,
    ServerInfo, Snapshot, Update, UpdateOptions, UpdateResult, HOST_FIELD, ID_FIELD,
};
use crate::common::{Error, Result};

const CF_META: &str = "meta";
const KEY_SERVER_INFO: &[u8] = b"server_info";

/// Metadata store
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut cfs: Vec<&str> = Collection::ALL.iter().map(|c| c.name()).collect();
        cfs.push(CF_META);
        let db = DB::open_cf(&opts, path, cfs)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Replace the store contents with a snapshot
    pub fn import_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (collection, docs) in [
            (Collection::Shards, &snapshot.shards),
            (Collection::Databases, &snapshot.databases),
            (Collection::Chunks, &snapshot.chunks),
        ] {
            let cf = cf(&self.db, collection.name())?;
            for (key, _) in scan(&self.db, collection)? {
                batch.delete_cf(cf, key.as_bytes());
            }
            for doc in docs {
                let key = key_of(collection, doc)?;
                batch.put_cf(cf, key.as_bytes(), serde_json::to_vec(doc)?);
            }
        }
        batch.put_cf(
            cf(&self.db, CF_META)?,
            KEY_SERVER_INFO,
            serde_json::to_vec(&snapshot.server)?,
        );
        self.db.write_opt(batch, &durable())?;
        debug!(
            shards = snapshot.shards.len(),
            databases = snapshot.databases.len(),
            chunks = snapshot.chunks.len(),
            "imported snapshot"
        );
        Ok(())
    }

    /// Export the store contents
    pub fn export_snapshot(&self) -> Result<Snapshot> {
        let docs = |collection: Collection| -> Result<Vec<Document>> {
            Ok(scan(&self.db, collection)?.into_iter().map(|(_, d)| d).collect())
        };
        Ok(Snapshot {
            server: self.read_server_info()?,
            shards: docs(Collection::Shards)?,
            databases: docs(Collection::Databases)?,
            chunks: docs(Collection::Chunks)?,
        })
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn read_server_info(&self) -> Result<ServerInfo> {
        match self.db.get_cf(cf(&self.db, CF_META)?, KEY_SERVER_INFO)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(Error::Other(
                "server info not recorded in store; import a snapshot first".into(),
            )),
        }
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| Error::Other(format!("missing column family '{}'", name)))
}

fn scan(db: &DB, collection: Collection) -> Result<Vec<(String, Document)>> {
    let cf = cf(db, collection.name())?;
    let mut docs = Vec::new();
    for item in db.iterator_cf(cf, IteratorMode::Start) {
        let (key_bytes, value_bytes) = item?;
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| Error::MalformedDocument {
            collection: collection.to_string(),
            reason: "invalid UTF-8 key".into(),
        })?;
        let doc: Document = serde_json::from_slice(&value_bytes)?;
        docs.push((key, doc));
    }
    Ok(docs)
}

/// Majority acknowledgement maps to a synced write
fn durable() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

fn key_of(collection: Collection, doc: &Document) -> Result<String> {
    document_id(doc).ok_or_else(|| Error::MalformedDocument {
        collection: collection.to_string(),
        reason: "missing _id".into(),
    })
}

fn apply_update(
    db: &DB,
    collection: Collection,
    filter: &Filter,
    update: &Update,
    options: &UpdateOptions,
) -> Result<UpdateResult> {
    let cf = cf(db, collection.name())?;
    let mut batch = WriteBatch::default();
    let mut result = UpdateResult::default();
    for (key, mut doc) in scan(db, collection)? {
        if !filter.matches(&doc) {
            continue;
        }
        result.matched += 1;
        if update.apply(&mut doc) {
            result.modified += 1;
            batch.put_cf(cf, key.as_bytes(), serde_json::to_vec(&doc)?);
        }
        if !options.multi {
            break;
        }
    }
    db.write_opt(batch, &durable())?;
    Ok(result)
}

#[async_trait::async_trait]
impl MetadataStore for RocksStore {
    async fn server_info(&self) -> Result<ServerInfo> {
        self.read_server_info()
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        Ok(scan(&self.db, collection)?
            .iter()
            .filter(|(_, d)| filter.matches(d))
            .count() as u64)
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        Ok(scan(&self.db, collection)?
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| filter.matches(d))
            .collect())
    }

    async fn remove(&self, collection: Collection, filter: &Filter) -> Result<RemoveResult> {
        let cf = cf(&self.db, collection.name())?;
        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for (key, doc) in scan(&self.db, collection)? {
            if filter.matches(&doc) {
                batch.delete_cf(cf, key.as_bytes());
                removed += 1;
            }
        }
        self.db.write_opt(batch, &durable())?;
        Ok(RemoveResult { removed })
    }

    async fn insert(&self, collection: Collection, doc: Document) -> Result<InsertResult> {
        let cf = cf(&self.db, collection.name())?;
        let key = key_of(collection, &doc)?;
        if self.db.get_cf(cf, key.as_bytes())?.is_some() {
            return Err(Error::DuplicateKey {
                collection: collection.to_string(),
                key: format!("_id: {}", key),
            });
        }
        if collection == Collection::Shards {
            if let Some(host) = doc.get(HOST_FIELD) {
                let taken = scan(&self.db, collection)?
                    .iter()
                    .any(|(_, d)| d.get(HOST_FIELD) == Some(host));
                if taken {
                    return Err(Error::DuplicateKey {
                        collection: collection.to_string(),
                        key: format!("host: {}", host),
                    });
                }
            }
        }
        self.db
            .put_cf_opt(cf, key.as_bytes(), serde_json::to_vec(&doc)?, &durable())?;
        Ok(InsertResult { inserted: 1 })
    }

    /// Runs on the blocking pool so a caller's timeout can fire while a
    /// synced write is stuck
    async fn bulk_update(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        if update.field == ID_FIELD {
            return Err(Error::Other(format!(
                "field '{}' is immutable in '{}'",
                ID_FIELD, collection
            )));
        }
        let db = Arc::clone(&self.db);
        let (filter, update, options) = (filter.clone(), update.clone(), *options);
        tokio::task::spawn_blocking(move || apply_update(&db, collection, &filter, &update, &options))
            .await
            .map_err(|e| Error::Other(format!("update task failed: {}", e)))?
    }
}
