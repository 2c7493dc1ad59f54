//! Shared fixtures for integration tests

use std::time::Duration;

use serde_json::{json, Value};
use shardfix::metadata::{
    Collection, Document, Filter, InsertResult, MemStore, MetadataStore, RemoveResult, ServerInfo,
    Update, UpdateOptions, UpdateResult,
};
use shardfix::Result;

#[allow(dead_code)]
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

/// Config server with one mismatched shard (`shard0` backed by `rs0`, two
/// chunks, one database) and one consistent shard (`rs1`).
#[allow(dead_code)]
pub fn mismatched_cluster() -> MemStore {
    let store = MemStore::new(ServerInfo::replica_set("configRS", "3.6.8"));
    store
        .seed(
            Collection::Shards,
            vec![
                doc(json!({ "_id": "shard0", "host": "rs0/host1:27017,host2:27017", "state": 1 })),
                doc(json!({ "_id": "rs1", "host": "rs1/host3:27017,host4:27017", "state": 1 })),
            ],
        )
        .unwrap();
    store
        .seed(
            Collection::Databases,
            vec![
                doc(json!({ "_id": "app", "primary": "shard0", "partitioned": true })),
                doc(json!({ "_id": "reports", "primary": "rs1", "partitioned": false })),
            ],
        )
        .unwrap();
    store
        .seed(
            Collection::Chunks,
            vec![
                doc(json!({ "_id": "app.users-_id_MinKey", "ns": "app.users", "shard": "shard0" })),
                doc(json!({ "_id": "app.users-_id_500", "ns": "app.users", "shard": "shard0" })),
                doc(json!({ "_id": "app.events-_id_MinKey", "ns": "app.events", "shard": "rs1" })),
            ],
        )
        .unwrap();
    store
}

/// Misbehaviour injected into a wrapped store
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Bulk updates on the collection claim an upsert
    ReportUpsert(Collection),
    /// Bulk updates on the collection report one document fewer modified
    DropModified(Collection),
    /// Bulk updates on the collection report a write concern error
    WriteConcern(Collection),
    /// Bulk updates on the collection stall for the duration
    Stall(Collection, Duration),
    /// Removes report zero documents without removing anything
    RemoveNothing,
    /// Bulk updates on the collection fail with an I/O error before writing
    FailUpdate(Collection),
}

/// Delegates to a [`MemStore`], misreporting according to `fault`
#[allow(dead_code)]
pub struct FaultyStore {
    pub inner: MemStore,
    fault: Fault,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(inner: MemStore, fault: Fault) -> Self {
        Self { inner, fault }
    }
}

#[async_trait::async_trait]
impl MetadataStore for FaultyStore {
    async fn server_info(&self) -> Result<ServerInfo> {
        self.inner.server_info().await
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        self.inner.count(collection, filter).await
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        self.inner.find(collection, filter).await
    }

    async fn remove(&self, collection: Collection, filter: &Filter) -> Result<RemoveResult> {
        if let Fault::RemoveNothing = self.fault {
            return Ok(RemoveResult { removed: 0 });
        }
        self.inner.remove(collection, filter).await
    }

    async fn insert(&self, collection: Collection, doc: Document) -> Result<InsertResult> {
        self.inner.insert(collection, doc).await
    }

    async fn bulk_update(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        match self.fault {
            Fault::Stall(target, delay) if target == collection => {
                tokio::time::sleep(delay).await;
            }
            Fault::FailUpdate(target) if target == collection => {
                return Err(std::io::Error::other("disk unavailable").into());
            }
            _ => {}
        }
        let mut result = self
            .inner
            .bulk_update(collection, filter, update, options)
            .await?;
        match self.fault {
            Fault::ReportUpsert(target) if target == collection => result.upserted = 1,
            Fault::DropModified(target) if target == collection => {
                result.modified = result.modified.saturating_sub(1)
            }
            Fault::WriteConcern(target) if target == collection => {
                result.write_concern_error = Some("waiting for replication timed out".into())
            }
            _ => {}
        }
        Ok(result)
    }
}
