//! Repair shards whose identifier differs from their replica set name
//!
//! A shard is re-keyed in four strictly ordered steps:
//! 1. remove the shard record under its old id, then reinsert it under the
//!    replica set name (the `host` index is unique, so the old record has to
//!    go first and `_id` cannot be changed in place)
//! 2. point database placement records at the new id
//! 3. point chunk records at the new id
//! 4. check that nothing references the old id any more
//!
//! Between 1 and 3 placement and chunk records reference an id with no
//! shard record. The gap is closed before `repair_shard` returns; the run
//! assumes no other writer is active meanwhile.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::verify::count_references;
use crate::common::{AuditEventType, AuditLogger, ChunkPolicy, Error, RepairOptions, Result};
use crate::metadata::{
    Collection, Filter, MetadataStore, ShardRecord, Update, UpdateOptions, UpdateResult,
    WriteConcern, ID_FIELD,
};

/// Logs at info when verbose, debug otherwise
macro_rules! detail {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Result of examining (and possibly repairing) one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    pub shard_id: String,
    /// Replica set name the shard should be keyed by
    pub new_id: String,
    pub needs_fixing: bool,
    pub fixed: bool,
    /// Documents that referenced the old id when the shard was examined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_updated: Option<u64>,
}

impl RepairOutcome {
    fn consistent(shard_id: &str) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            new_id: shard_id.to_string(),
            needs_fixing: false,
            fixed: false,
            docs_updated: None,
        }
    }
}

/// Identifier a shard record should carry: the replica set name in its host
pub fn canonical_id(shard: &ShardRecord) -> Result<String> {
    let name = shard.replica_set_name();
    if name.is_empty() {
        return Err(Error::MalformedHost {
            shard_id: shard.id.clone(),
            host: shard.host.clone(),
        });
    }
    Ok(name.to_string())
}

/// Repairs individual shards against one store handle
pub struct ShardRepairer<'a, S: MetadataStore> {
    store: &'a S,
    options: &'a RepairOptions,
    audit: Option<&'a AuditLogger>,
    /// Set once a write may have reached the store
    mutated: AtomicBool,
}

impl<'a, S: MetadataStore> ShardRepairer<'a, S> {
    pub fn new(store: &'a S, options: &'a RepairOptions) -> Self {
        Self {
            store,
            options,
            audit: None,
            mutated: AtomicBool::new(false),
        }
    }

    /// Whether any shard repaired through this handle may have written to the store
    pub fn has_mutated(&self) -> bool {
        self.mutated.load(Ordering::Acquire)
    }

    fn mark_mutated(&self) {
        self.mutated.store(true, Ordering::Release);
    }

    /// Record every mutation in `audit`
    pub fn with_audit(mut self, audit: &'a AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Examine one shard and, outside dry-run mode, re-key it.
    ///
    /// Any error after the re-key step leaves the shard partially migrated;
    /// nothing is rolled back.
    #[tracing::instrument(skip(self, shard), fields(shard_id = %shard.id))]
    pub async fn repair_shard(&self, shard: &ShardRecord) -> Result<RepairOutcome> {
        let verbose = self.options.verbose;
        let new_id = canonical_id(shard)?;

        if new_id == shard.id {
            detail!(verbose, host = %shard.host, "shard id matches replica set name");
            return Ok(RepairOutcome::consistent(&shard.id));
        }

        let docs_to_fix = count_references(self.store, &shard.id).await?;
        info!(%new_id, docs_to_fix, "shard id does not match replica set name");

        let mut outcome = RepairOutcome {
            shard_id: shard.id.clone(),
            new_id: new_id.clone(),
            needs_fixing: true,
            fixed: false,
            docs_updated: Some(docs_to_fix),
        };
        if self.options.dry_run {
            return Ok(outcome);
        }

        self.rekey(shard, &new_id).await?;
        let databases = self
            .propagate(Collection::Databases, &shard.id, &new_id)
            .await?;
        let chunks = self.propagate(Collection::Chunks, &shard.id, &new_id).await?;
        detail!(
            verbose,
            %new_id,
            databases = databases.modified,
            chunks = chunks.modified,
            "references migrated"
        );

        let remaining = count_references(self.store, &shard.id).await?;
        if remaining != 0 {
            return Err(Error::IncompleteRepair {
                shard_id: shard.id.clone(),
                remaining,
            });
        }
        self.record(
            AuditEventType::RepairVerified,
            &shard.id,
            format!("no documents reference {} any more", shard.id),
            json!({ "new_id": new_id, "docs_updated": docs_to_fix }),
        );

        info!(%new_id, docs_to_fix, "shard repaired");
        outcome.fixed = true;
        Ok(outcome)
    }

    async fn rekey(&self, shard: &ShardRecord, new_id: &str) -> Result<()> {
        let rekey_error = |reason: String| Error::ShardReKey {
            shard_id: shard.id.clone(),
            new_id: new_id.to_string(),
            reason,
        };

        // The insert below can never succeed if the target id is taken, and
        // the old record would already be gone.
        let taken = self
            .store
            .count(Collection::Shards, &Filter::eq(ID_FIELD, new_id))
            .await?;
        if taken != 0 {
            return Err(rekey_error(format!("a shard with id {} already exists", new_id)));
        }

        // A failed remove may still have been applied in part
        let removed = self
            .store
            .remove(Collection::Shards, &Collection::Shards.references(&shard.id))
            .await
            .inspect_err(|_| self.mark_mutated())?;
        if removed.removed != 0 {
            self.mark_mutated();
        }
        if removed.removed != 1 {
            return Err(rekey_error(format!(
                "expected 1 shard record removed, got {}",
                removed.removed
            )));
        }

        let inserted = self
            .store
            .insert(Collection::Shards, shard.rekeyed(new_id).into_document())
            .await
            .map_err(|e| rekey_error(format!("insert after removal failed: {}", e)))?;
        if inserted.inserted != 1 {
            return Err(rekey_error(format!(
                "expected 1 shard record inserted, got {}",
                inserted.inserted
            )));
        }

        debug!(%new_id, "shard record re-keyed");
        self.record(
            AuditEventType::ShardReKeyed,
            &shard.id,
            format!("re-keyed shard {} to {}", shard.id, new_id),
            json!({ "new_id": new_id, "host": shard.host }),
        );
        Ok(())
    }

    /// Point every `collection` document referencing `old_id` at `new_id`
    async fn propagate(
        &self,
        collection: Collection,
        old_id: &str,
        new_id: &str,
    ) -> Result<UpdateResult> {
        let timeout = self.options.write_timeout();
        let options = UpdateOptions {
            multi: true,
            write_concern: WriteConcern::majority(timeout),
        };
        let update = Update::set(collection.shard_field(), new_id);
        // Only bounds stores that yield; `MemStore` applies the update in one
        // synchronous step and `RocksStore` moves it to the blocking pool.
        let result = tokio::time::timeout(
            timeout,
            self.store
                .bulk_update(collection, &collection.references(old_id), &update, &options),
        )
        .await
        .map_err(|_| Error::WriteTimeout {
            collection: collection.to_string(),
            timeout,
        })??;

        if collection == Collection::Chunks
            && result.matched == 0
            && self.options.chunk_policy == ChunkPolicy::RequireChunks
        {
            return Err(Error::NoChunks {
                shard_id: old_id.to_string(),
            });
        }
        check_update(collection, old_id, &result)?;

        self.record(
            AuditEventType::ReferencesPropagated,
            old_id,
            format!("updated {} {} documents to {}", result.modified, collection, new_id),
            json!({ "collection": collection, "new_id": new_id, "matched": result.matched, "modified": result.modified }),
        );
        Ok(result)
    }

    fn record(&self, event: AuditEventType, shard_id: &str, message: String, meta: serde_json::Value) {
        if let Some(audit) = self.audit {
            if let Err(e) = audit.log_event(event, Some(shard_id), message, Some(meta)) {
                warn!(error = %e, "failed to write audit entry");
            }
        }
    }
}

/// Validate a bulk update acknowledgement
fn check_update(collection: Collection, shard_id: &str, result: &UpdateResult) -> Result<()> {
    let anomaly = |reason: String| Error::Propagation {
        collection: collection.to_string(),
        shard_id: shard_id.to_string(),
        matched: result.matched,
        modified: result.modified,
        upserted: result.upserted,
        reason,
    };
    if let Some(wc) = &result.write_concern_error {
        return Err(anomaly(format!("write concern not satisfied: {}", wc)));
    }
    if result.upserted != 0 {
        return Err(anomaly("update created documents instead of modifying them".into()));
    }
    if result.matched != result.modified {
        return Err(anomaly("matched and modified counts differ".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Document, MemStore, ServerInfo};
    use serde_json::Value;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    /// shard0 backed by rs0 with two chunks and one database; shard1 already consistent
    fn cluster() -> MemStore {
        let store = MemStore::new(ServerInfo::replica_set("cfg", "3.6.8"));
        store
            .seed(
                Collection::Shards,
                vec![
                    doc(json!({ "_id": "shard0", "host": "rs0/host1:27017,host2:27017", "state": 1 })),
                    doc(json!({ "_id": "rs1", "host": "rs1/host3:27017" })),
                ],
            )
            .unwrap();
        store
            .seed(
                Collection::Databases,
                vec![doc(json!({ "_id": "app", "primary": "shard0", "partitioned": true }))],
            )
            .unwrap();
        store
            .seed(
                Collection::Chunks,
                vec![
                    doc(json!({ "_id": "app.users-min", "ns": "app.users", "shard": "shard0" })),
                    doc(json!({ "_id": "app.users-50", "ns": "app.users", "shard": "shard0" })),
                    doc(json!({ "_id": "app.orders-min", "ns": "app.orders", "shard": "rs1" })),
                ],
            )
            .unwrap();
        store
    }

    fn shard(store: &MemStore, id: &str) -> ShardRecord {
        let doc = store
            .documents(Collection::Shards)
            .unwrap()
            .into_iter()
            .find(|d| d["_id"] == id)
            .unwrap();
        ShardRecord::from_document(doc).unwrap()
    }

    fn execute() -> RepairOptions {
        RepairOptions {
            dry_run: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_canonical_id() {
        let record = ShardRecord::new("shard0", "rs0/host1:27017");
        assert_eq!(canonical_id(&record).unwrap(), "rs0");

        let record = ShardRecord::new("shard0", "/host1:27017");
        assert!(matches!(canonical_id(&record), Err(Error::MalformedHost { .. })));
    }

    #[tokio::test]
    async fn test_consistent_shard_is_noop() {
        let store = cluster();
        let options = execute();
        let before = store.snapshot().unwrap();

        let outcome = ShardRepairer::new(&store, &options)
            .repair_shard(&shard(&store, "rs1"))
            .await
            .unwrap();

        assert!(!outcome.needs_fixing);
        assert!(!outcome.fixed);
        assert_eq!(outcome.docs_updated, None);
        assert_eq!(store.snapshot().unwrap(), before);
        assert_eq!(store.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_mutating() {
        let store = cluster();
        let options = RepairOptions::default();
        let before = store.snapshot().unwrap();

        let outcome = ShardRepairer::new(&store, &options)
            .repair_shard(&shard(&store, "shard0"))
            .await
            .unwrap();

        assert!(outcome.needs_fixing);
        assert!(!outcome.fixed);
        assert_eq!(outcome.new_id, "rs0");
        // shard record + database + two chunks
        assert_eq!(outcome.docs_updated, Some(4));
        assert_eq!(store.snapshot().unwrap(), before);
        assert_eq!(store.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_execute_migrates_every_reference() {
        let store = cluster();
        let options = execute();

        let outcome = ShardRepairer::new(&store, &options)
            .repair_shard(&shard(&store, "shard0"))
            .await
            .unwrap();
        assert!(outcome.fixed);
        assert_eq!(outcome.docs_updated, Some(4));

        let rekeyed = shard(&store, "rs0");
        assert_eq!(rekeyed.host, "rs0/host1:27017,host2:27017");
        assert_eq!(rekeyed.extra["state"], 1);

        assert_eq!(count_references(&store, "shard0").await.unwrap(), 0);
        assert_eq!(
            store.count(Collection::Chunks, &Filter::eq("shard", "rs0")).await.unwrap(),
            2
        );
        assert_eq!(
            store
                .count(Collection::Databases, &Filter::eq("primary", "rs0"))
                .await
                .unwrap(),
            1
        );

        // A second pass over the repaired record changes nothing
        let before = store.snapshot().unwrap();
        let again = ShardRepairer::new(&store, &options)
            .repair_shard(&rekeyed)
            .await
            .unwrap();
        assert!(!again.needs_fixing);
        assert_eq!(store.snapshot().unwrap(), before);
    }

    #[tokio::test]
    async fn test_shard_without_databases_is_fine() {
        let store = cluster();
        store
            .remove(Collection::Databases, &Filter::All)
            .await
            .unwrap();
        let options = execute();

        let outcome = ShardRepairer::new(&store, &options)
            .repair_shard(&shard(&store, "shard0"))
            .await
            .unwrap();
        assert!(outcome.fixed);
        assert_eq!(outcome.docs_updated, Some(3));
    }

    #[tokio::test]
    async fn test_no_chunks_leaves_documented_partial_state() {
        let store = cluster();
        store
            .remove(Collection::Chunks, &Filter::eq("shard", "shard0"))
            .await
            .unwrap();
        let options = execute();

        let err = ShardRepairer::new(&store, &options)
            .repair_shard(&shard(&store, "shard0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoChunks { ref shard_id } if shard_id == "shard0"));

        // Shard already re-keyed, databases migrated, chunks untouched
        assert_eq!(store.count(Collection::Shards, &Filter::eq("_id", "rs0")).await.unwrap(), 1);
        assert_eq!(store.count(Collection::Shards, &Filter::eq("_id", "shard0")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_allow_empty_chunk_policy() {
        let store = cluster();
        store
            .remove(Collection::Chunks, &Filter::eq("shard", "shard0"))
            .await
            .unwrap();
        let options = RepairOptions {
            chunk_policy: ChunkPolicy::AllowEmpty,
            ..execute()
        };

        let outcome = ShardRepairer::new(&store, &options)
            .repair_shard(&shard(&store, "shard0"))
            .await
            .unwrap();
        assert!(outcome.fixed);
        assert_eq!(count_references(&store, "shard0").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_taken_target_id_fails_before_mutation() {
        let store = cluster();
        store
            .seed(
                Collection::Shards,
                vec![doc(json!({ "_id": "rs0", "host": "rs0/elsewhere:27017" }))],
            )
            .unwrap();
        let options = execute();
        let before = store.snapshot().unwrap();

        let err = ShardRepairer::new(&store, &options)
            .repair_shard(&shard(&store, "shard0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardReKey { .. }));
        assert_eq!(store.snapshot().unwrap(), before);
        assert!(!repairer_mutated_after(&store, &options, "shard0").await);
    }

    async fn repairer_mutated_after(store: &MemStore, options: &RepairOptions, id: &str) -> bool {
        let repairer = ShardRepairer::new(store, options);
        let _ = repairer.repair_shard(&shard(store, id)).await;
        repairer.has_mutated()
    }

    #[tokio::test]
    async fn test_mutation_tracking() {
        // Dry run and consistent shards never write
        let store = cluster();
        assert!(!repairer_mutated_after(&store, &RepairOptions::default(), "shard0").await);
        assert!(!repairer_mutated_after(&store, &execute(), "rs1").await);

        // The re-key write counts even when a later step fails
        store
            .remove(Collection::Chunks, &Filter::eq("shard", "shard0"))
            .await
            .unwrap();
        assert!(repairer_mutated_after(&store, &execute(), "shard0").await);
    }

    #[tokio::test]
    async fn test_malformed_host_touches_nothing() {
        let store = cluster();
        let options = execute();
        let record = ShardRecord::new("shard9", "/host9:27017");

        let err = ShardRepairer::new(&store, &options)
            .repair_shard(&record)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedHost { .. }));
        assert_eq!(store.stats().reads, 0);
    }

    #[test]
    fn test_check_update() {
        let ok = UpdateResult {
            matched: 2,
            modified: 2,
            ..Default::default()
        };
        assert!(check_update(Collection::Chunks, "s", &ok).is_ok());

        let upsert = UpdateResult {
            upserted: 1,
            ..ok.clone()
        };
        assert!(matches!(
            check_update(Collection::Chunks, "s", &upsert),
            Err(Error::Propagation { upserted: 1, .. })
        ));

        let partial = UpdateResult {
            modified: 1,
            ..ok.clone()
        };
        assert!(matches!(
            check_update(Collection::Databases, "s", &partial),
            Err(Error::Propagation { matched: 2, modified: 1, .. })
        ));

        let wc = UpdateResult {
            write_concern_error: Some("waiting for replication timed out".into()),
            ..ok
        };
        assert!(check_update(Collection::Chunks, "s", &wc).is_err());
    }
}
