//! Verify shard identity and referential consistency of a metadata store

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::common::Result;
use crate::metadata::{document_id, Collection, Filter, MetadataStore, ShardRecord};

/// Shard ids that exist without a record in `shards` (the config server itself)
pub const RESERVED_SHARD_IDS: &[&str] = &["config"];

/// Documents in any collection that reference `shard_id`
pub async fn count_references<S: MetadataStore + ?Sized>(store: &S, shard_id: &str) -> Result<u64> {
    let mut total = 0;
    for collection in Collection::ALL {
        total += store
            .count(collection, &collection.references(shard_id))
            .await?;
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub shard_id: String,
    pub expected_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
    pub collection: Collection,
    pub doc_id: String,
    pub shard_id: String,
}

#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub total_shards: usize,
    pub mismatched: Vec<Mismatch>,
    pub malformed_hosts: Vec<String>,
    pub dangling: Vec<DanglingReference>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatched.is_empty() && self.malformed_hosts.is_empty() && self.dangling.is_empty()
    }
}

/// Read-only audit of every shard record and every reference to one
pub async fn verify_store<S: MetadataStore + ?Sized>(store: &S) -> Result<VerifyReport> {
    info!("Starting metadata verification");

    let mut report = VerifyReport::default();
    let mut known: HashSet<String> = RESERVED_SHARD_IDS.iter().map(|s| s.to_string()).collect();

    for doc in store.find(Collection::Shards, &Filter::All).await? {
        let shard = ShardRecord::from_document(doc)?;
        report.total_shards += 1;
        match shard.replica_set_name() {
            "" => report.malformed_hosts.push(shard.id.clone()),
            name if name != shard.id => report.mismatched.push(Mismatch {
                shard_id: shard.id.clone(),
                expected_id: name.to_string(),
            }),
            _ => {}
        }
        known.insert(shard.id);
    }

    for collection in [Collection::Databases, Collection::Chunks] {
        for doc in store.find(collection, &Filter::All).await? {
            let Some(shard_id) = doc.get(collection.shard_field()).and_then(|v| v.as_str()) else {
                continue;
            };
            if !known.contains(shard_id) {
                report.dangling.push(DanglingReference {
                    collection,
                    doc_id: document_id(&doc).unwrap_or_default(),
                    shard_id: shard_id.to_string(),
                });
            }
        }
    }

    if report.is_consistent() {
        info!(shards = report.total_shards, "metadata is consistent");
    } else {
        warn!(
            shards = report.total_shards,
            mismatched = report.mismatched.len(),
            malformed = report.malformed_hosts.len(),
            dangling = report.dangling.len(),
            "metadata is inconsistent"
        );
    }
    Ok(report)
}
