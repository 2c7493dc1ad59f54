//! Run coordinator: preflight, then every shard in turn

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use super::preflight::{PreconditionCheck, ServerPreflight};
use super::repair::{RepairOutcome, ShardRepairer};
use crate::common::{AuditEventType, AuditLogger, Error, RepairOptions, Result};
use crate::metadata::{Collection, Filter, MemStore, MetadataStore, ShardRecord};

/// Exit status of a run that completed
pub const STATUS_OK: i32 = 0;
/// The run failed before anything was written
pub const STATUS_FAILED_CLEAN: i32 = 1;
/// The run failed after writes began; the store needs manual inspection
pub const STATUS_FAILED_DIRTY: i32 = 2;

#[derive(Debug)]
pub struct RepairReport {
    pub run_id: String,
    pub store: String,
    pub dry_run: bool,
    /// One per shard examined, in store order
    pub outcomes: Vec<RepairOutcome>,
    /// Error that aborted the run
    pub failure: Option<Error>,
    /// Whether a write may have reached the store
    pub mutations_started: bool,
}

impl RepairReport {
    fn new(run_id: String, options: &RepairOptions) -> Self {
        Self {
            run_id,
            store: options.store_name.clone(),
            dry_run: options.dry_run,
            outcomes: Vec::new(),
            failure: None,
            mutations_started: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn status_code(&self) -> i32 {
        match (&self.failure, self.mutations_started) {
            (None, _) => STATUS_OK,
            (Some(_), false) => STATUS_FAILED_CLEAN,
            (Some(_), true) => STATUS_FAILED_DIRTY,
        }
    }

    pub fn needs_fixing(&self) -> usize {
        self.outcomes.iter().filter(|o| o.needs_fixing).count()
    }

    pub fn fixed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.fixed).count()
    }

    /// Outcomes of a successful run, or the error that aborted it
    pub fn into_result(self) -> Result<Vec<RepairOutcome>> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.outcomes),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "run_id": self.run_id,
            "store": self.store,
            "dry_run": self.dry_run,
            "success": self.is_success(),
            "status": self.status_code(),
            "mutations_started": self.mutations_started,
            "outcomes": self.outcomes,
            "error": self.failure.as_ref().map(|e| json!({
                "kind": e.kind(),
                "message": e.to_string(),
            })),
        })
    }
}

/// Repair every shard of the store the handle points at
pub async fn run_repair<S: MetadataStore>(store: &S, options: &RepairOptions) -> RepairReport {
    run_repair_with(store, &ServerPreflight::new(store), options).await
}

/// [`run_repair`] with a custom precondition checker
pub async fn run_repair_with<S, P>(store: &S, preflight: &P, options: &RepairOptions) -> RepairReport
where
    S: MetadataStore,
    P: PreconditionCheck,
{
    let run_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "repair_run",
        run_id = %run_id,
        store = %options.store_name,
        dry_run = options.dry_run,
    );
    let mut report = RepairReport::new(run_id, options);

    async {
        info!("Starting shard id repair");
        let mut audit = None;
        let result = execute(store, preflight, options, &mut report, &mut audit).await;
        if let Err(err) = result {
            let status = if report.mutations_started {
                STATUS_FAILED_DIRTY
            } else {
                STATUS_FAILED_CLEAN
            };
            warn!(
                error = %err,
                anomaly = err.is_mutation_anomaly(),
                status,
                shards_done = report.outcomes.len(),
                "repair run aborted"
            );
            log_audit(audit.as_ref(), AuditEventType::RunAborted, err.to_string());
            report.failure = Some(err);
        } else {
            info!(
                shards = report.outcomes.len(),
                needs_fixing = report.needs_fixing(),
                fixed = report.fixed(),
                "repair run finished"
            );
            log_audit(
                audit.as_ref(),
                AuditEventType::RunFinished,
                format!("{} of {} shards fixed", report.fixed(), report.outcomes.len()),
            );
        }
    }
    .instrument(span)
    .await;

    report
}

async fn execute<S, P>(
    store: &S,
    preflight: &P,
    options: &RepairOptions,
    report: &mut RepairReport,
    audit: &mut Option<AuditLogger>,
) -> Result<()>
where
    S: MetadataStore,
    P: PreconditionCheck,
{
    options.validate()?;
    preflight.check_all(options).await.map_err(|e| match e {
        Error::Preflight(_) => e,
        other => Error::Preflight(other.to_string()),
    })?;

    if let (Some(path), true) = (&options.audit_log, options.executes()) {
        let logger = AuditLogger::open(path, report.run_id.clone())?;
        logger.log_event(AuditEventType::RunStarted, None, "starting repair", None)?;
        *audit = Some(logger);
    }

    let docs = store.find(Collection::Shards, &Filter::All).await?;
    if docs.is_empty() {
        return Err(Error::NoShards {
            store: options.store_name.clone(),
        });
    }
    let shards = docs
        .into_iter()
        .map(ShardRecord::from_document)
        .collect::<Result<Vec<_>>>()?;
    info!(shards = shards.len(), "loaded shard records");

    let mut repairer = ShardRepairer::new(store, options);
    if let Some(logger) = audit.as_ref() {
        repairer = repairer.with_audit(logger);
    }

    for shard in &shards {
        let result = repairer.repair_shard(shard).await;
        report.mutations_started |= repairer.has_mutated();
        let outcome = result?;
        if options.verbose || outcome.needs_fixing {
            info!(
                shard_id = %outcome.shard_id,
                new_id = %outcome.new_id,
                needs_fixing = outcome.needs_fixing,
                fixed = outcome.fixed,
                "shard examined"
            );
        }
        report.outcomes.push(outcome);
    }
    Ok(())
}

/// Write a snapshot-backed store back to disk after a run.
///
/// A successful run that changed something is written to `output`, or over
/// `input` when no output is given. A run that failed after writing leaves
/// `input` intact and is written next to it (see [`partial_snapshot_path`]).
/// Returns the path written, if any.
pub fn persist_snapshot(
    store: &MemStore,
    report: &RepairReport,
    input: &Path,
    output: Option<&Path>,
) -> Result<Option<PathBuf>> {
    if !report.mutations_started {
        return Ok(None);
    }

    let target = if report.is_success() {
        output.unwrap_or(input).to_path_buf()
    } else {
        partial_snapshot_path(input)
    };
    store.snapshot()?.save(&target)?;

    if report.is_success() {
        info!(path = %target.display(), "wrote repaired snapshot");
    } else {
        warn!(path = %target.display(), "wrote partially repaired snapshot");
    }
    Ok(Some(target))
}

/// `config.json` -> `config.partial.json`
pub fn partial_snapshot_path(input: &Path) -> PathBuf {
    input.with_extension("partial.json")
}

fn log_audit(audit: Option<&AuditLogger>, event: AuditEventType, message: String) {
    if let Some(audit) = audit {
        if let Err(e) = audit.log_event(event, None, message, None) {
            warn!(error = %e, "failed to write audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Document, MemStore, ProcessKind, ServerInfo};
    use serde_json::Value;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn store_with(server: ServerInfo) -> MemStore {
        let store = MemStore::new(server);
        store
            .seed(
                Collection::Shards,
                vec![
                    doc(json!({ "_id": "rs1", "host": "rs1/h1:27017" })),
                    doc(json!({ "_id": "shard0", "host": "rs0/h2:27017" })),
                ],
            )
            .unwrap();
        store
            .seed(
                Collection::Chunks,
                vec![
                    doc(json!({ "_id": "c1", "shard": "shard0" })),
                    doc(json!({ "_id": "c2", "shard": "rs1" })),
                ],
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_dry_run_report() {
        let store = store_with(ServerInfo::replica_set("cfg", "3.6.8"));
        let report = run_repair(&store, &RepairOptions::default()).await;

        assert!(report.is_success());
        assert_eq!(report.status_code(), STATUS_OK);
        assert!(!report.mutations_started);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.needs_fixing(), 1);
        assert_eq!(report.fixed(), 0);
        assert_eq!(store.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_execute_report() {
        let store = store_with(ServerInfo::replica_set("cfg", "3.6.8"));
        let options = RepairOptions {
            dry_run: false,
            ..Default::default()
        };
        let report = run_repair(&store, &options).await;

        assert!(report.is_success());
        assert!(report.mutations_started);
        assert_eq!(report.fixed(), 1);
        let json = report.to_json();
        assert_eq!(json["status"], 0);
        assert_eq!(json["outcomes"][1]["new_id"], "rs0");
        assert!(json["error"].is_null());
    }

    #[tokio::test]
    async fn test_router_aborts_before_reading_metadata() {
        let mut server = ServerInfo::replica_set("cfg", "3.6.8");
        server.process = ProcessKind::Router;
        let store = store_with(server);
        let options = RepairOptions {
            dry_run: false,
            ..Default::default()
        };

        let report = run_repair(&store, &options).await;
        assert!(matches!(report.failure, Some(Error::Preflight(_))));
        assert_eq!(report.status_code(), STATUS_FAILED_CLEAN);
        assert!(report.outcomes.is_empty());
        assert_eq!(store.stats().reads, 0);
        assert_eq!(store.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_empty_store_is_an_error() {
        let store = MemStore::new(ServerInfo::replica_set("cfg", "3.6.8"));
        let report = run_repair(&store, &RepairOptions::default()).await;
        assert!(matches!(report.failure, Some(Error::NoShards { ref store }) if store == "config"));
        assert_eq!(report.status_code(), STATUS_FAILED_CLEAN);
    }

    #[test]
    fn test_partial_snapshot_path() {
        assert_eq!(
            partial_snapshot_path(Path::new("/tmp/config.json")),
            PathBuf::from("/tmp/config.partial.json")
        );
        assert_eq!(
            partial_snapshot_path(Path::new("dump")),
            PathBuf::from("dump.partial.json")
        );
    }

    #[tokio::test]
    async fn test_mutation_failure_is_dirty() {
        let store = store_with(ServerInfo::replica_set("cfg", "3.6.8"));
        store
            .remove(Collection::Chunks, &Filter::eq("shard", "shard0"))
            .await
            .unwrap();
        let options = RepairOptions {
            dry_run: false,
            ..Default::default()
        };

        let report = run_repair(&store, &options).await;
        assert!(matches!(report.failure, Some(Error::NoChunks { .. })));
        assert_eq!(report.status_code(), STATUS_FAILED_DIRTY);
        // rs1 was examined before shard0 failed
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.to_json()["error"]["kind"], "no_chunks");
        assert!(report.into_result().is_err());
    }
}
