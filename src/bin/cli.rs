//! CLI for shard id repair

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use shardfix::common::{parse_duration, ChunkPolicy, RepairOptions};
use shardfix::metadata::{MemStore, MetadataStore, Snapshot};
use shardfix::ops::{persist_snapshot, run_repair, verify_store, RepairReport, VerifyReport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardfix")]
#[command(about = "Repair shard ids that do not match their replica set names")]
#[command(version)]
struct Cli {
    /// Config file (TOML); `shardfix.toml` in the working directory if omitted
    #[arg(long, global = true)]
    config: Option<String>,

    /// Emit per-step diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect (and with --execute, repair) mismatched shard ids
    Repair {
        #[command(flatten)]
        source: StoreArgs,

        /// Metadata database name
        #[arg(long)]
        store: Option<String>,

        /// Apply the repair instead of reporting only
        #[arg(long)]
        execute: bool,

        /// Accept renamed shards that own no chunks
        #[arg(long)]
        allow_empty_shards: bool,

        /// Bounded wait for majority acknowledgement (e.g. "30s")
        #[arg(long)]
        write_timeout: Option<String>,

        /// Append mutation records to this file
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Where to write the repaired snapshot (defaults to the input)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check shard ids and references without changing anything
    Verify {
        #[command(flatten)]
        source: StoreArgs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a JSON snapshot into a RocksDB metadata directory
    #[cfg(feature = "rocksdb")]
    Import {
        /// JSON snapshot to read
        #[arg(long)]
        snapshot: PathBuf,

        /// RocksDB metadata directory (created if missing)
        #[arg(long)]
        db: PathBuf,
    },

    /// Write a RocksDB metadata directory out as a JSON snapshot
    #[cfg(feature = "rocksdb")]
    Export {
        /// RocksDB metadata directory
        #[arg(long)]
        db: PathBuf,

        /// JSON snapshot to write
        #[arg(long)]
        snapshot: PathBuf,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct StoreArgs {
    /// JSON snapshot of the metadata database
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// RocksDB metadata directory
    #[cfg(feature = "rocksdb")]
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut options = match &cli.config {
        Some(path) => RepairOptions::load_from(path),
        None => RepairOptions::load(),
    }
    .context("failed to load configuration")?;
    options.verbose |= cli.verbose;

    let default_level = if options.verbose {
        "debug".to_string()
    } else {
        options.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let status = match cli.command {
        Commands::Repair {
            source,
            store,
            execute,
            allow_empty_shards,
            write_timeout,
            audit_log,
            output,
            json,
        } => {
            if let Some(store) = store {
                options.store_name = store;
            }
            options.dry_run = !execute;
            if allow_empty_shards {
                options.chunk_policy = ChunkPolicy::AllowEmpty;
            }
            if let Some(timeout) = write_timeout {
                options.set_write_timeout(parse_duration(&timeout)?)?;
            }
            if audit_log.is_some() {
                options.audit_log = audit_log;
            }
            repair(source, &options, output, json).await?
        }

        Commands::Verify { source, json } => verify(source, json).await?,

        #[cfg(feature = "rocksdb")]
        Commands::Import { snapshot, db } => {
            let data = Snapshot::load(&snapshot)
                .with_context(|| format!("failed to read {}", snapshot.display()))?;
            let store = open_db(&db)?;
            store.import_snapshot(&data)?;
            store.flush()?;
            println!(
                "Imported {} shards, {} databases, {} chunks into {}",
                data.shards.len(),
                data.databases.len(),
                data.chunks.len(),
                db.display()
            );
            0
        }

        #[cfg(feature = "rocksdb")]
        Commands::Export { db, snapshot } => {
            let data = open_db(&db)?.export_snapshot()?;
            data.save(&snapshot)
                .with_context(|| format!("failed to write {}", snapshot.display()))?;
            println!("Exported {} to {}", db.display(), snapshot.display());
            0
        }
    };

    std::process::exit(status);
}

async fn repair(
    source: StoreArgs,
    options: &RepairOptions,
    output: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<i32> {
    #[cfg(feature = "rocksdb")]
    if let Some(db) = &source.db {
        let store = open_db(db)?;
        let report = run_repair(&store, options).await;
        store.flush()?;
        print_repair_report(&report, json)?;
        return Ok(report.status_code());
    }

    let path = snapshot_path(&source)?;
    let store = MemStore::from_snapshot(
        Snapshot::load(path).with_context(|| format!("failed to read {}", path.display()))?,
    )?;
    let report = run_repair(&store, options).await;
    let written = persist_snapshot(&store, &report, path, output.as_deref())?;

    print_repair_report(&report, json)?;
    if let Some(written) = written {
        if !json {
            println!("  Snapshot written to {}", written.display());
        }
    }
    Ok(report.status_code())
}

async fn verify(source: StoreArgs, json: bool) -> anyhow::Result<i32> {
    #[cfg(feature = "rocksdb")]
    if let Some(db) = &source.db {
        let store = open_db(db)?;
        return verify_and_print(&store, json).await;
    }

    let path = snapshot_path(&source)?;
    let store = MemStore::from_snapshot(
        Snapshot::load(path).with_context(|| format!("failed to read {}", path.display()))?,
    )?;
    verify_and_print(&store, json).await
}

async fn verify_and_print<S: MetadataStore>(store: &S, json: bool) -> anyhow::Result<i32> {
    let report = verify_store(store).await?;
    print_verify_report(&report, json)?;
    Ok(if report.is_consistent() { 0 } else { 1 })
}

#[cfg(feature = "rocksdb")]
fn open_db(db: &Path) -> anyhow::Result<shardfix::metadata::RocksStore> {
    shardfix::metadata::RocksStore::open(db)
        .with_context(|| format!("failed to open {}", db.display()))
}

fn snapshot_path(source: &StoreArgs) -> anyhow::Result<&Path> {
    source
        .snapshot
        .as_deref()
        .context("a metadata source (--snapshot) is required")
}

fn print_repair_report(report: &RepairReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        return Ok(());
    }

    println!("Repair report ({}):", if report.dry_run { "dry run" } else { "execute" });
    println!("  Run id: {}", report.run_id);
    println!("  Store: {}", report.store);
    for outcome in &report.outcomes {
        let state = match (outcome.needs_fixing, outcome.fixed) {
            (false, _) => "ok".to_string(),
            (true, true) => format!("fixed -> {}", outcome.new_id),
            (true, false) => format!("needs fixing -> {}", outcome.new_id),
        };
        match outcome.docs_updated {
            Some(docs) => println!("  {}: {} ({} documents)", outcome.shard_id, state, docs),
            None => println!("  {}: {}", outcome.shard_id, state),
        }
    }
    println!("  Shards needing fix: {}", report.needs_fixing());
    println!("  Shards fixed: {}", report.fixed());
    if let Some(err) = &report.failure {
        println!("  FAILED: {}", err);
        if report.mutations_started {
            println!("  The store was modified before the failure; inspect it manually.");
        }
    }
    Ok(())
}

fn print_verify_report(report: &VerifyReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Verification report:");
    println!("  Shards: {}", report.total_shards);
    for m in &report.mismatched {
        println!("  Mismatched: {} (expected {})", m.shard_id, m.expected_id);
    }
    for id in &report.malformed_hosts {
        println!("  Malformed host: {}", id);
    }
    for d in &report.dangling {
        println!(
            "  Dangling reference: {} {} -> {}",
            d.collection, d.doc_id, d.shard_id
        );
    }
    println!(
        "  Status: {}",
        if report.is_consistent() { "consistent" } else { "inconsistent" }
    );
    Ok(())
}
