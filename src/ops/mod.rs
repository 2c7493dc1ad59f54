//! Ops commands for metadata repair

pub mod preflight;
pub mod repair;
pub mod run;
pub mod verify;

pub use preflight::{PreconditionCheck, ServerPreflight};
pub use repair::{canonical_id, RepairOutcome, ShardRepairer};
pub use run::{partial_snapshot_path, persist_snapshot, run_repair, run_repair_with, RepairReport};
pub use verify::{count_references, verify_store, VerifyReport};
