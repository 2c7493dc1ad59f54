//! Common utilities and types shared across shardfix

pub mod audit;
pub mod config;
pub mod error;
pub mod utils;

pub use audit::{AuditEntry, AuditEventType, AuditLogger};
pub use config::{ChunkPolicy, RepairOptions};
pub use error::{Error, Result};
pub use utils::{major_minor, parse_duration, replica_set_name};
