//! JSON snapshot of a metadata database
//!
//! Lets the repair run offline against an export of the config database and
//! write the result back.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Document, ServerInfo};
use crate::common::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub server: ServerInfo,
    #[serde(default)]
    pub shards: Vec<Document>,
    #[serde(default)]
    pub databases: Vec<Document>,
    #[serde(default)]
    pub chunks: Vec<Document>,
}

impl Snapshot {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        debug!(
            path = %path.display(),
            shards = snapshot.shards.len(),
            databases = snapshot.databases.len(),
            chunks = snapshot.chunks.len(),
            "loaded snapshot"
        );
        Ok(snapshot)
    }

    /// Write to `path` through a temp file and rename, so readers never see
    /// a half-written snapshot.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&temp_path, path)?;
        debug!(path = %path.display(), "saved snapshot");
        Ok(())
    }
}
