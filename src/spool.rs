//! Best-effort fallback persistence: the whole queue serialized into a
//! single flat JSON slot on disk, capped by a byte budget.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::entry::LogEntry;
use crate::INTERNAL_TARGET;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct Spool {
    path: PathBuf,
    max_bytes: usize,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes the queue into the slot. Oversized payloads are refused
    /// with a warning; a write failure removes the slot rather than leaving
    /// a corrupt one behind. Never propagates an error to the caller.
    pub fn save(&self, entries: &[LogEntry]) {
        if entries.is_empty() {
            self.clear();
            return;
        }

        let payload = match serde_json::to_vec(entries) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    target: INTERNAL_TARGET,
                    component = "spool",
                    event = "spool.save.serialize_failed",
                    error = %err
                );
                return;
            }
        };

        if payload.len() > self.max_bytes {
            warn!(
                target: INTERNAL_TARGET,
                component = "spool",
                event = "spool.save.refused_oversize",
                bytes = payload.len(),
                max_bytes = self.max_bytes
            );
            return;
        }

        if let Err(err) = self.write_atomic(&payload) {
            warn!(
                target: INTERNAL_TARGET,
                component = "spool",
                event = "spool.save.write_failed",
                path = %self.path.display(),
                error = %err
            );
            self.clear();
        }
    }

    /// Reads and removes the slot, returning any queued records. A corrupt
    /// slot is discarded.
    pub fn load(&self) -> Vec<LogEntry> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return Vec::new(),
        };

        let entries = match serde_json::from_slice::<Vec<LogEntry>>(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    target: INTERNAL_TARGET,
                    component = "spool",
                    event = "spool.load.corrupt_slot",
                    path = %self.path.display(),
                    error = %err
                );
                self.clear();
                return Vec::new();
            }
        };

        debug!(
            target: INTERNAL_TARGET,
            component = "spool",
            event = "spool.load.merged",
            records = entries.len()
        );
        self.clear();
        entries
    }

    /// Removes the slot if present.
    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }

    fn write_atomic(&self, payload: &[u8]) -> Result<(), SpoolError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "spool.json".to_string());
        let tmp_path = self.path.with_file_name(format!("{file_name}.tmp"));

        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}
