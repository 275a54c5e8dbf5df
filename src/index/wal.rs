//! Write-ahead log guarding secondary index writes.
//!
//! The WAL is a JSONL file of pending [`IndexEntry`] rows. A non-empty WAL
//! at startup means a prior `append` did not finish draining, and the
//! caller must replay its contents before trusting the backend.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::index::IndexEntry;

/// A JSONL write-ahead log of pending index rows.
pub struct WriteAheadLog {
    path: PathBuf,
}

impl WriteAheadLog {
    /// Opens (without requiring it to exist yet) the WAL at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(WriteAheadLog { path })
    }

    /// Appends `entry` to the WAL, fsyncing before returning.
    pub fn record(&mut self, entry: &IndexEntry) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_vec(entry)?;
        file.write_all(&line)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    /// Returns every pending row, in the order they were recorded.
    pub fn pending(&self) -> Result<Vec<IndexEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }

    /// Clears the WAL, marking all pending entries as durably applied.
    pub fn drain(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::write(&self.path, b"")?;
        }
        Ok(())
    }

    /// Whether the WAL currently has no pending rows.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.pending()?.is_empty())
    }

    /// The WAL's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(offset: u64) -> IndexEntry {
        IndexEntry {
            ledger_offset: offset,
            event_type: "STATE_AUDITED".into(),
            state_hash: "a".repeat(64),
            payload_hash: "b".repeat(64),
            timestamp: "2024-01-01T00:00:00.000000Z".into(),
            merkle_root: "c".repeat(64),
            entry_hash: "d".repeat(64),
            previous_entry_hash: None,
        }
    }

    #[test]
    fn record_then_drain_round_trip() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path().join("wal.jsonl")).unwrap();
        assert!(wal.is_empty().unwrap());
        wal.record(&sample(0)).unwrap();
        wal.record(&sample(1)).unwrap();
        assert_eq!(wal.pending().unwrap().len(), 2);
        wal.drain().unwrap();
        assert!(wal.is_empty().unwrap());
    }

    #[test]
    fn missing_wal_file_is_empty() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("missing.wal")).unwrap();
        assert!(wal.is_empty().unwrap());
    }
}
