//! JSON-KV index backend.
//!
//! Used when the `sqlite` feature is disabled, or when a deployment
//! prefers a dependency-free store. Despite the module name this is not a
//! binding to the RocksDB C++ library — it is a small flat-file emulation
//! of a key-value store, keyed by `ledger_offset`, sufficient for the
//! lookup patterns this crate needs.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::errors::Result;
use crate::index::{IndexBackend, IndexEntry};

/// Flat-file JSON key-value index backend.
pub struct KvIndex {
    path: PathBuf,
    rows: BTreeMap<u64, IndexEntry>,
}

impl KvIndex {
    /// Opens (or initializes) the backend at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(KvIndex { path, rows })
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(&self.rows)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl IndexBackend for KvIndex {
    fn ensure_schema(&mut self) -> Result<()> {
        if !self.path.exists() {
            self.persist()?;
        }
        Ok(())
    }

    fn append(&mut self, entry: &IndexEntry) -> Result<()> {
        self.rows.insert(entry.ledger_offset, entry.clone());
        self.persist()
    }

    fn rebuild(&mut self, entries: &[IndexEntry]) -> Result<()> {
        self.rows = entries.iter().map(|e| (e.ledger_offset, e.clone())).collect();
        self.persist()
    }

    fn all(&self) -> Result<Vec<IndexEntry>> {
        Ok(self.rows.values().cloned().collect())
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
    fn append_and_rebuild_round_trip() {
        let dir = tempdir().unwrap();
        let mut index = KvIndex::open(dir.path().join("index.json")).unwrap();
        index.ensure_schema().unwrap();
        index.append(&sample(0)).unwrap();
        index.append(&sample(1)).unwrap();
        assert_eq!(index.all().unwrap().len(), 2);

        index.rebuild(&[sample(5)]).unwrap();
        let all = index.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ledger_offset, 5);
    }

    #[test]
    fn reopening_restores_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let mut index = KvIndex::open(&path).unwrap();
            index.append(&sample(0)).unwrap();
        }
        let index = KvIndex::open(&path).unwrap();
        assert_eq!(index.all().unwrap().len(), 1);
    }
}
