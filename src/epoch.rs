//! Epoch assignment and per-epoch snapshotting.
//!
//! Every entry is assigned a monotonic, human-sortable epoch identifier the
//! first time it is recorded; recording the same `entry_hash` again is a
//! no-op that returns the previously assigned id, which lets the Receipt
//! Engine call this unconditionally without worrying about double-writes
//! on a retried append.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};
use crate::merkle::MerkleState;

/// One epoch's record: when it was assigned and what the accumulator
/// looked like at that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    /// The assigned epoch identifier.
    pub epoch_id: String,
    /// Canonical timestamp at assignment.
    pub timestamp: String,
    /// The Merkle root after this entry was applied.
    pub merkle_root: String,
}

/// The full persisted epoch table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EpochState {
    /// The next epoch counter to assign.
    pub next_epoch: u64,
    /// Map from `entry_hash` to its assigned epoch record.
    pub entries: BTreeMap<String, EpochRecord>,
}

/// Manages epoch assignment and per-epoch snapshot files on disk.
pub struct EpochManager {
    state_path: PathBuf,
    snapshot_dir: PathBuf,
    state: EpochState,
}

impl EpochManager {
    /// Loads (or initializes) the epoch manager from `state_path`, writing
    /// per-epoch snapshots into `snapshot_dir`.
    pub fn open(state_path: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_path = state_path.into();
        let snapshot_dir = snapshot_dir.into();
        fs::create_dir_all(&snapshot_dir)?;
        let state = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            serde_json::from_slice(&bytes)?
        } else {
            EpochState::default()
        };
        Ok(EpochManager {
            state_path,
            snapshot_dir,
            state,
        })
    }

    /// Assigns (or returns the existing) epoch id for `entry_hash`,
    /// persisting the updated table and writing a per-epoch snapshot of
    /// `merkle_state` when a new epoch is assigned.
    pub fn record_entry(
        &mut self,
        entry_hash: &str,
        timestamp: &str,
        merkle_state: &MerkleState,
    ) -> Result<String> {
        if let Some(existing) = self.state.entries.get(entry_hash) {
            return Ok(existing.epoch_id.clone());
        }
        let epoch_id = format!("EPOCH-{:020}-{}", self.state.next_epoch, &entry_hash[..16]);
        let record = EpochRecord {
            epoch_id: epoch_id.clone(),
            timestamp: timestamp.to_string(),
            merkle_root: merkle_state.root(),
        };
        self.state.next_epoch += 1;
        self.state.entries.insert(entry_hash.to_string(), record);
        self.write_snapshot(&epoch_id, merkle_state)?;
        self.persist()?;
        Ok(epoch_id)
    }

    /// Returns the epoch record for a given entry, if one has been
    /// assigned. Used by the Verifier's Stage 1 cross-check.
    pub fn lookup(&self, entry_hash: &str) -> Option<&EpochRecord> {
        self.state.entries.get(entry_hash)
    }

    /// The number of epochs assigned so far.
    pub fn next_epoch(&self) -> u64 {
        self.state.next_epoch
    }

    fn write_snapshot(&self, epoch_id: &str, merkle_state: &MerkleState) -> Result<()> {
        let path = self.snapshot_dir.join(format!("{epoch_id}.json"));
        let bytes = serde_json::to_vec_pretty(merkle_state)?;
        atomic_write(&path, &bytes)
    }

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.state)?;
        atomic_write(&self.state_path, &bytes)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn assigns_monotonic_epochs_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut mgr = EpochManager::open(dir.path().join("epoch.json"), dir.path().join("epochs")).unwrap();
        let state = MerkleState::default().apply_leaf(&crate::hashing::sha256_hex(b"a")).unwrap();
        let id1 = mgr.record_entry(&"a".repeat(64), "2024-01-01T00:00:00.000000Z", &state).unwrap();
        assert_eq!(id1, format!("EPOCH-00000000000000000000-{}", &"a".repeat(64)[..16]));
        let id1_again = mgr.record_entry(&"a".repeat(64), "2024-01-01T00:00:00.000000Z", &state).unwrap();
        assert_eq!(id1, id1_again);
        assert_eq!(mgr.next_epoch(), 1);

        let id2 = mgr.record_entry(&"b".repeat(64), "2024-01-01T00:00:01.000000Z", &state).unwrap();
        assert!(id2.starts_with("EPOCH-00000000000000000001-"));
    }

    #[test]
    fn reopening_restores_state() {
        let dir = tempdir().unwrap();
        let state = MerkleState::default().apply_leaf(&crate::hashing::sha256_hex(b"a")).unwrap();
        {
            let mut mgr = EpochManager::open(dir.path().join("epoch.json"), dir.path().join("epochs")).unwrap();
            mgr.record_entry(&"c".repeat(64), "2024-01-01T00:00:00.000000Z", &state).unwrap();
        }
        let mgr = EpochManager::open(dir.path().join("epoch.json"), dir.path().join("epochs")).unwrap();
        assert!(mgr.lookup(&"c".repeat(64)).is_some());
        assert_eq!(mgr.next_epoch(), 1);
    }

    #[test]
    fn missing_entry_returns_none() {
        let dir = tempdir().unwrap();
        let mgr = EpochManager::open(dir.path().join("epoch.json"), dir.path().join("epochs")).unwrap();
        assert!(mgr.lookup("nonexistent").is_none());
    }
}
