//! Pluggable secondary index, fronted by a write-ahead log.
//!
//! The index exists purely for fast lookup; it is never the source of
//! truth and must always be rebuildable from the log alone. Two backends
//! are provided: a SQL backend (`sqlite`, the default) and a JSON-KV
//! backend (`kv`) for environments without a bundled SQL engine available.
//! Both sit behind the same [`IndexBackend`] trait and both are fronted by
//! the same [`wal::WriteAheadLog`], so crash-consistency is uniform across
//! backends.

pub mod kv;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod wal;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// One row mirrored from the log into the secondary index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    /// Byte offset of the corresponding line in the log.
    pub ledger_offset: u64,
    /// The receipt's event type.
    pub event_type: String,
    /// The caller-supplied audited state hash.
    pub state_hash: String,
    /// The payload hash.
    pub payload_hash: String,
    /// Canonical timestamp.
    pub timestamp: String,
    /// Merkle root after this entry.
    pub merkle_root: String,
    /// This entry's hash.
    pub entry_hash: String,
    /// The previous entry's hash, if any.
    pub previous_entry_hash: Option<String>,
}

/// A secondary index backend. Implementations must treat `append` and
/// `rebuild` as the only write paths; both are always called with the WAL
/// already drained or about to be drained by the caller (see
/// [`IndexWriter`]).
pub trait IndexBackend {
    /// Creates the schema (tables/files) if it does not already exist.
    /// Must tolerate being called on an already-initialized backend.
    fn ensure_schema(&mut self) -> Result<()>;

    /// Inserts one row.
    fn append(&mut self, entry: &IndexEntry) -> Result<()>;

    /// Drops and recreates the backend's contents from `entries`, in
    /// order. Used by repair tooling to rebuild from the log.
    fn rebuild(&mut self, entries: &[IndexEntry]) -> Result<()>;

    /// Returns every row, ordered by `ledger_offset`.
    fn all(&self) -> Result<Vec<IndexEntry>>;

    /// Number of rows currently stored.
    fn len(&self) -> Result<u64> {
        Ok(self.all()?.len() as u64)
    }

    /// Whether the backend currently holds no rows.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<T: IndexBackend + ?Sized> IndexBackend for Box<T> {
    fn ensure_schema(&mut self) -> Result<()> {
        (**self).ensure_schema()
    }

    fn append(&mut self, entry: &IndexEntry) -> Result<()> {
        (**self).append(entry)
    }

    fn rebuild(&mut self, entries: &[IndexEntry]) -> Result<()> {
        (**self).rebuild(entries)
    }

    fn all(&self) -> Result<Vec<IndexEntry>> {
        (**self).all()
    }
}

/// Wraps any [`IndexBackend`] with WAL-guarded writes: every `append` is
/// first durably recorded in the WAL, then applied to the backend, then
/// drained from the WAL. If the process crashes between the first and
/// third step, the WAL is non-empty at the next startup and the caller
/// must replay or rebuild before trusting the index.
pub struct IndexWriter<B: IndexBackend> {
    backend: B,
    wal: wal::WriteAheadLog,
}

impl<B: IndexBackend> IndexWriter<B> {
    /// Wraps `backend` with a WAL rooted at `wal_path`.
    pub fn new(backend: B, wal_path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let mut writer = IndexWriter {
            backend,
            wal: wal::WriteAheadLog::open(wal_path)?,
        };
        writer.backend.ensure_schema()?;
        Ok(writer)
    }

    /// True when the WAL has pending entries from an incomplete prior
    /// append — the caller should replay or rebuild before continuing.
    pub fn needs_recovery(&self) -> Result<bool> {
        Ok(!self.wal.is_empty()?)
    }

    /// Replays any pending WAL entries into the backend, then drains them.
    /// Idempotent: safe to call even when the WAL is already empty.
    pub fn recover(&mut self) -> Result<()> {
        let pending = self.wal.pending()?;
        for entry in &pending {
            self.backend.append(entry)?;
        }
        self.wal.drain()?;
        Ok(())
    }

    /// Appends one row, WAL-guarded.
    pub fn append(&mut self, entry: IndexEntry) -> Result<()> {
        self.wal.record(&entry)?;
        self.backend.append(&entry)?;
        self.wal.drain()?;
        Ok(())
    }

    /// Rebuilds the backend from `entries` and clears the WAL.
    pub fn rebuild(&mut self, entries: &[IndexEntry]) -> Result<()> {
        self.backend.rebuild(entries)?;
        self.wal.drain()?;
        Ok(())
    }

    /// Borrows the underlying backend for read-only queries.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
