//! SQLite-backed index, via an embedded (bundled) SQLite engine.

use std::path::PathBuf;

use rusqlite::{params, Connection};

use crate::errors::{LedgerError, Result};
use crate::index::{IndexBackend, IndexEntry};

/// SQLite index backend.
pub struct SqliteIndex {
    conn: Connection,
}

impl SqliteIndex {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(to_ledger_error)?;
        Ok(SqliteIndex { conn })
    }

    /// Opens an in-memory database, used by tests and the `load-test`
    /// harness when persistence is unnecessary.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(to_ledger_error)?;
        Ok(SqliteIndex { conn })
    }
}

fn to_ledger_error(e: rusqlite::Error) -> LedgerError {
    LedgerError::IndexSchemaError { reason: e.to_string() }
}

impl IndexBackend for SqliteIndex {
    fn ensure_schema(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS ledger_index (
                    ledger_offset INTEGER PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    state_hash TEXT NOT NULL,
                    payload_hash TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    merkle_root TEXT NOT NULL,
                    entry_hash TEXT NOT NULL,
                    previous_entry_hash TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_state_hash ON ledger_index(state_hash);
                CREATE INDEX IF NOT EXISTS idx_timestamp ON ledger_index(timestamp);
                CREATE INDEX IF NOT EXISTS idx_entry_hash ON ledger_index(entry_hash);",
            )
            .map_err(to_ledger_error)
    }

    fn append(&mut self, entry: &IndexEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO ledger_index
                    (ledger_offset, event_type, state_hash, payload_hash, timestamp, merkle_root, entry_hash, previous_entry_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.ledger_offset,
                    entry.event_type,
                    entry.state_hash,
                    entry.payload_hash,
                    entry.timestamp,
                    entry.merkle_root,
                    entry.entry_hash,
                    entry.previous_entry_hash,
                ],
            )
            .map_err(to_ledger_error)?;
        Ok(())
    }

    fn rebuild(&mut self, entries: &[IndexEntry]) -> Result<()> {
        let tx = self.conn.transaction().map_err(to_ledger_error)?;
        tx.execute("DELETE FROM ledger_index", []).map_err(to_ledger_error)?;
        for entry in entries {
            tx.execute(
                "INSERT INTO ledger_index
                    (ledger_offset, event_type, state_hash, payload_hash, timestamp, merkle_root, entry_hash, previous_entry_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.ledger_offset,
                    entry.event_type,
                    entry.state_hash,
                    entry.payload_hash,
                    entry.timestamp,
                    entry.merkle_root,
                    entry.entry_hash,
                    entry.previous_entry_hash,
                ],
            )
            .map_err(to_ledger_error)?;
        }
        tx.commit().map_err(to_ledger_error)
    }

    fn all(&self) -> Result<Vec<IndexEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ledger_offset, event_type, state_hash, payload_hash, timestamp, merkle_root, entry_hash, previous_entry_hash
                 FROM ledger_index ORDER BY ledger_offset ASC",
            )
            .map_err(to_ledger_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IndexEntry {
                    ledger_offset: row.get(0)?,
                    event_type: row.get(1)?,
                    state_hash: row.get(2)?,
                    payload_hash: row.get(3)?,
                    timestamp: row.get(4)?,
                    merkle_root: row.get(5)?,
                    entry_hash: row.get(6)?,
                    previous_entry_hash: row.get(7)?,
                })
            })
            .map_err(to_ledger_error)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(to_ledger_error)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(offset: i64) -> IndexEntry {
        IndexEntry {
            ledger_offset: offset as u64,
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
    fn append_and_query_round_trip() {
        let mut index = SqliteIndex::open_in_memory().unwrap();
        index.ensure_schema().unwrap();
        index.append(&sample(0)).unwrap();
        index.append(&sample(1)).unwrap();
        let rows = index.all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ledger_offset, 0);
    }

    #[test]
    fn rebuild_replaces_contents() {
        let mut index = SqliteIndex::open_in_memory().unwrap();
        index.ensure_schema().unwrap();
        index.append(&sample(0)).unwrap();
        index.rebuild(&[sample(9)]).unwrap();
        let rows = index.all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ledger_offset, 9);
    }
}
