//! Ledger configuration, loaded from environment variables and doubling
//! as the CLI's argument defaults via `clap`'s `env` attribute.

use std::path::PathBuf;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::token_guard::DEFAULT_WINDOW_SECONDS;

/// Which secondary index backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackendKind {
    /// Embedded SQLite (default, requires the `sqlite` feature).
    Sqlite,
    /// Flat-file JSON-KV emulation, no external engine required.
    Rocksdb,
}

impl Default for IndexBackendKind {
    fn default() -> Self {
        IndexBackendKind::Sqlite
    }
}

/// Fixed identity string embedded in receipts and reports.
pub const AUDITOR_IDENTITY: &str = "auditledger";

/// All externally-configurable paths and policy knobs for a ledger
/// instance. Every field mirrors one of the environment variables /
/// CLI flags enumerated for this system, so a single struct doubles as
/// both the library's construction parameters and the CLI's argument set.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path to the append-only log file.
    #[arg(long, env = "LEDGER_PATH", default_value = "ledger.jsonl")]
    pub ledger_path: PathBuf,

    /// Path to the secondary index file/database.
    #[arg(long, env = "INDEX_PATH", default_value = "ledger_index.db")]
    pub index_path: PathBuf,

    /// Path to the persisted Merkle accumulator state.
    #[arg(long, env = "MERKLE_STATE_PATH", default_value = "merkle_state.json")]
    pub merkle_state_path: PathBuf,

    /// Path to the epoch table.
    #[arg(long, env = "EPOCH_STATE_PATH", default_value = "epoch_state.json")]
    pub epoch_state_path: PathBuf,

    /// Directory containing signing key material.
    #[arg(long, env = "SIGNING_KEYS_DIR", default_value = "signing_keys")]
    pub signing_keys_dir: PathBuf,

    /// Explicit active key id override; normally left to the registry.
    #[arg(long, env = "KEY_ID")]
    pub key_id: Option<String>,

    /// Governance token required for writes and key rotation.
    #[arg(long, env = "GOVERNANCE_TOKEN")]
    pub governance_token: Option<String>,

    /// Comma-separated list of approver identifiers required on rotation.
    #[arg(long, env = "REQUIRED_APPROVERS", value_delimiter = ',')]
    pub required_approvers: Vec<String>,

    /// Secondary index backend selection.
    #[arg(long, env = "INDEX_BACKEND", value_enum, default_value_t = IndexBackendKind::Sqlite)]
    pub index_backend: IndexBackendKind,

    /// Governance-token freshness window, in seconds.
    #[arg(long, env = "TOKEN_WINDOW_SECONDS", default_value_t = DEFAULT_WINDOW_SECONDS)]
    pub token_window_seconds: u64,
}

impl LedgerConfig {
    /// Path to the index write-ahead log, derived from `index_path`.
    pub fn index_wal_path(&self) -> PathBuf {
        self.index_path.with_extension("wal")
    }

    /// Directory for per-epoch snapshot files, derived from `epoch_state_path`.
    pub fn epoch_snapshot_dir(&self) -> PathBuf {
        self.epoch_state_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("epoch_snapshots")
    }

    /// Path to the token guard's freshness state.
    pub fn token_guard_state_path(&self) -> PathBuf {
        self.signing_keys_dir
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("token_guard_state.json")
    }

    /// A config rooted entirely under `dir`, useful for tests.
    pub fn under_dir(dir: &std::path::Path) -> Self {
        LedgerConfig {
            ledger_path: dir.join("ledger.jsonl"),
            index_path: dir.join("ledger_index.db"),
            merkle_state_path: dir.join("merkle_state.json"),
            epoch_state_path: dir.join("epoch_state.json"),
            signing_keys_dir: dir.join("signing_keys"),
            key_id: None,
            governance_token: Some("test-governance-token".to_string()),
            required_approvers: Vec::new(),
            index_backend: IndexBackendKind::default(),
            token_window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn derived_paths_sit_alongside_their_roots() {
        let dir = tempdir().unwrap();
        let config = LedgerConfig::under_dir(dir.path());
        assert_eq!(config.index_wal_path(), dir.path().join("ledger_index.wal"));
        assert_eq!(config.epoch_snapshot_dir(), dir.path().join("epoch_snapshots"));
    }
}
