//! Constructs and owns every engine a ledger instance needs.
//!
//! Replaces the module-level global paths the originating system used
//! with an explicit value: a [`LedgerContext`] is built once from a
//! [`LedgerConfig`] and threaded through the Receipt Engine, Verifier, and
//! repair tooling. This also makes it trivial to stand up an isolated
//! ledger per test with [`LedgerContext::open`] against a temp directory.

use std::fs;

use crate::config::{IndexBackendKind, LedgerConfig};
use crate::errors::Result;
use crate::index::kv::KvIndex;
#[cfg(feature = "sqlite")]
use crate::index::sqlite::SqliteIndex;
use crate::index::{IndexBackend, IndexWriter};
use crate::keys::KeyRegistry;
use crate::log::LedgerLog;
use crate::merkle::{MerkleState, PersistedMerkleState};
use crate::epoch::EpochManager;
use crate::token_guard::TokenGuard;

/// Everything the Receipt Engine, Verifier, and repair tooling need,
/// opened once against a [`LedgerConfig`].
pub struct LedgerContext {
    /// The active configuration this context was opened with.
    pub config: LedgerConfig,
    /// The append-only log.
    pub log: LedgerLog,
    /// The WAL-guarded secondary index.
    pub index: IndexWriter<Box<dyn IndexBackend>>,
    /// The key registry.
    pub keys: KeyRegistry,
    /// The governance token freshness guard.
    pub token_guard: TokenGuard,
    /// The epoch manager.
    pub epoch: EpochManager,
    path_to_merkle_state: std::path::PathBuf,
}

impl LedgerContext {
    /// Opens (or initializes) every subsystem described by `config`.
    pub fn open(config: LedgerConfig) -> Result<Self> {
        let log = LedgerLog::new(&config.ledger_path);
        let backend: Box<dyn IndexBackend> = match config.index_backend {
            #[cfg(feature = "sqlite")]
            IndexBackendKind::Sqlite => Box::new(SqliteIndex::open(&config.index_path)?),
            #[cfg(not(feature = "sqlite"))]
            IndexBackendKind::Sqlite => Box::new(KvIndex::open(&config.index_path)?),
            IndexBackendKind::Rocksdb => Box::new(KvIndex::open(&config.index_path)?),
        };
        let index = IndexWriter::new(backend, config.index_wal_path())?;
        let keys = KeyRegistry::open(
            &config.signing_keys_dir,
            config.governance_token.clone(),
            config.required_approvers.clone(),
            config.key_id.clone(),
        )?;
        let token_guard = TokenGuard::open(config.token_guard_state_path(), config.token_window_seconds)?;
        let epoch = EpochManager::open(&config.epoch_state_path, config.epoch_snapshot_dir())?;
        let path_to_merkle_state = config.merkle_state_path.clone();

        let mut ctx = LedgerContext {
            config,
            log,
            index,
            keys,
            token_guard,
            epoch,
            path_to_merkle_state,
        };
        if ctx.index.needs_recovery()? {
            ctx.index.recover()?;
        }
        Ok(ctx)
    }

    /// Loads the persisted Merkle accumulator state, or the empty state if
    /// none has been written yet.
    pub fn load_merkle_state(&self) -> Result<MerkleState> {
        if !self.path_to_merkle_state.exists() {
            return Ok(MerkleState::default());
        }
        let bytes = fs::read(&self.path_to_merkle_state)?;
        let persisted: PersistedMerkleState = serde_json::from_slice(&bytes)?;
        persisted.into_checked_state()
    }

    /// Atomically persists `state` as the ledger's current Merkle
    /// accumulator, sealing it with an integrity digest.
    pub fn commit_merkle_state(&self, state: &MerkleState) -> Result<()> {
        let persisted = PersistedMerkleState::seal(
            state,
            crate::config::AUDITOR_IDENTITY,
            &crate::time::now_canonical(),
        )?;
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        let tmp = self.path_to_merkle_state.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path_to_merkle_state)?;
        Ok(())
    }

    /// Path to the persisted Merkle state file.
    pub fn merkle_state_path(&self) -> &std::path::Path {
        &self.path_to_merkle_state
    }
}
