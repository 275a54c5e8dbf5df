//! Anti-replay freshness guard for the governance token.
//!
//! Every write (and every key rotation) must present a governance token.
//! This module does not validate the token's *authority* — that is the
//! Key Registry's job for rotations, and plain presence for writes — it
//! validates the token's *freshness*: a digest of the same token must not
//! be reused against the same ledger counter, and must not go stale past a
//! configurable window.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};
use crate::hashing::sha256_hex;

/// Default freshness window, in seconds.
pub const DEFAULT_WINDOW_SECONDS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    last_seen_unix: u64,
    last_counter: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct GuardState {
    records: HashMap<String, TokenRecord>,
}

/// Tracks per-token-digest freshness state on disk.
pub struct TokenGuard {
    state_path: PathBuf,
    window_seconds: u64,
    state: GuardState,
}

impl TokenGuard {
    /// Opens (or initializes) the guard state at `state_path`.
    pub fn open(state_path: impl Into<PathBuf>, window_seconds: u64) -> Result<Self> {
        let state_path = state_path.into();
        let state = if state_path.exists() {
            serde_json::from_slice(&fs::read(&state_path)?)?
        } else {
            GuardState::default()
        };
        Ok(TokenGuard {
            state_path,
            window_seconds,
            state,
        })
    }

    /// Validates `token` against `ledger_counter`, returning the freshness
    /// tag (`"<token_digest>:<ledger_counter>"`) to embed in the next
    /// receipt on success.
    ///
    /// Only the token's digest is ever persisted; the plaintext token is
    /// used for this single call and discarded.
    pub fn validate(&mut self, token: Option<&str>, ledger_counter: u64) -> Result<String> {
        let token = token.ok_or(LedgerError::TokenMissing)?;
        let digest = sha256_hex(token.as_bytes());
        let now = unix_now();
        if let Some(record) = self.state.records.get(&digest) {
            if now.saturating_sub(record.last_seen_unix) > self.window_seconds {
                return Err(LedgerError::TokenExpired);
            }
            if record.last_counter == ledger_counter {
                return Err(LedgerError::TokenReplay {
                    counter: ledger_counter,
                });
            }
        }
        self.state.records.insert(
            digest.clone(),
            TokenRecord {
                last_seen_unix: now,
                last_counter: ledger_counter,
            },
        );
        self.persist()?;
        Ok(format!("{digest}:{ledger_counter}"))
    }

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.state)?;
        let tmp = self.state_path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Splits a `governance_freshness_tag` of the form `"<digest>:<counter>"`
/// back into its parts, used by the Verifier to sanity-check the shape of
/// a persisted tag without needing to revalidate it against live state.
pub fn split_tag(tag: &str) -> Option<(&str, u64)> {
    let (digest, counter) = tag.rsplit_once(':')?;
    let counter: u64 = counter.parse().ok()?;
    Some((digest, counter))
}
