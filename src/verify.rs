//! Multi-stage offline verifier.
//!
//! Verification never trusts the index or the persisted Merkle state: it
//! replays the log from scratch (Stage 1), then checks the index and
//! persisted accumulator against that replay as parity views (Stages 2
//! and 3). A failure at any stage surfaces a single structured
//! [`LedgerError::LedgerVerificationError`] identifying the stage and
//! offending line.

use serde_json::Value as JsonValue;

use crate::context::LedgerContext;
use crate::errors::{LedgerError, Result};
use crate::hashing::{hash_value, sha256_hex};
use crate::keys::{decode_legacy_verify_key, verify_hex_signature};
use crate::merkle::MerkleState;
use crate::receipt::ALLOWED_EVENT_TYPES;
use crate::serialization::{canonical_json, normalize};
use crate::time::parse_canonical;

fn fail(stage: u8, line: u64, reason: impl Into<String>) -> LedgerError {
    LedgerError::LedgerVerificationError {
        stage,
        line,
        reason: reason.into(),
    }
}

fn require_string_field<'a>(entry: &'a JsonValue, field: &str, line: u64) -> Result<&'a str> {
    entry
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| fail(1, line, format!("missing or non-string field '{field}'")))
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Runs Stage 1 (per-entry structural, cryptographic, and chain checks)
/// followed by Stage 2 (index parity) and Stage 3 (persisted Merkle state
/// parity). Returns `Ok(())` only if every stage passes.
pub fn verify_ledger(ctx: &LedgerContext) -> Result<()> {
    let replayed = verify_entries(ctx)?;
    verify_index_parity(ctx, &replayed)?;
    verify_merkle_state_parity(ctx, &replayed)?;
    Ok(())
}

/// The result of replaying every log entry: the final Merkle state plus a
/// flattened view of each entry's fields, for cross-checking against the
/// index.
pub struct ReplayResult {
    /// The Merkle accumulator after applying every entry's leaf.
    pub merkle_state: MerkleState,
    /// One row per log entry, in log order.
    pub rows: Vec<ReplayRow>,
}

/// A single entry's fields as observed during replay, shaped to match
/// [`crate::index::IndexEntry`] for Stage 2 comparison.
#[derive(Debug, Clone)]
pub struct ReplayRow {
    /// 0-indexed log line.
    pub line: u64,
    /// This entry's event type.
    pub event_type: String,
    /// The audited state hash.
    pub state_hash: String,
    /// The payload hash.
    pub payload_hash: String,
    /// Canonical timestamp.
    pub timestamp: String,
    /// The Merkle root recorded on this entry.
    pub merkle_root: String,
    /// This entry's hash.
    pub entry_hash: String,
    /// The previous entry's hash, if any.
    pub previous_entry_hash: Option<String>,
}

/// Stage 1: parses and validates each entry in isolation and in sequence,
/// rebuilding the Merkle accumulator as it goes.
pub fn verify_entries(ctx: &LedgerContext) -> Result<ReplayResult> {
    let mut merkle_state = MerkleState::default();
    let mut rows = Vec::new();
    let mut last_timestamp: Option<chrono::DateTime<chrono::Utc>> = None;
    let mut last_entry_hash: Option<String> = None;

    ctx.log.for_each_line(|line0, bytes| {
        // Stage-1 failures are reported 1-indexed (see `LedgerError::LedgerVerificationError`),
        // while `line0` (and the row we push below) stays 0-indexed to match the log's own
        // addressing scheme.
        let line = line0 + 1;
        let entry: JsonValue = serde_json::from_slice(bytes)
            .map_err(|e| fail(1, line, format!("invalid JSON: {e}")))?;

        let event_type = require_string_field(&entry, "event_type", line)?.to_string();
        if !ALLOWED_EVENT_TYPES.contains(&event_type.as_str()) {
            return Err(fail(1, line, format!("unknown event_type '{event_type}'")));
        }
        let timestamp = require_string_field(&entry, "timestamp", line)?.to_string();
        let payload_hash = require_string_field(&entry, "payload_hash", line)?.to_string();
        let state_hash = require_string_field(&entry, "audited_state_hash", line)?.to_string();
        if !(is_hex_of_len(&state_hash, 32) || is_hex_of_len(&state_hash, 64)) {
            return Err(fail(1, line, format!("audited_state_hash '{state_hash}' has invalid shape")));
        }
        let key_id = require_string_field(&entry, "key_id", line)?.to_string();
        let signature = require_string_field(&entry, "signature", line)?.to_string();
        let entry_hash = require_string_field(&entry, "entry_hash", line)?.to_string();
        let merkle_root = require_string_field(&entry, "merkle_root", line)?.to_string();
        let previous_entry_hash = entry
            .get("previous_entry_hash")
            .and_then(|v| if v.is_null() { None } else { v.as_str().map(str::to_string) });
        let governance_freshness_tag = require_string_field(&entry, "governance_freshness_tag", line)?.to_string();
        let auditor = require_string_field(&entry, "auditor", line)?.to_string();
        let payload = entry
            .get("payload")
            .cloned()
            .ok_or_else(|| fail(1, line, "missing field 'payload'"))?;
        let epoch_id = require_string_field(&entry, "epoch_id", line)?.to_string();

        let parsed_timestamp = parse_canonical(&timestamp).map_err(|_| fail(1, line, "unparseable timestamp"))?;
        if let Some(prev_ts) = last_timestamp {
            if parsed_timestamp < prev_ts {
                return Err(fail(1, line, "timestamp regressed relative to previous entry"));
            }
        }
        last_timestamp = Some(parsed_timestamp);

        let normalized_payload = normalize(&payload).map_err(|e| fail(1, line, e.to_string()))?;
        let recomputed_payload_hash = hash_value(&normalized_payload).map_err(|e| fail(1, line, e.to_string()))?;
        if recomputed_payload_hash != payload_hash {
            return Err(fail(1, line, "payload_hash mismatch"));
        }

        let canonical_event = serde_json::json!({
            "event_type": event_type,
            "timestamp": timestamp,
            "payload": payload,
            "payload_hash": payload_hash,
            "audited_state_hash": state_hash,
            "auditor": auditor,
            "key_id": key_id,
        });
        let canonical_event_normalized = normalize(&canonical_event).map_err(|e| fail(1, line, e.to_string()))?;
        let signable_bytes = canonical_json(&canonical_event_normalized).map_err(|e| fail(1, line, e.to_string()))?;

        let verify_key = ctx
            .keys
            .verifying_key(&key_id)
            .or_else(|_| legacy_single_key_fallback(ctx))
            .map_err(|e| fail(1, line, format!("key '{key_id}' unavailable: {e}")))?;
        verify_hex_signature(&verify_key, &signable_bytes, &signature, &key_id)
            .map_err(|_| fail(1, line, format!("signature invalid under key '{key_id}'")))?;

        if previous_entry_hash != last_entry_hash {
            return Err(fail(1, line, "previous_entry_hash does not match prior entry"));
        }

        let mut ledger_body = canonical_event;
        ledger_body["signature"] = serde_json::json!(signature);
        ledger_body["previous_entry_hash"] = serde_json::json!(previous_entry_hash);
        ledger_body["governance_freshness_tag"] = serde_json::json!(governance_freshness_tag);
        let ledger_body_normalized = normalize(&ledger_body).map_err(|e| fail(1, line, e.to_string()))?;
        let recomputed_entry_hash = sha256_hex(&canonical_json(&ledger_body_normalized).map_err(|e| fail(1, line, e.to_string()))?);
        if recomputed_entry_hash != entry_hash {
            return Err(fail(1, line, "entry_hash recomputation mismatch"));
        }

        merkle_state = merkle_state
            .apply_leaf(&entry_hash)
            .map_err(|e| fail(1, line, e.to_string()))?;
        if merkle_state.root() != merkle_root {
            return Err(fail(1, line, "merkle_root mismatch after applying leaf"));
        }

        if let Some(record) = ctx.epoch.lookup(&entry_hash) {
            if record.epoch_id != epoch_id {
                return Err(fail(1, line, "epoch_id does not match epoch manager record"));
            }
        }

        rows.push(ReplayRow {
            line: line0,
            event_type,
            state_hash,
            payload_hash,
            timestamp,
            merkle_root,
            entry_hash: entry_hash.clone(),
            previous_entry_hash,
        });
        last_entry_hash = Some(entry_hash);
        Ok(())
    })?;

    Ok(ReplayResult { merkle_state, rows })
}

/// Falls back to a single legacy public key file
/// (`<signing_keys_dir>/legacy.pub`) when no `key_id`-addressed key
/// material exists, for ledgers written before multi-key rotation was
/// introduced in a given deployment.
fn legacy_single_key_fallback(ctx: &LedgerContext) -> Result<ed25519_dalek::VerifyingKey> {
    let path = ctx.config.signing_keys_dir.join("legacy.pub");
    let text = std::fs::read_to_string(path)?;
    decode_legacy_verify_key(text.trim())
}

/// Stage 2: compares the index's rows against the replayed rows. Counts
/// must match, every field must match in order, and ledger offsets must be
/// monotonically non-decreasing.
pub fn verify_index_parity(ctx: &LedgerContext, replayed: &ReplayResult) -> Result<()> {
    let index_rows = ctx
        .index
        .backend()
        .all()
        .map_err(|e| fail(2, 0, e.to_string()))?;
    if index_rows.len() != replayed.rows.len() {
        return Err(fail(
            2,
            index_rows.len() as u64,
            format!(
                "index has {} rows but log replay produced {}",
                index_rows.len(),
                replayed.rows.len()
            ),
        ));
    }
    let mut last_offset: Option<u64> = None;
    for (row, replayed_row) in index_rows.iter().zip(replayed.rows.iter()) {
        if let Some(prev) = last_offset {
            if row.ledger_offset < prev {
                return Err(fail(2, row.ledger_offset, "ledger offsets are not monotonic"));
            }
        }
        last_offset = Some(row.ledger_offset);
        if row.event_type != replayed_row.event_type
            || row.state_hash != replayed_row.state_hash
            || row.payload_hash != replayed_row.payload_hash
            || row.merkle_root != replayed_row.merkle_root
            || row.entry_hash != replayed_row.entry_hash
            || row.previous_entry_hash != replayed_row.previous_entry_hash
        {
            return Err(fail(
                2,
                row.ledger_offset,
                format!("index row for entry '{}' does not match log", replayed_row.entry_hash),
            ));
        }
    }
    Ok(())
}

/// Stage 3: compares the persisted Merkle accumulator against the one
/// produced by replay.
pub fn verify_merkle_state_parity(ctx: &LedgerContext, replayed: &ReplayResult) -> Result<()> {
    let persisted = ctx.load_merkle_state().map_err(|e| fail(3, 0, e.to_string()))?;
    if persisted.entry_count != replayed.merkle_state.entry_count {
        return Err(fail(
            3,
            persisted.entry_count,
            "persisted entry_count does not match replayed entry_count",
        ));
    }
    if persisted.root() != replayed.merkle_state.root() {
        return Err(LedgerError::MerkleRootMismatch {
            expected: replayed.merkle_state.root(),
            actual: persisted.root(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::receipt::write_receipt;
    use tempfile::tempdir;

    fn open_ctx(dir: &std::path::Path) -> LedgerContext {
        LedgerContext::open(LedgerConfig::under_dir(dir)).unwrap()
    }

    #[test]
    fn three_clean_writes_verify_ok() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        for i in 0..3u8 {
            write_receipt(
                &mut ctx,
                "STATE_AUDITED",
                &serde_json::json!({"node_id": i}),
                &format!("{:064x}", i),
            )
            .unwrap();
        }
        verify_ledger(&ctx).unwrap();
    }

    #[test]
    fn tampered_payload_hash_fails_stage_one_at_correct_line() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        write_receipt(&mut ctx, "STATE_AUDITED", &serde_json::json!({"a": 1}), &"1".repeat(64)).unwrap();
        write_receipt(&mut ctx, "STATE_AUDITED", &serde_json::json!({"a": 2}), &"2".repeat(64)).unwrap();

        let lines = ctx.log.read_all_lines().unwrap();
        let mut second: JsonValue = serde_json::from_str(&lines[1]).unwrap();
        second["payload_hash"] = serde_json::json!("0".repeat(64));
        let mut rewritten = lines.clone();
        rewritten[1] = serde_json::to_string(&second).unwrap();
        std::fs::write(&ctx.config.ledger_path, rewritten.join("\n") + "\n").unwrap();

        let err = verify_ledger(&ctx).unwrap_err();
        match err {
            LedgerError::LedgerVerificationError { stage, line, reason } => {
                assert_eq!(stage, 1);
                assert_eq!(line, 2);
                assert!(reason.contains("payload_hash"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reordered_entries_break_chain() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        write_receipt(&mut ctx, "STATE_AUDITED", &serde_json::json!({"a": 1}), &"1".repeat(64)).unwrap();
        write_receipt(&mut ctx, "STATE_AUDITED", &serde_json::json!({"a": 2}), &"2".repeat(64)).unwrap();
        write_receipt(&mut ctx, "STATE_AUDITED", &serde_json::json!({"a": 3}), &"3".repeat(64)).unwrap();

        let lines = ctx.log.read_all_lines().unwrap();
        let mut swapped = lines.clone();
        swapped.swap(0, 1);
        std::fs::write(&ctx.config.ledger_path, swapped.join("\n") + "\n").unwrap();

        let err = verify_ledger(&ctx).unwrap_err();
        assert!(matches!(err, LedgerError::LedgerVerificationError { stage: 1, .. }));
    }
}
