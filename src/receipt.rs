//! The Receipt Engine: orchestrates canonical serialization, hashing,
//! signing, Merkle accumulation, epoch assignment, and the append-only
//! write itself into a single atomic-feeling operation.

use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::AUDITOR_IDENTITY;
use crate::context::LedgerContext;
use crate::errors::{LedgerError, Result};
use crate::hashing::{hash_value, sha256_hex};
use crate::index::IndexEntry;
use crate::serialization::{canonical_json, normalize, to_json, CanonicalValue};
use crate::time::now_canonical;

/// Event types this ledger accepts. Any other string is rejected at
/// `write_receipt` time.
pub const ALLOWED_EVENT_TYPES: &[&str] = &["STATE_AUDITED", "CONTRADICTION_DETECTED"];

/// A fully signed, Merkle-anchored ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// The receipt's event type.
    pub event_type: String,
    /// Canonical UTC timestamp.
    pub timestamp: String,
    /// The normalized payload.
    pub payload: CanonicalValue,
    /// SHA-256 of the canonical payload.
    pub payload_hash: String,
    /// Caller-supplied hex digest of the audited state.
    pub audited_state_hash: String,
    /// Fixed auditor identity string.
    pub auditor: String,
    /// Identifier of the key that signed this receipt.
    pub key_id: String,
    /// Hex Ed25519 signature over the pre-signature canonical body.
    pub signature: String,
    /// Hash of the previous entry, `None` for genesis.
    pub previous_entry_hash: Option<String>,
    /// `<token_digest>:<ledger_counter>` anti-replay tag.
    pub governance_freshness_tag: String,
    /// This entry's own hash (excludes itself, `merkle_root`, `epoch_id`).
    pub entry_hash: String,
    /// The Merkle root after this entry was applied.
    pub merkle_root: String,
    /// This entry's assigned epoch identifier.
    pub epoch_id: String,
}

fn validate_state_hash(value: &str) -> Result<()> {
    let is_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());
    if (value.len() == 32 || value.len() == 64) && is_hex(value) {
        Ok(())
    } else {
        Err(LedgerError::InvalidStateHash(value.to_string()))
    }
}

/// Writes a new receipt, threading it through every core component:
/// canonicalize, freshness-check, sign, chain, accumulate, assign epoch,
/// append, index, commit.
pub fn write_receipt(
    ctx: &mut LedgerContext,
    event_type: &str,
    payload: &JsonValue,
    audited_state_hash: &str,
) -> Result<Receipt> {
    if !ALLOWED_EVENT_TYPES.contains(&event_type) {
        return Err(LedgerError::InvalidEventType(event_type.to_string()));
    }
    if !payload.is_object() {
        return Err(LedgerError::InvalidPayload {
            reason: "payload must be a JSON object".into(),
        });
    }
    validate_state_hash(audited_state_hash)?;

    let timestamp = now_canonical();
    let normalized = normalize(payload)?;
    let payload_hash = hash_value(&normalized)?;

    let merkle_state = ctx.load_merkle_state()?;
    let ledger_counter = merkle_state.entry_count;
    let freshness_tag = ctx
        .token_guard
        .validate(ctx.config.governance_token.as_deref(), ledger_counter)?;

    let (key_id, signing_key) = ctx.keys.load_active()?;

    let canonical_event = serde_json::json!({
        "event_type": event_type,
        "timestamp": timestamp,
        "payload": to_json(&normalized),
        "payload_hash": payload_hash,
        "audited_state_hash": audited_state_hash,
        "auditor": AUDITOR_IDENTITY,
        "key_id": key_id,
    });
    let canonical_event_normalized = normalize(&canonical_event)?;
    let signable_bytes = canonical_json(&canonical_event_normalized)?;
    let signature = hex::encode(signing_key.sign(&signable_bytes).to_bytes());

    let previous_entry_hash = merkle_state.last_leaf_hash.clone();

    let mut ledger_body = canonical_event;
    ledger_body["signature"] = serde_json::json!(signature);
    ledger_body["previous_entry_hash"] = serde_json::json!(previous_entry_hash);
    ledger_body["governance_freshness_tag"] = serde_json::json!(freshness_tag);
    let ledger_body_normalized = normalize(&ledger_body)?;
    let entry_hash = sha256_hex(&canonical_json(&ledger_body_normalized)?);

    let next_merkle_state = merkle_state.apply_leaf(&entry_hash)?;
    let merkle_root = next_merkle_state.root();
    let epoch_id = ctx
        .epoch
        .record_entry(&entry_hash, &timestamp, &next_merkle_state)?;

    let mut final_entry = ledger_body;
    final_entry["entry_hash"] = serde_json::json!(entry_hash);
    final_entry["merkle_root"] = serde_json::json!(merkle_root);
    final_entry["epoch_id"] = serde_json::json!(epoch_id);
    let final_entry_normalized = normalize(&final_entry)?;
    let final_bytes = canonical_json(&final_entry_normalized)?;

    let offset = ctx.log.append(&final_bytes)?;

    ctx.index.append(IndexEntry {
        ledger_offset: offset,
        event_type: event_type.to_string(),
        state_hash: audited_state_hash.to_string(),
        payload_hash: payload_hash.clone(),
        timestamp: timestamp.clone(),
        merkle_root: merkle_root.clone(),
        entry_hash: entry_hash.clone(),
        previous_entry_hash: previous_entry_hash.clone(),
    })?;

    ctx.commit_merkle_state(&next_merkle_state)?;

    let receipt: Receipt = serde_json::from_value(final_entry)?;
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use tempfile::tempdir;

    fn open_ctx(dir: &std::path::Path) -> LedgerContext {
        LedgerContext::open(LedgerConfig::under_dir(dir)).unwrap()
    }

    #[test]
    fn genesis_write_has_no_previous_entry_hash() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        let payload = serde_json::json!({"node_id": 0, "status": "VERIFIED"});
        let receipt = write_receipt(&mut ctx, "STATE_AUDITED", &payload, &"0".repeat(64)).unwrap();
        assert!(receipt.previous_entry_hash.is_none());
        assert!(receipt.epoch_id.starts_with("EPOCH-00000000000000000000-"));
    }

    #[test]
    fn chained_writes_link_previous_entry_hash() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        let payload = serde_json::json!({"node_id": 0});
        let first = write_receipt(&mut ctx, "STATE_AUDITED", &payload, &"1".repeat(64)).unwrap();
        let second = write_receipt(&mut ctx, "STATE_AUDITED", &payload, &"2".repeat(64)).unwrap();
        assert_eq!(second.previous_entry_hash.as_deref(), Some(first.entry_hash.as_str()));
        assert_ne!(first.merkle_root, second.merkle_root);
    }

    #[test]
    fn rejects_unknown_event_type() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        let payload = serde_json::json!({});
        let err = write_receipt(&mut ctx, "NOT_A_REAL_EVENT", &payload, &"1".repeat(64)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidEventType(_)));
    }

    #[test]
    fn rejects_non_object_payload() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        let err = write_receipt(&mut ctx, "STATE_AUDITED", &serde_json::json!([1, 2]), &"1".repeat(64))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidPayload { .. }));
    }

    #[test]
    fn rejects_malformed_state_hash() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        let err = write_receipt(&mut ctx, "STATE_AUDITED", &serde_json::json!({}), "not-hex").unwrap_err();
        assert!(matches!(err, LedgerError::InvalidStateHash(_)));
    }

    #[test]
    fn entry_hash_excludes_itself_merkle_root_and_epoch_id() {
        let dir = tempdir().unwrap();
        let mut ctx = open_ctx(dir.path());
        let receipt = write_receipt(&mut ctx, "STATE_AUDITED", &serde_json::json!({"a": 1}), &"1".repeat(64)).unwrap();

        let reconstructed = serde_json::json!({
            "event_type": receipt.event_type,
            "timestamp": receipt.timestamp,
            "payload": to_json(&receipt.payload.0),
            "payload_hash": receipt.payload_hash,
            "audited_state_hash": receipt.audited_state_hash,
            "auditor": receipt.auditor,
            "key_id": receipt.key_id,
            "signature": receipt.signature,
            "previous_entry_hash": receipt.previous_entry_hash,
            "governance_freshness_tag": receipt.governance_freshness_tag,
        });
        let normalized = normalize(&reconstructed).unwrap();
        let recomputed = sha256_hex(&canonical_json(&normalized).unwrap());
        assert_eq!(recomputed, receipt.entry_hash);
    }
}
