//! Structured error taxonomy shared by every module in this crate.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// A single structured failure, carrying a stable machine-readable code,
/// a human-readable message, and an optional bag of string details.
///
/// Every fallible operation in this crate returns `Result<T, LedgerError>`;
/// callers that need machine-readable output (the CLI, in particular) use
/// [`LedgerError::code`] and [`LedgerError::details`] rather than matching
/// on `Display` text.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A payload value could not be normalized (non-finite float, etc).
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// Why normalization failed.
        reason: String,
    },
    /// A mapping key could not be coerced to a canonical string.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: String,
    },
    /// `event_type` was not one of the allowed values.
    #[error("invalid event type: {0}")]
    InvalidEventType(String),
    /// `audited_state_hash` did not match the expected hex pattern.
    #[error("invalid state hash: {0}")]
    InvalidStateHash(String),
    /// The payload was not a mapping, or failed structural validation.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// Why the payload was rejected.
        reason: String,
    },
    /// No governance token was configured where one is required.
    #[error("governance token missing")]
    TokenMissing,
    /// The governance token's freshness window has elapsed.
    #[error("governance token expired")]
    TokenExpired,
    /// The governance token was reused against the same ledger counter.
    #[error("governance token replay detected at counter {counter}")]
    TokenReplay {
        /// The ledger counter at which the replay was detected.
        counter: u64,
    },
    /// No active signing key is registered.
    #[error("no active signing key")]
    KeyMissing,
    /// Key rotation was denied by policy.
    #[error("key rotation denied: {reason}")]
    KeyRotationDenied {
        /// Why rotation was denied.
        reason: String,
    },
    /// A required approver did not sign off on the rotation.
    #[error("governance approval missing: {missing}")]
    GovernanceApprovalMissing {
        /// Comma-separated list of approvers who did not approve.
        missing: String,
    },
    /// Rotation was attempted before the minimum interval elapsed.
    #[error("rotation attempted too soon, {hours_remaining:.2}h remaining")]
    RotationTooSoon {
        /// Hours remaining before rotation is permitted.
        hours_remaining: f64,
    },
    /// The append-only log's exclusive lock could not be acquired in time.
    #[error("lock acquisition timed out after {attempts} attempts")]
    LockTimeout {
        /// Number of attempts made before giving up.
        attempts: u32,
    },
    /// An underlying filesystem operation failed.
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failed.
    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
    /// The secondary index's schema could not be created or migrated.
    #[error("index schema error: {reason}")]
    IndexSchemaError {
        /// Why schema creation failed.
        reason: String,
    },
    /// The secondary index diverged from the log.
    #[error("index mismatch at offset {offset}: {reason}")]
    IndexMismatch {
        /// The ledger offset at which the mismatch was found.
        offset: u64,
        /// Description of the mismatch.
        reason: String,
    },
    /// The persisted Merkle accumulator state failed an integrity check.
    #[error("merkle state corrupt: {reason}")]
    MerkleStateCorrupt {
        /// Why the persisted state was rejected.
        reason: String,
    },
    /// A computed Merkle root did not match the expected value.
    #[error("merkle root mismatch: expected {expected}, got {actual}")]
    MerkleRootMismatch {
        /// The root found in the log or persisted state.
        expected: String,
        /// The root recomputed from the entries.
        actual: String,
    },
    /// An `epoch_id` did not match the epoch manager's record.
    #[error("epoch mismatch for entry {entry_hash}")]
    EpochMismatch {
        /// The entry whose epoch_id was inconsistent.
        entry_hash: String,
    },
    /// No epoch record exists for a given entry.
    #[error("epoch missing for entry {entry_hash}")]
    EpochMissing {
        /// The entry whose epoch_id could not be found.
        entry_hash: String,
    },
    /// Offline verification found a structural or cryptographic breach.
    #[error("verification failed at stage {stage}, line {line}: {reason}")]
    LedgerVerificationError {
        /// Which verification stage detected the failure (1, 2, or 3).
        stage: u8,
        /// The 1-indexed log line (or index row) at which the failure was found.
        line: u64,
        /// Description of the failure.
        reason: String,
    },
    /// The verifier detected drift that requires `auto_repair`.
    #[error("repair required: {reason}")]
    RepairRequired {
        /// Description of what needs repair.
        reason: String,
    },
    /// A requested snapshot file does not exist or is unreadable.
    #[error("snapshot missing: {0}")]
    SnapshotMissing(String),
    /// `scan_state_divergence` detected drift between log, index, and merkle state.
    #[error("divergence detected: {reason}")]
    DivergenceDetected {
        /// Description of the divergence.
        reason: String,
    },
    /// A signature failed to verify.
    #[error("signature invalid for key {key_id}")]
    SignatureInvalid {
        /// The key identifier the signature claimed to be signed under.
        key_id: String,
    },
    /// Ed25519 key material could not be decoded.
    #[error("key decode failure: {0}")]
    KeyDecode(String),
}

impl LedgerError {
    /// A stable machine-readable code, suitable for CLI JSON output and
    /// cross-language comparison with other implementations of this system.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidValue { .. } => "invalid_value",
            LedgerError::InvalidKey { .. } => "invalid_key",
            LedgerError::InvalidEventType(_) => "invalid_event_type",
            LedgerError::InvalidStateHash(_) => "invalid_state_hash",
            LedgerError::InvalidPayload { .. } => "invalid_payload",
            LedgerError::TokenMissing => "token_missing",
            LedgerError::TokenExpired => "token_expired",
            LedgerError::TokenReplay { .. } => "token_replay",
            LedgerError::KeyMissing => "key_missing",
            LedgerError::KeyRotationDenied { .. } => "key_rotation_denied",
            LedgerError::GovernanceApprovalMissing { .. } => "governance_approval_missing",
            LedgerError::RotationTooSoon { .. } => "rotation_too_soon",
            LedgerError::LockTimeout { .. } => "lock_timeout",
            LedgerError::Io(_) => "io_failure",
            LedgerError::Serde(_) => "serde_failure",
            LedgerError::IndexSchemaError { .. } => "index_schema_error",
            LedgerError::IndexMismatch { .. } => "index_mismatch",
            LedgerError::MerkleStateCorrupt { .. } => "merkle_state_corrupt",
            LedgerError::MerkleRootMismatch { .. } => "merkle_root_mismatch",
            LedgerError::EpochMismatch { .. } => "epoch_mismatch",
            LedgerError::EpochMissing { .. } => "epoch_missing",
            LedgerError::LedgerVerificationError { .. } => "ledger_verification_error",
            LedgerError::RepairRequired { .. } => "repair_required",
            LedgerError::SnapshotMissing(_) => "snapshot_missing",
            LedgerError::DivergenceDetected { .. } => "divergence_detected",
            LedgerError::SignatureInvalid { .. } => "signature_invalid",
            LedgerError::KeyDecode(_) => "key_decode_failure",
        }
    }

    /// Structured detail fields for machine consumption (CLI JSON output).
    pub fn details(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        match self {
            LedgerError::TokenReplay { counter } => {
                map.insert("counter".into(), counter.to_string());
            }
            LedgerError::RotationTooSoon { hours_remaining } => {
                map.insert("hours_remaining".into(), hours_remaining.to_string());
            }
            LedgerError::LockTimeout { attempts } => {
                map.insert("attempts".into(), attempts.to_string());
            }
            LedgerError::IndexMismatch { offset, reason } => {
                map.insert("offset".into(), offset.to_string());
                map.insert("reason".into(), reason.clone());
            }
            LedgerError::MerkleRootMismatch { expected, actual } => {
                map.insert("expected".into(), expected.clone());
                map.insert("actual".into(), actual.clone());
            }
            LedgerError::EpochMismatch { entry_hash } | LedgerError::EpochMissing { entry_hash } => {
                map.insert("entry_hash".into(), entry_hash.clone());
            }
            LedgerError::LedgerVerificationError { stage, line, reason } => {
                map.insert("stage".into(), stage.to_string());
                map.insert("line".into(), line.to_string());
                map.insert("reason".into(), reason.clone());
            }
            LedgerError::SignatureInvalid { key_id } => {
                map.insert("key_id".into(), key_id.clone());
            }
            _ => {}
        }
        map
    }

    /// Render as a single-line JSON record, used by the CLI's error path.
    pub fn to_json_record(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "details": self.details(),
        })
    }
}

impl fmt::Display for ErrorRecordDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_json_record())
    }
}

/// Wrapper used only to expose a `Display` impl for the JSON error record
/// without adding a second inherent `Display` on `LedgerError` itself.
pub struct ErrorRecordDisplay<'a>(pub &'a LedgerError);

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LedgerError>;
