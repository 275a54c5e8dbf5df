//! Ed25519 key registry: lifecycle, rotation, cross-signing, governance
//! gating.
//!
//! Key material is persisted as hex text (`hex(bytes) + "\n"`) rather than
//! raw bytes, so that registries produced by this crate stay readable by
//! other-language verifiers of the same ledger format. Rotation never
//! deletes a key: the outgoing key is demoted to `legacy` with an explicit
//! deprecation window, so receipts it signed remain verifiable forever.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};
use crate::hashing::sha256_hex;
use crate::time::now_canonical;

/// Lifecycle status of a registered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Currently used to sign new receipts.
    Active,
    /// No longer signs new receipts, but remains trusted for verification
    /// through its deprecation window (and forever, in practice, since
    /// past receipts must stay verifiable).
    Legacy,
}

/// Record of a governance approval for a rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceApproval {
    /// SHA-256 digest of the governance token presented. The plaintext
    /// token is never persisted.
    pub token_digest: String,
    /// Canonical timestamp of approval.
    pub issued_at: String,
    /// Approver identifiers that were satisfied (from `REQUIRED_APPROVERS`),
    /// empty when no multi-approver policy is configured.
    pub approvers: Vec<String>,
}

/// A cross-signature: proof that both the outgoing and incoming key
/// consented to a rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossSignature {
    /// Canonical JSON bytes (as a UTF-8 string) of the signed rotation
    /// payload, kept alongside the signatures so verification does not
    /// depend on reconstructing the exact payload later.
    pub payload: String,
    /// Hex signature from the outgoing key.
    pub previous_signature: String,
    /// Hex signature from the incoming key.
    pub new_signature: String,
}

/// Per-key metadata tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Lifecycle status.
    pub status: KeyStatus,
    /// When the key was generated.
    pub created_at: String,
    /// When the key became active (may equal `created_at`).
    pub activated_at: String,
    /// Free-text reason given at creation/rotation time.
    pub reason: String,
    /// Deprecation window `(start, end)`, set when the key is demoted.
    pub deprecation_window: Option<(String, String)>,
    /// Cross-signature proving handover from the prior active key, absent
    /// for the first (bootstrap) key.
    pub cross_signature: Option<CrossSignature>,
    /// Governance approval recorded for this key's activation.
    pub governance_approval: Option<GovernanceApproval>,
}

/// Rotation scheduling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Minimum hours that must elapse between rotations unless `force`.
    pub min_hours_between_rotations: f64,
    /// Maximum hours a key may remain active before rotation is due.
    pub max_active_age_hours: f64,
    /// Hours a demoted key remains in its explicit deprecation window.
    pub deprecation_window_hours: f64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy {
            min_hours_between_rotations: 1.0,
            max_active_age_hours: 24.0 * 90.0,
            deprecation_window_hours: 24.0 * 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RotationSchedule {
    last_rotation: Option<String>,
    next_rotation_due: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RegistryState {
    active_key: Option<String>,
    keys: BTreeMap<String, KeyRecord>,
    schedule: RotationSchedule,
    policy: RotationPolicy,
}

/// Governs Ed25519 key lifecycle for the ledger.
pub struct KeyRegistry {
    dir: PathBuf,
    state_path: PathBuf,
    governance_token: Option<String>,
    required_approvers: Vec<String>,
    preferred_key_id: Option<String>,
    state: RegistryState,
}

impl KeyRegistry {
    /// Opens (or initializes) the registry rooted at `dir`.
    ///
    /// `preferred_key_id` mirrors the `KEY_ID` configuration knob: when
    /// set, it pins which on-disk key [`load_active`] returns regardless
    /// of the registry's own notion of the active key, e.g. after the
    /// registry directory was restored from a backup whose
    /// `registry_state.json` disagrees with the deployment's intent.
    ///
    /// [`load_active`]: KeyRegistry::load_active
    pub fn open(
        dir: impl Into<PathBuf>,
        governance_token: Option<String>,
        required_approvers: Vec<String>,
        preferred_key_id: Option<String>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let state_path = dir.join("registry_state.json");
        let state = if state_path.exists() {
            serde_json::from_slice(&fs::read(&state_path)?)?
        } else {
            RegistryState::default()
        };
        Ok(KeyRegistry {
            dir,
            state_path,
            governance_token,
            required_approvers,
            preferred_key_id,
            state,
        })
    }

    /// Loads the active signing key, bootstrapping one under reason
    /// `"bootstrap"` if the registry is empty.
    ///
    /// If a `preferred_key_id` was configured and that key's material
    /// exists on disk, it is returned directly, pinning which key signs
    /// new receipts independent of the registry's own `active_key`
    /// pointer.
    pub fn load_active(&mut self) -> Result<(String, SigningKey)> {
        if let Some(preferred) = self.preferred_key_id.clone() {
            if self.private_key_path(&preferred).exists() {
                let signing_key = self.load_signing_key(&preferred)?;
                return Ok((preferred, signing_key));
            }
        }
        if self.state.active_key.is_none() {
            let token = self.governance_token.clone().unwrap_or_else(|| "bootstrap".to_string());
            self.rotate_key("bootstrap", Some(&token), None, true)?;
        }
        let key_id = self.state.active_key.clone().ok_or(LedgerError::KeyMissing)?;
        let signing_key = self.load_signing_key(&key_id)?;
        Ok((key_id, signing_key))
    }

    /// Looks up a verifying key by id, for signature verification. Checked
    /// against both active and legacy keys, since legacy keys must remain
    /// verifiable indefinitely.
    pub fn verifying_key(&self, key_id: &str) -> Result<VerifyingKey> {
        if !self.state.keys.contains_key(key_id) {
            return Err(LedgerError::KeyDecode(format!("unknown key id '{key_id}'")));
        }
        self.load_verifying_key(key_id)
    }

    /// Rotates to a newly generated key.
    ///
    /// If `new_key_id` is `None`, one is derived from the current time.
    /// When a previous active key exists, both keys cross-sign the
    /// rotation payload. When `REQUIRED_APPROVERS` is non-empty, the
    /// supplied governance token (split on commas) must contain every
    /// configured approver id.
    pub fn rotate_key(
        &mut self,
        reason: &str,
        governance_token: Option<&str>,
        new_key_id: Option<String>,
        force: bool,
    ) -> Result<(PathBuf, PathBuf)> {
        self.enforce_rotation_timing(force)?;
        self.enforce_governance(governance_token, force)?;

        let previous_active = self.state.active_key.clone();
        let now = now_canonical();
        let new_key_id = new_key_id.unwrap_or_else(|| format!("key-{}", now.replace([':', '.'], "-")));

        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        self.persist_key_material(&new_key_id, &signing_key)?;

        let cross_signature = match &previous_active {
            Some(prev_id) => {
                let prev_signing = self.load_signing_key(prev_id)?;
                Some(self.cross_sign(prev_id, &prev_signing, &new_key_id, &signing_key, reason, &now)?)
            }
            None => None,
        };

        if let Some(prev_id) = &previous_active {
            if let Some(prev_record) = self.state.keys.get_mut(prev_id) {
                prev_record.status = KeyStatus::Legacy;
                let window_end = add_hours(&now, self.state.policy.deprecation_window_hours);
                prev_record.deprecation_window = Some((now.clone(), window_end));
            }
        }

        let approvers = if self.required_approvers.is_empty() {
            Vec::new()
        } else {
            self.required_approvers.clone()
        };
        let governance_approval = governance_token.map(|token| GovernanceApproval {
            token_digest: sha256_hex(token.as_bytes()),
            issued_at: now.clone(),
            approvers,
        });

        self.state.keys.insert(
            new_key_id.clone(),
            KeyRecord {
                status: KeyStatus::Active,
                created_at: now.clone(),
                activated_at: now.clone(),
                reason: reason.to_string(),
                deprecation_window: None,
                cross_signature,
                governance_approval,
            },
        );
        self.state.active_key = Some(new_key_id.clone());
        self.state.schedule.last_rotation = Some(now.clone());
        self.state.schedule.next_rotation_due =
            Some(add_hours(&now, self.state.policy.max_active_age_hours));
        self.persist_state()?;

        Ok((self.private_key_path(&new_key_id), self.public_key_path(&new_key_id)))
    }

    fn enforce_rotation_timing(&self, force: bool) -> Result<()> {
        if force {
            return Ok(());
        }
        let Some(last_rotation) = &self.state.schedule.last_rotation else {
            return Ok(());
        };
        let last = crate::time::parse_canonical(last_rotation)?;
        let now = chrono::Utc::now();
        let elapsed_hours = (now - last).num_seconds() as f64 / 3600.0;
        let min_hours = self.state.policy.min_hours_between_rotations;
        if elapsed_hours < min_hours {
            return Err(LedgerError::RotationTooSoon {
                hours_remaining: min_hours - elapsed_hours,
            });
        }
        Ok(())
    }

    fn enforce_governance(&self, governance_token: Option<&str>, force: bool) -> Result<()> {
        if let Some(configured) = &self.governance_token {
            if !force {
                match governance_token {
                    Some(presented) if presented == configured => {}
                    Some(_) | None => {
                        return Err(LedgerError::KeyRotationDenied {
                            reason: "governance token mismatch".into(),
                        })
                    }
                }
            }
        }
        if !self.required_approvers.is_empty() {
            let presented: Vec<&str> = governance_token.unwrap_or("").split(',').map(str::trim).collect();
            let missing: Vec<&String> = self
                .required_approvers
                .iter()
                .filter(|approver| !presented.contains(&approver.as_str()))
                .collect();
            if !missing.is_empty() {
                return Err(LedgerError::GovernanceApprovalMissing {
                    missing: missing.into_iter().cloned().collect::<Vec<_>>().join(","),
                });
            }
        }
        Ok(())
    }

    fn cross_sign(
        &self,
        prev_id: &str,
        prev_key: &SigningKey,
        new_id: &str,
        new_key: &SigningKey,
        reason: &str,
        now: &str,
    ) -> Result<CrossSignature> {
        let payload = serde_json::json!({
            "event": "key_rotation",
            "previous_key_id": prev_id,
            "new_key_id": new_id,
            "timestamp": now,
            "reason": reason,
        });
        let normalized = crate::serialization::normalize(&payload)?;
        let bytes = crate::serialization::canonical_json(&normalized)?;
        let previous_signature = hex::encode(prev_key.sign(&bytes).to_bytes());
        let new_signature = hex::encode(new_key.sign(&bytes).to_bytes());
        Ok(CrossSignature {
            payload: String::from_utf8_lossy(&bytes).into_owned(),
            previous_signature,
            new_signature,
        })
    }

    fn persist_key_material(&self, key_id: &str, signing_key: &SigningKey) -> Result<()> {
        let priv_path = self.private_key_path(key_id);
        let pub_path = self.public_key_path(key_id);
        fs::write(&priv_path, format!("{}\n", hex::encode(signing_key.to_bytes())))?;
        fs::write(
            &pub_path,
            format!("{}\n", hex::encode(signing_key.verifying_key().to_bytes())),
        )?;
        Ok(())
    }

    fn private_key_path(&self, key_id: &str) -> PathBuf {
        self.dir.join(format!("{key_id}.priv"))
    }

    fn public_key_path(&self, key_id: &str) -> PathBuf {
        self.dir.join(format!("{key_id}.pub"))
    }

    fn load_signing_key(&self, key_id: &str) -> Result<SigningKey> {
        let text = fs::read_to_string(self.private_key_path(key_id))?;
        let bytes = hex::decode(text.trim())
            .map_err(|e| LedgerError::KeyDecode(format!("key '{key_id}': {e}")))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LedgerError::KeyDecode(format!("key '{key_id}' is not 32 bytes")))?;
        Ok(SigningKey::from_bytes(&array))
    }

    fn load_verifying_key(&self, key_id: &str) -> Result<VerifyingKey> {
        let text = fs::read_to_string(self.public_key_path(key_id))?;
        decode_legacy_verify_key(text.trim())
    }

    fn persist_state(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        let tmp = self.state_path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    /// Read-only view of a key's record, for tooling and tests.
    pub fn record(&self, key_id: &str) -> Option<&KeyRecord> {
        self.state.keys.get(key_id)
    }

    /// The currently active key id, if any.
    pub fn active_key_id(&self) -> Option<&str> {
        self.state.active_key.as_deref()
    }
}

/// Decodes a public-key file's contents, tolerating a historical
/// double-hex-wrapping artifact where the stored text is itself the hex
/// encoding of another hex string (rather than raw key bytes once
/// decoded). Falls back to the first successful decode that yields exactly
/// 32 bytes.
pub fn decode_legacy_verify_key(text: &str) -> Result<VerifyingKey> {
    let first = hex::decode(text).map_err(|e| LedgerError::KeyDecode(e.to_string()))?;
    if let Ok(array) = <[u8; 32]>::try_from(first.as_slice()) {
        if let Ok(key) = VerifyingKey::from_bytes(&array) {
            return Ok(key);
        }
    }
    // Fallback: the bytes we just decoded might themselves be the ASCII
    // hex text of the real key (a known artifact of one historical key
    // generator in this system's lineage).
    let inner_text = String::from_utf8(first).map_err(|e| LedgerError::KeyDecode(e.to_string()))?;
    let second = hex::decode(inner_text.trim()).map_err(|e| LedgerError::KeyDecode(e.to_string()))?;
    let array: [u8; 32] = second
        .try_into()
        .map_err(|_| LedgerError::KeyDecode("verify key is not 32 bytes after double decode".into()))?;
    VerifyingKey::from_bytes(&array).map_err(|e| LedgerError::KeyDecode(e.to_string()))
}

/// Verifies a hex-encoded signature against a message under a verifying
/// key, attributing failures to `key_id` in the returned error.
pub fn verify_hex_signature(
    key: &VerifyingKey,
    message: &[u8],
    signature_hex: &str,
    key_id: &str,
) -> Result<()> {
    let bytes = hex::decode(signature_hex).map_err(|e| LedgerError::KeyDecode(e.to_string()))?;
    let array: [u8; 64] = bytes
        .try_into()
        .map_err(|_| LedgerError::KeyDecode("signature is not 64 bytes".into()))?;
    let signature = Signature::from_bytes(&array);
    key.verify(message, &signature).map_err(|_| LedgerError::SignatureInvalid {
        key_id: key_id.to_string(),
    })
}

fn add_hours(timestamp: &str, hours: f64) -> String {
    match crate::time::parse_canonical(timestamp) {
        Ok(dt) => {
            let seconds = (hours * 3600.0) as i64;
            crate::time::format_canonical(&(dt + chrono::Duration::seconds(seconds)))
        }
        Err(_) => timestamp.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstraps_a_key_on_first_load() {
        let dir = tempdir().unwrap();
        let mut registry = KeyRegistry::open(dir.path(), None, Vec::new(), None).unwrap();
        let (key_id, _signing_key) = registry.load_active().unwrap();
        assert!(registry.record(&key_id).is_some());
    }

    #[test]
    fn rotation_demotes_previous_key_and_cross_signs() {
        let dir = tempdir().unwrap();
        let mut registry = KeyRegistry::open(dir.path(), None, Vec::new(), None).unwrap();
        let (first_id, _) = registry.load_active().unwrap();
        registry
            .rotate_key("scheduled", None, Some("key-two".into()), true)
            .unwrap();
        let first_record = registry.record(&first_id).unwrap();
        assert_eq!(first_record.status, KeyStatus::Legacy);
        assert!(first_record.deprecation_window.is_some());
        let second_record = registry.record("key-two").unwrap();
        assert_eq!(second_record.status, KeyStatus::Active);
        assert!(second_record.cross_signature.is_some());
    }

    #[test]
    fn required_approvers_must_all_be_present() {
        let dir = tempdir().unwrap();
        let mut registry = KeyRegistry::open(
            dir.path(),
            None,
            vec!["alice".to_string(), "bob".to_string()],
            None,
        )
        .unwrap();
        registry.load_active().unwrap();
        let err = registry
            .rotate_key("scheduled", Some("alice"), Some("key-two".into()), false)
            .unwrap_err();
        assert!(matches!(err, LedgerError::GovernanceApprovalMissing { .. }));

        registry
            .rotate_key("scheduled", Some("alice,bob"), Some("key-three".into()), false)
            .unwrap();
        assert_eq!(registry.active_key_id(), Some("key-three"));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let dir = tempdir().unwrap();
        let mut registry = KeyRegistry::open(dir.path(), None, Vec::new(), None).unwrap();
        let (key_id, signing_key) = registry.load_active().unwrap();
        let message = b"hello ledger";
        let signature = hex::encode(signing_key.sign(message).to_bytes());
        let verify_key = registry.verifying_key(&key_id).unwrap();
        verify_hex_signature(&verify_key, message, &signature, &key_id).unwrap();
    }

    #[test]
    fn legacy_keys_remain_verifiable_after_rotation() {
        let dir = tempdir().unwrap();
        let mut registry = KeyRegistry::open(dir.path(), None, Vec::new(), None).unwrap();
        let (first_id, first_signing) = registry.load_active().unwrap();
        let message = b"signed before rotation";
        let signature = hex::encode(first_signing.sign(message).to_bytes());
        registry
            .rotate_key("scheduled", None, Some("key-two".into()), true)
            .unwrap();
        let verify_key = registry.verifying_key(&first_id).unwrap();
        verify_hex_signature(&verify_key, message, &signature, &first_id).unwrap();
    }

    #[test]
    fn preferred_key_id_pins_load_active_past_rotation() {
        let dir = tempdir().unwrap();
        let mut registry = KeyRegistry::open(dir.path(), None, Vec::new(), None).unwrap();
        let (first_id, _) = registry.load_active().unwrap();
        registry
            .rotate_key("scheduled", None, Some("key-two".into()), true)
            .unwrap();
        assert_eq!(registry.active_key_id(), Some("key-two"));

        // Reopening with a preferred key id pinned to the demoted legacy
        // key should still return that key rather than the registry's
        // current active pointer.
        let mut pinned =
            KeyRegistry::open(dir.path(), None, Vec::new(), Some(first_id.clone())).unwrap();
        let (loaded_id, _) = pinned.load_active().unwrap();
        assert_eq!(loaded_id, first_id);
    }

    #[test]
    fn unknown_preferred_key_id_falls_back_to_registry_active() {
        let dir = tempdir().unwrap();
        let mut registry = KeyRegistry::open(dir.path(), None, Vec::new(), None).unwrap();
        let (first_id, _) = registry.load_active().unwrap();
        drop(registry);

        let mut pinned = KeyRegistry::open(
            dir.path(),
            None,
            Vec::new(),
            Some("no-such-key".to_string()),
        )
        .unwrap();
        let (loaded_id, _) = pinned.load_active().unwrap();
        assert_eq!(loaded_id, first_id);
    }
}
