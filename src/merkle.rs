//! Merkle mountain range accumulator.
//!
//! Unlike a balanced binary Merkle tree, an MMR never needs to be rebuilt
//! as it grows: each new leaf either starts a new "mountain" of height 0 or
//! merges with existing mountains of the same height, carrying upward like
//! a binary counter increment. The `peaks` list always has at most
//! `log2(entry_count)` entries, and the root is a right-fold of the peaks.

use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};
use crate::hashing::sha256_hex;
use crate::serialization::canonical_json;

/// Domain-separation prefix for leaf nodes.
const LEAF_PREFIX: &str = "leaf:";
/// Domain-separation prefix for interior nodes.
const NODE_PREFIX: &str = "node:";
/// The root of an empty accumulator. This exact domain string is a fixed
/// legacy constant; it is opaque and must not be reinterpreted.
const EMPTY_ROOT_PREIMAGE: &str = "TESSRAX|MERKLE|EMPTY";

fn leaf_hash(entry_hash: &str) -> String {
    sha256_hex(format!("{LEAF_PREFIX}{entry_hash}").as_bytes())
}

fn node_hash(left: &str, right: &str) -> String {
    sha256_hex(format!("{NODE_PREFIX}{left}:{right}").as_bytes())
}

/// The empty-accumulator root.
pub fn empty_root() -> String {
    sha256_hex(EMPTY_ROOT_PREIMAGE.as_bytes())
}

/// The persisted shape of the accumulator: enough to resume appending
/// leaves and to recompute the root without replaying the whole log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerkleState {
    /// Number of leaves applied so far.
    pub entry_count: u64,
    /// Completed-subtree roots, ascending by height.
    pub peaks: Vec<String>,
    /// The most recently applied leaf's raw (un-wrapped) hash, or `None`
    /// before the first leaf. This is the `previous_entry_hash` seed for
    /// the next receipt.
    pub last_leaf_hash: Option<String>,
}

impl Default for MerkleState {
    fn default() -> Self {
        MerkleState {
            entry_count: 0,
            peaks: Vec::new(),
            last_leaf_hash: None,
        }
    }
}

impl MerkleState {
    /// The root corresponding to this state. `O(peaks.len())`.
    pub fn root(&self) -> String {
        root_of_peaks(&self.peaks)
    }

    /// Applies a new leaf, returning the resulting state without mutating
    /// `self`. Used by the Receipt Engine's prepare/commit split: the new
    /// state is computed, the log and index are written, and only then is
    /// the new state persisted via [`PersistedMerkleState::seal`].
    pub fn apply_leaf(&self, entry_hash: &str) -> Result<MerkleState> {
        require_leaf_shape(entry_hash)?;
        let mut peaks = self.peaks.clone();
        let mut node = leaf_hash(entry_hash);
        let mut counter = self.entry_count;
        while counter & 1 != 0 {
            match peaks.pop() {
                Some(popped) => {
                    node = node_hash(&popped, &node);
                    counter >>= 1;
                }
                None => break,
            }
        }
        peaks.push(node);
        Ok(MerkleState {
            entry_count: self.entry_count + 1,
            peaks,
            last_leaf_hash: Some(entry_hash.to_string()),
        })
    }
}

fn require_leaf_shape(entry_hash: &str) -> Result<()> {
    if entry_hash.len() != 64 || !entry_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LedgerError::InvalidValue {
            reason: format!("leaf hash '{entry_hash}' is not 64 hex characters"),
        });
    }
    Ok(())
}

fn root_of_peaks(peaks: &[String]) -> String {
    match peaks.split_last() {
        None => empty_root(),
        Some((last, rest)) => {
            let mut acc = last.clone();
            for peak in rest.iter().rev() {
                acc = node_hash(peak, &acc);
            }
            acc
        }
    }
}

/// The on-disk envelope wrapping a [`MerkleState`] with an auditor
/// identity, timestamp, and integrity digest over the rest of the fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMerkleState {
    /// Number of leaves applied so far.
    pub entry_count: u64,
    /// Completed-subtree roots, ascending by height.
    pub peaks: Vec<String>,
    /// The most recently applied leaf's hash.
    pub last_leaf_hash: Option<String>,
    /// The root corresponding to `peaks`, cached for quick comparison.
    pub root: String,
    /// Canonical timestamp of the last write.
    pub updated_at: String,
    /// Fixed auditor identity string.
    pub auditor: String,
    /// SHA-256 of the canonical JSON of every other field, used to detect
    /// on-disk corruption independent of the Merkle check itself.
    pub integrity: String,
}

impl PersistedMerkleState {
    fn unsigned(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "entry_count": self.entry_count,
            "peaks": self.peaks,
            "last_leaf_hash": self.last_leaf_hash,
            "root": self.root,
            "updated_at": self.updated_at,
            "auditor": self.auditor,
        }))
    }

    /// Builds a persisted envelope from a state, stamping the integrity
    /// digest fresh.
    pub fn seal(state: &MerkleState, auditor: &str, updated_at: &str) -> Result<Self> {
        let mut record = PersistedMerkleState {
            entry_count: state.entry_count,
            peaks: state.peaks.clone(),
            last_leaf_hash: state.last_leaf_hash.clone(),
            root: state.root(),
            updated_at: updated_at.to_string(),
            auditor: auditor.to_string(),
            integrity: String::new(),
        };
        let unsigned = record.unsigned()?;
        let normalized = crate::serialization::normalize(&unsigned)?;
        record.integrity = sha256_hex(&canonical_json(&normalized)?);
        Ok(record)
    }

    /// Verifies the integrity digest and returns the inner state.
    pub fn into_checked_state(self) -> Result<MerkleState> {
        let unsigned = self.unsigned()?;
        let normalized = crate::serialization::normalize(&unsigned)?;
        let expected = sha256_hex(&canonical_json(&normalized)?);
        if expected != self.integrity {
            return Err(LedgerError::MerkleStateCorrupt {
                reason: "integrity digest does not match persisted fields".into(),
            });
        }
        let state = MerkleState {
            entry_count: self.entry_count,
            peaks: self.peaks,
            last_leaf_hash: self.last_leaf_hash,
        };
        if state.root() != self.root {
            return Err(LedgerError::MerkleStateCorrupt {
                reason: "cached root does not match peaks".into(),
            });
        }
        Ok(state)
    }
}

/// One sibling step in an inclusion proof: the hash to combine with, and
/// which side it sits on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProofStep {
    /// The sibling hash is applied on the left: `node(sibling, acc)`.
    Left(String),
    /// The sibling hash is applied on the right: `node(acc, sibling)`.
    Right(String),
}

/// A compact inclusion proof that a given leaf was applied at a given
/// position within the sequence of leaves that produced `peak`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InclusionProof {
    /// The raw (un-wrapped) leaf hash being proven.
    pub leaf_hash: String,
    /// Sibling path from the leaf up to its mountain's peak.
    pub steps: Vec<ProofStep>,
    /// The peak this leaf's mountain resolves to.
    pub peak: String,
}

impl InclusionProof {
    /// Recomputes the peak from `leaf_hash` and `steps` and checks it
    /// matches the recorded peak.
    pub fn verify(&self) -> bool {
        let mut acc = leaf_hash(&self.leaf_hash);
        for step in &self.steps {
            acc = match step {
                ProofStep::Left(sibling) => node_hash(sibling, &acc),
                ProofStep::Right(sibling) => node_hash(&acc, sibling),
            };
        }
        acc == self.peak
    }
}

struct Mountain {
    node: String,
    path: Option<Vec<ProofStep>>,
}

/// Builds an inclusion proof for the leaf at `index` (0-based, in
/// application order) given the full ordered list of leaf hashes that were
/// applied to produce the accumulator. This replays the MMR construction
/// internally, mirroring [`MerkleState::apply_leaf`]'s carry logic so the
/// resulting peaks are identical to the live accumulator's. It is an
/// offline/diagnostic capability (exercised by the `merkle-profile` CLI
/// command and tests), not something the accumulator tracks incrementally.
pub fn build_proof(leaves: &[String], index: usize) -> Result<InclusionProof> {
    if index >= leaves.len() {
        return Err(LedgerError::InvalidValue {
            reason: format!("leaf index {index} out of range for {} leaves", leaves.len()),
        });
    }
    let mut stack: Vec<Mountain> = Vec::new();
    for (i, entry_hash) in leaves.iter().enumerate() {
        require_leaf_shape(entry_hash)?;
        let mut current = Mountain {
            node: leaf_hash(entry_hash),
            path: if i == index { Some(Vec::new()) } else { None },
        };
        let mut counter = i as u64;
        while counter & 1 != 0 {
            let top = match stack.pop() {
                Some(top) => top,
                None => break,
            };
            let merged_path = match (top.path, current.path) {
                (Some(mut top_path), _) => {
                    top_path.push(ProofStep::Right(current.node.clone()));
                    Some(top_path)
                }
                (None, Some(mut cur_path)) => {
                    cur_path.push(ProofStep::Left(top.node.clone()));
                    Some(cur_path)
                }
                (None, None) => None,
            };
            current = Mountain {
                node: node_hash(&top.node, &current.node),
                path: merged_path,
            };
            counter >>= 1;
        }
        stack.push(current);
    }
    for mountain in stack {
        if let Some(path) = mountain.path {
            return Ok(InclusionProof {
                leaf_hash: leaves[index].clone(),
                steps: path,
                peak: mountain.node,
            });
        }
    }
    Err(LedgerError::InvalidValue {
        reason: "failed to locate proof path; this indicates an accumulator bug".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_root_is_constant() {
        let state = MerkleState::default();
        assert_eq!(state.root(), empty_root());
    }

    #[test]
    fn single_leaf_root_matches_manual_computation() {
        let state = MerkleState::default();
        let entry_hash = sha256_hex(b"entry-0");
        let next = state.apply_leaf(&entry_hash).unwrap();
        assert_eq!(next.root(), leaf_hash(&entry_hash));
        assert_eq!(next.last_leaf_hash.as_deref(), Some(entry_hash.as_str()));
    }

    #[test]
    fn three_leaves_merge_first_two_and_leave_third_as_peak() {
        let mut state = MerkleState::default();
        let hashes: Vec<String> = (0..3).map(|i| sha256_hex(format!("entry-{i}").as_bytes())).collect();
        for h in &hashes {
            state = state.apply_leaf(h).unwrap();
        }
        assert_eq!(state.entry_count, 3);
        assert_eq!(state.peaks.len(), 2);
        let expected_first_peak = node_hash(&leaf_hash(&hashes[0]), &leaf_hash(&hashes[1]));
        assert_eq!(state.peaks[0], expected_first_peak);
        assert_eq!(state.peaks[1], leaf_hash(&hashes[2]));
    }

    #[test]
    fn rejects_non_hex_leaf() {
        let state = MerkleState::default();
        assert!(state.apply_leaf("not-hex").is_err());
    }

    #[test]
    fn persisted_state_round_trips_with_integrity_check() {
        let state = MerkleState::default().apply_leaf(&sha256_hex(b"a")).unwrap();
        let persisted =
            PersistedMerkleState::seal(&state, "auditledger", "2024-01-01T00:00:00.000000Z").unwrap();
        let json = serde_json::to_string(&persisted).unwrap();
        let round_tripped: PersistedMerkleState = serde_json::from_str(&json).unwrap();
        let checked = round_tripped.into_checked_state().unwrap();
        assert_eq!(checked, state);
    }

    #[test]
    fn tampered_persisted_state_fails_integrity_check() {
        let state = MerkleState::default().apply_leaf(&sha256_hex(b"a")).unwrap();
        let mut persisted =
            PersistedMerkleState::seal(&state, "auditledger", "2024-01-01T00:00:00.000000Z").unwrap();
        persisted.entry_count = 99;
        assert!(persisted.into_checked_state().is_err());
    }

    #[test]
    fn inclusion_proof_verifies_for_every_leaf_in_a_five_leaf_run() {
        let hashes: Vec<String> = (0..5).map(|i| sha256_hex(format!("entry-{i}").as_bytes())).collect();
        let mut state = MerkleState::default();
        for h in &hashes {
            state = state.apply_leaf(h).unwrap();
        }
        for i in 0..hashes.len() {
            let proof = build_proof(&hashes, i).unwrap();
            assert!(proof.verify());
            assert!(state.peaks.contains(&proof.peak));
        }
    }

    #[test]
    fn inclusion_proof_rejects_tampered_leaf() {
        let hashes: Vec<String> = (0..4).map(|i| sha256_hex(format!("entry-{i}").as_bytes())).collect();
        let mut proof = build_proof(&hashes, 2).unwrap();
        proof.leaf_hash = sha256_hex(b"different-entry");
        assert!(!proof.verify());
    }
}
