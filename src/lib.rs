#![deny(missing_docs)]

//! `auditledger` is a tamper-evident, append-only audit ledger.
//!
//! Every write goes through the same pipeline: a caller-supplied payload is
//! canonicalized ([`serialization`]), hashed ([`hashing`]), signed under a
//! governed, rotatable Ed25519 key ([`keys`]), checked against an
//! anti-replay governance-token guard ([`token_guard`]), folded into a
//! Merkle mountain range accumulator ([`merkle`]), assigned to an epoch
//! ([`epoch`]), and appended to a locked, fsync'd log file ([`log`]) with a
//! write-ahead-logged secondary index kept in step ([`index`]). The
//! [`receipt`] module is the orchestrator that threads a single write
//! through all of the above in the order that keeps `entry_hash`
//! non-circular.
//!
//! A ledger produced this way can always be checked independently of the
//! process that wrote it: [`verify`] replays the log end to end against the
//! index and the persisted Merkle state, and [`repair`] provides the
//! offline tooling (divergence scanning, auto-repair, snapshotting,
//! compaction, sharding, diffing, stress generation) to recover from or
//! diagnose drift between them.
//!
//! [`context::LedgerContext`] is the single entry point that owns one open
//! instance of every subsystem above, built from a [`config::LedgerConfig`].

pub mod config;
pub mod context;
pub mod epoch;
pub mod errors;
pub mod hashing;
pub mod index;
pub mod keys;
pub mod log;
pub mod merkle;
pub mod receipt;
pub mod repair;
pub mod serialization;
pub mod time;
pub mod token_guard;
pub mod verify;

pub use config::LedgerConfig;
pub use context::LedgerContext;
pub use errors::{LedgerError, Result};
pub use receipt::{write_receipt, Receipt};
pub use verify::verify_ledger;
