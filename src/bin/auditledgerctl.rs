//! Command-line front end for `auditledger`.

use std::path::PathBuf;

use auditledger::config::LedgerConfig;
use auditledger::context::LedgerContext;
use auditledger::errors::{ErrorRecordDisplay, LedgerError, Result};
use auditledger::repair::{
    self, auto_repair, export_architecture, export_merkle_svg, generate_high_volume_receipts,
    generate_stress_ledger, profile_replay, scan_state_divergence, semantic_diff,
    snapshot_export, snapshot_restore, LedgerCompactor, LedgerShardPlanner,
};
use auditledger::verify::verify_ledger;
use clap::{Parser, Subcommand};

/// `auditledgerctl` operates the append-only audit ledger: writing
/// receipts is a library API, this binary covers verification, repair,
/// and diagnostic tooling around an existing ledger.
#[derive(Parser)]
#[command(name = "auditledgerctl", version, about)]
struct Cli {
    #[command(flatten)]
    config: LedgerConfig,

    /// Enable verbose (debug-level) logging regardless of RUST_LOG.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replays the log end to end and checks it against the index and
    /// persisted Merkle state.
    VerifyLedger,
    /// Rebuilds the Merkle state and/or index from the log if they have
    /// drifted, and writes a repair report.
    AutoRepair,
    /// Rebuilds the secondary index from the log, discarding its current
    /// contents.
    RebuildIndex,
    /// Prints a field-level diff between two receipt JSON files.
    DiffReceipts {
        /// Path to the left-hand receipt.
        left: PathBuf,
        /// Path to the right-hand receipt.
        right: PathBuf,
    },
    /// Generates a deterministic synthetic ledger for load testing.
    StressHarness {
        /// Output ledger path.
        out: PathBuf,
        /// Number of synthetic receipts to generate.
        #[arg(long, default_value_t = 1000)]
        entries: u64,
    },
    /// Generates a larger synthetic ledger in batches.
    LoadTest {
        /// Output ledger path.
        out: PathBuf,
        /// Number of batches.
        #[arg(long, default_value_t = 10)]
        batches: u64,
        /// Receipts per batch.
        #[arg(long, default_value_t = 1000)]
        batch_size: u64,
    },
    /// Exports the full ledger state (log, Merkle state, index) to one file.
    SnapshotExport {
        /// Output snapshot path.
        out: PathBuf,
    },
    /// Restores the ledger's log, Merkle state, and index from a snapshot.
    SnapshotRestore {
        /// Input snapshot path.
        input: PathBuf,
    },
    /// Times a full parallel-replay pass against the log.
    MerkleProfile {
        /// Maximum acceptable elapsed time in seconds.
        #[arg(long, default_value_t = 5.0)]
        threshold: f64,
    },
    /// Compares log, index, and persisted Merkle state for drift and
    /// classifies the root cause.
    DivergenceScan,
    /// Rotates the active signing key under governance approval.
    RotateKey {
        /// Reason recorded alongside the rotation.
        #[arg(long)]
        reason: String,
        /// Explicit id for the new key; generated if omitted.
        #[arg(long)]
        new_key_id: Option<String>,
        /// Bypass the minimum rotation interval.
        #[arg(long)]
        force: bool,
    },
    /// Rolls the log over to retain only its last N entries.
    Compact {
        /// Number of trailing entries to retain.
        retain: usize,
        /// Output path for the compacted log.
        output: PathBuf,
    },
    /// Splits the log into contiguous shards.
    Shard {
        /// Maximum entries per shard.
        max_entries: usize,
        /// Output directory for shard files.
        #[arg(long, default_value = "shards")]
        output_dir: PathBuf,
    },
    /// Writes a JSON description of the ledger's component architecture
    /// and current size.
    ExportArchitecture {
        /// Output path for the architecture report.
        out: PathBuf,
    },
    /// Renders the persisted Merkle accumulator's peaks as an SVG diagram.
    ExportMerkleSvg {
        /// Output path for the SVG file.
        out: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: Cli) -> Result<serde_json::Value> {
    match cli.command {
        Command::VerifyLedger => {
            let ctx = LedgerContext::open(cli.config)?;
            verify_ledger(&ctx)?;
            Ok(serde_json::json!({"status": "ok"}))
        }
        Command::AutoRepair => {
            let mut ctx = LedgerContext::open(cli.config)?;
            let report = auto_repair(&mut ctx)?;
            Ok(serde_json::to_value(report)?)
        }
        Command::RebuildIndex => {
            let mut ctx = LedgerContext::open(cli.config)?;
            let count = repair::rebuild_index_from_log(&mut ctx)?;
            Ok(serde_json::json!({"rows_rebuilt": count}))
        }
        Command::DiffReceipts { left, right } => {
            let left_json: serde_json::Value = serde_json::from_slice(&std::fs::read(left)?)?;
            let right_json: serde_json::Value = serde_json::from_slice(&std::fs::read(right)?)?;
            Ok(serde_json::to_value(semantic_diff(&left_json, &right_json))?)
        }
        Command::StressHarness { out, entries } => {
            let root = generate_stress_ledger(&out, &cli.config.signing_keys_dir, entries)?;
            Ok(serde_json::json!({"entries": entries, "merkle_root": root}))
        }
        Command::LoadTest { out, batches, batch_size } => {
            let generated = generate_high_volume_receipts(&out, &cli.config.signing_keys_dir, batches, batch_size)?;
            Ok(serde_json::json!({"entries_generated": generated}))
        }
        Command::SnapshotExport { out } => {
            let ctx = LedgerContext::open(cli.config)?;
            snapshot_export(&ctx, &out)?;
            Ok(serde_json::json!({"status": "ok", "path": out}))
        }
        Command::SnapshotRestore { input } => {
            let mut ctx = LedgerContext::open(cli.config)?;
            snapshot_restore(&mut ctx, &input)?;
            Ok(serde_json::json!({"status": "ok"}))
        }
        Command::MerkleProfile { threshold } => {
            let ctx = LedgerContext::open(cli.config)?;
            let (elapsed_seconds, within_threshold) = profile_replay(&ctx.log, threshold)?;
            Ok(serde_json::json!({"elapsed_seconds": elapsed_seconds, "within_threshold": within_threshold}))
        }
        Command::DivergenceScan => {
            let ctx = LedgerContext::open(cli.config)?;
            let report = scan_state_divergence(&ctx)?;
            Ok(serde_json::to_value(report)?)
        }
        Command::RotateKey { reason, new_key_id, force } => {
            let mut ctx = LedgerContext::open(cli.config.clone())?;
            let (priv_path, pub_path) = ctx.keys.rotate_key(
                &reason,
                cli.config.governance_token.as_deref(),
                new_key_id,
                force,
            )?;
            Ok(serde_json::json!({
                "active_key_id": ctx.keys.active_key_id(),
                "private_key_path": priv_path,
                "public_key_path": pub_path,
            }))
        }
        Command::Compact { retain, output } => {
            let ctx = LedgerContext::open(cli.config)?;
            let report = LedgerCompactor::compact(&ctx.log, retain, &output)?;
            Ok(serde_json::to_value(report)?)
        }
        Command::Shard { max_entries, output_dir } => {
            let ctx = LedgerContext::open(cli.config)?;
            let plans = LedgerShardPlanner::shard(&ctx.log, max_entries, &output_dir)?;
            Ok(serde_json::to_value(plans)?)
        }
        Command::ExportArchitecture { out } => {
            let ctx = LedgerContext::open(cli.config)?;
            let report = export_architecture(&ctx, &out)?;
            Ok(serde_json::to_value(report)?)
        }
        Command::ExportMerkleSvg { out } => {
            let ctx = LedgerContext::open(cli.config)?;
            export_merkle_svg(&ctx, &out)?;
            Ok(serde_json::json!({"status": "ok", "path": out}))
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // re-derive values needed after `cli.command` is moved into `run`
    let config_for_log = cli.config.ledger_path.clone();
    tracing::info!(ledger_path = %config_for_log.display(), "auditledgerctl starting");

    match run(cli) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        }
        Err(err) => {
            eprintln!("{}", ErrorRecordDisplay(&err));
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &LedgerError) -> i32 {
    match err {
        LedgerError::LedgerVerificationError { .. }
        | LedgerError::DivergenceDetected { .. }
        | LedgerError::RepairRequired { .. } => 2,
        _ => 1,
    }
}
