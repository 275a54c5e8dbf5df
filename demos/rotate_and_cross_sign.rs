//! Writes receipts under one signing key, force-rotates to a fresh key,
//! writes more receipts, and confirms the whole ledger still verifies
//! under the rotated key registry (legacy keys stay trusted).

use auditledger::config::LedgerConfig;
use auditledger::context::LedgerContext;
use auditledger::{verify_ledger, write_receipt};

fn main() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = LedgerContext::open(LedgerConfig::under_dir(dir.path()))?;

    for i in 0..2u8 {
        write_receipt(
            &mut ctx,
            "STATE_AUDITED",
            &serde_json::json!({"node_id": i}),
            &format!("{:064x}", i),
        )?;
    }
    let alpha = ctx.keys.active_key_id().unwrap().to_string();
    println!("wrote 2 receipts under key '{alpha}'");

    let (priv_path, pub_path) = ctx.keys.rotate_key("scheduled", None, Some("bravo".into()), true)?;
    println!("rotated to 'bravo': {} / {}", priv_path.display(), pub_path.display());

    for i in 2..4u8 {
        write_receipt(
            &mut ctx,
            "STATE_AUDITED",
            &serde_json::json!({"node_id": i}),
            &format!("{:064x}", i),
        )?;
    }

    verify_ledger(&ctx)?;
    let alpha_record = ctx.keys.record(&alpha).unwrap();
    println!(
        "'{alpha}' status={:?} deprecation_window={:?}",
        alpha_record.status, alpha_record.deprecation_window
    );
    println!("ledger with a key rotation mid-stream verifies cleanly");
    Ok(())
}
