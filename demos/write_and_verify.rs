//! Writes a handful of receipts into a fresh ledger rooted at a temp
//! directory, then verifies it end to end.

use auditledger::config::LedgerConfig;
use auditledger::context::LedgerContext;
use auditledger::{verify_ledger, write_receipt};

fn main() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = LedgerContext::open(LedgerConfig::under_dir(dir.path()))?;

    for i in 0..5u8 {
        let payload = serde_json::json!({"node_id": i, "status": "VERIFIED"});
        let state_hash = format!("{:064x}", i);
        let receipt = write_receipt(&mut ctx, "STATE_AUDITED", &payload, &state_hash)?;
        println!(
            "entry {i}: epoch={} merkle_root={}",
            receipt.epoch_id, receipt.merkle_root
        );
    }

    verify_ledger(&ctx)?;
    println!("ledger verified: {} entries", ctx.log.len()?);
    Ok(())
}
