use anyhow::Result;
use spanlens_core::config::Config;
use spanlens_state::ledger;
use std::path::Path;

pub fn run(repo_root: &Path, config: &Config) -> Result<()> {
    let path = config.ledger_path(repo_root);
    let report = ledger::repair_ledger(&path)?;
    println!("Ledger: {}", path.display());
    println!("Valid lines:     {}", report.valid);
    println!("Discarded lines: {}", report.discarded);
    if let Some(backup) = &report.backup {
        println!("Backup:          {}", backup.display());
    }
    Ok(())
}
