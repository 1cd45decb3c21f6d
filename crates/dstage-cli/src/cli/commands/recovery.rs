//! `dstage recovery`: show what the last run left mid-transfer.

use anyhow::Result;
use dstage_core::config::StagingConfig;
use dstage_core::recovery;

pub fn run_recovery(cfg: &StagingConfig) -> Result<()> {
    let path = cfg.dump_path();
    let interrupted = recovery::read_interrupted(&path)?;
    if interrupted.is_empty() {
        println!("No interrupted transfers in {}.", path.display());
        return Ok(());
    }
    println!("{} interrupted transfer(s) in {}:", interrupted.len(), path.display());
    for destination in interrupted {
        println!("  {}", destination);
    }
    Ok(())
}
