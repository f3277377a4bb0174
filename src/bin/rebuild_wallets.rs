//! Rebuild every asset's wallets from its transaction log

use anyhow::Result;
use lot_tracker::config::Config;
use lot_tracker::{db, logging, rebuild};
use std::path::PathBuf;

fn main() -> Result<()> {
    logging::init_logging();

    let mut config = Config::load()?;
    if let Some(path) = std::env::args().nth(1) {
        config.database_path = PathBuf::from(path);
    }

    println!("Opening database: {:?}", config.database_path);
    let mut conn = db::init_database(&config.database_path)?;

    println!("Rebuilding all wallets...");
    let reports = rebuild::rebuild_all_wallets(&mut conn)?;

    let mut drifted = 0;
    for report in &reports {
        if report.differences.is_empty() {
            continue;
        }
        drifted += 1;
        println!("Asset {}: {} differences", report.asset_id, report.differences.len());
        for d in &report.differences {
            println!("  {}", d);
        }
    }

    println!(
        "Done! {} assets rebuilt, {} had drifted from their log",
        reports.len(),
        drifted
    );
    Ok(())
}
