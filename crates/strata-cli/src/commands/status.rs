//! Status command - show registry, index and mode state.

use crate::app::App;
use std::path::Path;
use strata_core::Config;

/// Run the status command.
pub fn run(config: Config, root: &Path) -> anyhow::Result<()> {
    let app = App::new(config, root)?;

    println!("Storage:  {}", app.engine.storage_root().display());
    println!("Mode:     {:?}", app.engine.coordinator().mode());
    println!("Registry: {} name(s)", app.engine.registry().len());
    println!("Pending:  {} changed file(s)", app.engine.pending_changes());
    println!();

    for (id, stats) in app.engine.all_stats() {
        let updated = stats
            .last_updated
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never (this run)".to_string());
        println!(
            "{:<12} {:>8} entries  {:>3} target(s)  rebuild: {:<5}  updated: {}",
            id.to_string(),
            stats.entry_count,
            stats.target_count,
            app.engine.needs_rebuild(&id),
            updated
        );
    }

    app.engine.shutdown();
    Ok(())
}
