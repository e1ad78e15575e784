//! Clear command - delete all stored index data.

use std::fs;
use std::io::{self, Write};
use strata_core::Config;

/// Run the clear command.
pub fn run(config: Config, yes: bool) -> anyhow::Result<()> {
    let storage = config.storage_dir()?;

    if !storage.exists() {
        println!("Nothing to clear.");
        return Ok(());
    }

    if !yes {
        print!("Delete all index data under {}? [y/N] ", storage.display());
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    fs::remove_dir_all(&storage)?;
    println!("✓ Cleared {}", storage.display());
    Ok(())
}
