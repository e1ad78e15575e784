//! Query command - look up indexed files by key pattern.

use crate::app::App;
use crate::OutputFormat;
use glob::Pattern;
use serde::Serialize;
use std::path::Path;
use strata_core::{Config, ReadPolicy, TargetScope};

#[derive(Serialize)]
struct QueryRow {
    key: String,
    crc32: String,
    len: u64,
}

/// Run the query command.
pub fn run(
    config: Config,
    root: &Path,
    pattern: &str,
    limit: usize,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let pattern = Pattern::new(pattern)
        .map_err(|e| anyhow::anyhow!("invalid pattern '{}': {}", pattern, e))?;

    let app = App::new(config, root)?;

    let mut matches = Vec::new();
    app.engine
        .process_all_keys(&app.handle, ReadPolicy::RequireSmart, &mut |key| {
            if pattern.matches(key) {
                matches.push(key.clone());
            }
            matches.len() < limit
        })?;
    matches.sort();

    let mut rows = Vec::new();
    for key in matches {
        for digest in app.engine.get_values(
            &app.handle,
            &key,
            &TargetScope::Targets(vec![app.target]),
            ReadPolicy::RequireSmart,
        )? {
            rows.push(QueryRow {
                key: key.clone(),
                crc32: format!("{:08x}", digest.crc32),
                len: digest.len,
            });
        }
    }

    match output {
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("No matches. Run 'strata index' first?");
            }
            for row in &rows {
                println!("{:>10}  {}  {}", row.len, row.crc32, row.key);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    app.engine.shutdown();
    Ok(())
}
