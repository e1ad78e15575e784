//! Index command - build or refresh the catalog.

use crate::app::App;
use std::path::Path;
use std::sync::Arc;
use strata_core::{ClosureTask, Config, NoRefresh, UpdateMode};
use tracing::info;

/// Run the index command.
pub fn run(config: Config, root: &Path, force: bool) -> anyhow::Result<()> {
    let app = Arc::new(App::new(config, root)?);

    if force {
        app.engine.request_rebuild(app.handle.id())?;
    }

    println!("Indexing {} ...", app.root_path.display());

    let worker_app = app.clone();
    let key = format!("catalog:{}", app.root_path.display());
    app.engine.queue_task(Box::new(ClosureTask::new(key, move |cancel| {
        let items = worker_app.engine.collect_target_items(
            worker_app.target,
            &worker_app.root,
            cancel,
        )?;
        let outcome = worker_app.engine.update_index(
            &worker_app.handle,
            &[items],
            UpdateMode::Apply,
            &NoRefresh,
            cancel,
        )?;
        info!(
            processed = outcome.processed,
            removed = outcome.removed,
            "Catalog updated"
        );
        Ok(())
    })))?;

    app.engine.wait_for_smart()?;

    let stats = app
        .engine
        .stats(app.handle.id())
        .ok_or_else(|| anyhow::anyhow!("catalog index vanished"))?;
    println!("✓ {} entries indexed", stats.entry_count);

    app.engine.shutdown();
    Ok(())
}
