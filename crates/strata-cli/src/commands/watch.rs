//! Watch command - track filesystem changes and reindex incrementally.

use crate::app::App;
use crossbeam_channel::{unbounded, RecvTimeoutError};
use notify::{Event, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{ChangeEvent, ClosureTask, Config, FileNode, NoRefresh, UpdateMode};
use tracing::{error, info};

/// Run the watch command.
pub fn run(config: Config, root: &Path) -> anyhow::Result<()> {
    let debounce = Duration::from_millis(config.indexing.debounce_ms);
    let max_batch_wait = Duration::from_millis(config.indexing.max_batch_wait_ms);
    let app = Arc::new(App::new(config, root)?);

    // Start from a consistent baseline before tracking deltas.
    println!("Building baseline index for {} ...", app.root_path.display());
    queue_full_update(&app)?;
    app.engine.wait_for_smart()?;

    let (tx, rx) = unbounded();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let _ = tx.send(result);
    })?;
    watcher.watch(&app.root_path, RecursiveMode::Recursive)?;

    println!("Watching for changes. Press Ctrl+C to stop.");

    // Handles for translating notify paths back into tree nodes.
    let mut nodes: HashMap<PathBuf, Arc<FileNode>> = HashMap::new();
    collect_nodes(&app.root, &mut nodes);

    let mut first_pending: Option<Instant> = None;
    let mut last_event: Option<Instant> = None;

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Ok(event)) => {
                if translate_event(&app, &mut nodes, &event) {
                    let now = Instant::now();
                    first_pending.get_or_insert(now);
                    last_event = Some(now);
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "Watch error");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // Flush after a quiet window, or once the batch has waited long
        // enough regardless of further events.
        if let (Some(first), Some(last)) = (first_pending, last_event) {
            if last.elapsed() >= debounce || first.elapsed() >= max_batch_wait {
                queue_incremental_update(&app)?;
                first_pending = None;
                last_event = None;
            }
        }
    }

    app.engine.shutdown();
    println!("Watch stopped.");
    Ok(())
}

fn queue_full_update(app: &Arc<App>) -> anyhow::Result<()> {
    let worker = app.clone();
    let key = format!("catalog:{}", app.root_path.display());
    app.engine
        .queue_task(Box::new(ClosureTask::new(key, move |cancel| {
            let items =
                worker
                    .engine
                    .collect_target_items(worker.target, &worker.root, cancel)?;
            let outcome = worker.engine.update_index(
                &worker.handle,
                &[items],
                UpdateMode::Apply,
                &NoRefresh,
                cancel,
            )?;
            info!(processed = outcome.processed, "Baseline indexed");
            Ok(())
        })))?;
    Ok(())
}

fn queue_incremental_update(app: &Arc<App>) -> anyhow::Result<()> {
    let worker = app.clone();
    let key = format!("apply-changes:{}", app.root_path.display());
    // An equal task already queued covers these changes too: the change
    // set is drained when the task runs, not when it is queued.
    app.engine
        .queue_task(Box::new(ClosureTask::new(key, move |cancel| {
            let changes = worker.engine.drain_changes();
            if changes.is_empty() {
                return Ok(());
            }
            let outcome = worker.engine.apply_changes(
                &worker.handle,
                worker.target,
                &changes,
                &NoRefresh,
                cancel,
            )?;
            info!(
                processed = outcome.processed,
                removed = outcome.removed,
                "Applied changes"
            );
            Ok(())
        })))?;
    Ok(())
}

/// Feed one notify event through the change tracker. Returns whether any
/// signal was recorded.
///
/// Notify only reports post-apply state, so deletions are synthesized as
/// the pre-apply half (the old node handle is still at hand) and
/// everything else as the post-apply half.
fn translate_event(
    app: &Arc<App>,
    nodes: &mut HashMap<PathBuf, Arc<FileNode>>,
    event: &Event,
) -> bool {
    let before = app.engine.pending_changes();
    for path in &event.paths {
        if path.exists() {
            let node = nodes
                .entry(path.clone())
                .or_insert_with(|| {
                    if path.is_dir() {
                        app.tree.dir(path.clone())
                    } else {
                        app.tree.file(path.clone())
                    }
                })
                .clone();
            app.engine
                .notify_after(&[ChangeEvent::content_changed(node)]);
        } else if let Some(node) = nodes.remove(path) {
            node.invalidate();
            app.engine.notify_before(&[ChangeEvent::deleted(node)]);
        }
    }
    app.engine.pending_changes() > before
}

fn collect_nodes(node: &Arc<FileNode>, nodes: &mut HashMap<PathBuf, Arc<FileNode>>) {
    nodes.insert(node.path().to_path_buf(), node.clone());
    for child in node.children().unwrap_or_default() {
        collect_nodes(&child, nodes);
    }
}
