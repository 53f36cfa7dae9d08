// src/render.rs

//! The background report renderer.
//!
//! A dedicated worker that, on a fixed cadence, snapshots the run into
//! `run.json` and a freshly staged report directory, then swaps the `html`
//! symlink over to it. It communicates with the dispatcher only through the
//! filesystem and a shutdown signal; a failed render is logged and retried
//! on the next tick. The shutdown signal flushes one final render before
//! the worker exits.
//!
//! Superseded report directories are marked expired and deleted once no
//! external reader holds their lock.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::report::{consolidate, write_run_json};
use crate::rundir::{atomic_symlink, atomic_write, is_expired, mark_expired, LockableDirectory};

/// Seconds between renders.
const RENDER_PERIOD: Duration = Duration::from_secs(2);

/// Spawn the renderer worker. It runs until the shutdown signal fires.
pub fn spawn_renderer(store: CacheStore, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(RENDER_PERIOD);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if let Err(e) = render_once(&store) {
                        warn!(error = %e, "report render failed; will retry on next tick");
                    }
                }
                _ = shutdown.changed() => {
                    if let Err(e) = render_once(&store) {
                        warn!(error = %e, "final report render failed");
                    }
                    debug!("renderer stopped");
                    break;
                }
            }
        }
    })
}

/// Snapshot the run once: consolidate `run.json`, stage a report
/// directory, swap the `html` symlink, and collect expired directories.
pub fn render_once(store: &CacheStore) -> Result<()> {
    let run = store.load()?;
    let report = consolidate(&run, false);
    write_run_json(store, &report)?;

    stage_report(store, &report)?;
    cleanup_expired(store);

    Ok(())
}

/// Stage a new report directory and atomically repoint `html` at it.
///
/// The staged directory holds the snapshot the external HTML renderer
/// consumes; the previous target is marked expired for later cleanup.
fn stage_report(store: &CacheStore, report: &crate::report::RunReport) -> Result<()> {
    let reports_dir = store.reports_dir();
    fs::create_dir_all(&reports_dir)
        .with_context(|| format!("creating reports directory {:?}", reports_dir))?;

    let staged = reports_dir.join(Uuid::new_v4().to_string());
    fs::create_dir(&staged).with_context(|| format!("staging report directory {:?}", staged))?;

    let json = serde_json::to_vec_pretty(report).context("serializing staged report")?;
    atomic_write(staged.join("run.json"), &json)?;

    let previous = fs::read_link(store.html_link()).ok();
    atomic_symlink(&staged, store.html_link())?;

    if let Some(previous) = previous {
        if let Err(e) = mark_expired(&previous) {
            warn!(
                dir = %previous.display(),
                error = %e,
                "could not mark superseded report as expired"
            );
        }
    }

    Ok(())
}

/// Delete report directories that are expired and not locked by an
/// external reader. Best effort; failures are logged and retried on a
/// later tick.
fn cleanup_expired(store: &CacheStore) {
    let current = fs::read_link(store.html_link()).ok();

    let entries = match fs::read_dir(store.reports_dir()) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || Some(&path) == current.as_ref() {
            continue;
        }
        if !is_expired(&path) || LockableDirectory::is_locked(&path) {
            continue;
        }
        if let Err(e) = fs::remove_dir_all(&path) {
            warn!(
                dir = %path.display(),
                error = %e,
                "could not remove expired report directory"
            );
        }
    }
}
