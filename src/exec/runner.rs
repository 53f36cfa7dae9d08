// src/exec/runner.rs

//! The per-job execution wrapper.
//!
//! Given a job spec this writes the preliminary status file, supervises the
//! command, classifies the exit, archives declared outputs into the
//! artifact directory, and writes the final status file. The returned
//! wrapper return code is what the dispatcher uses to decide subtree
//! success; artifact problems are warnings, never failures.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::exec::outcome::{classify, load_outcome_table, Classification, OutcomeTable};
use crate::exec::status::JobStatus;
use crate::exec::supervisor::supervise;
use crate::jobs::JobSpec;

/// Run one job end to end. Returns the classification whose
/// `wrapper_return_code` becomes the wrapper's exit code.
pub async fn run_job(
    store: &CacheStore,
    spec: &JobSpec,
    shutdown: watch::Receiver<bool>,
) -> Result<Classification> {
    let status_path = PathBuf::from(&spec.status_file);

    let mut status = JobStatus::preliminary(spec);
    status.write(&status_path)?;

    let table = load_table(spec);

    info!(job = %spec.display_name(), pipeline = %spec.pipeline_name, "starting job");
    let output = supervise(spec, shutdown).await?;

    let classification = classify(output.exit, spec, table.as_ref());
    debug!(
        job = %spec.display_name(),
        outcome = ?classification.outcome,
        wrapper_return_code = classification.wrapper_return_code,
        "job classified"
    );

    copy_artifacts(store, spec);

    status.end_time = Some(Utc::now());
    status.complete = true;
    status.outcome = Some(classification.outcome);
    status.wrapper_return_code = classification.wrapper_return_code;
    status.command_return_code = output.exit.command_return_code();
    status.timed_out = output.exit.timed_out();
    status.stdout = output.stdout;
    status.stderr = output.stderr;
    status.memory_trace = output.memory_trace;
    status.write(&status_path)?;

    Ok(classification)
}

/// A missing or malformed outcome table downgrades to "no table" with a
/// warning; the run keeps going on the default policy.
fn load_table(spec: &JobSpec) -> Option<OutcomeTable> {
    let path = spec.outcome_table.as_ref()?;
    match load_outcome_table(Path::new(path)) {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(
                job = %spec.display_name(),
                table = %path,
                error = %e,
                "ignoring unreadable outcome table"
            );
            None
        }
    }
}

/// Copy each declared output into `artifacts/<pipeline>/<ci_stage>/`.
fn copy_artifacts(store: &CacheStore, spec: &JobSpec) {
    if spec.outputs.is_empty() {
        return;
    }

    let bucket = store
        .artifacts_dir()
        .join(&spec.pipeline_name)
        .join(&spec.ci_stage);
    if let Err(e) = fs::create_dir_all(&bucket) {
        warn!(
            job = %spec.display_name(),
            dir = %bucket.display(),
            error = %e,
            "could not create artifact directory; skipping artifact copy"
        );
        return;
    }

    for output in &spec.outputs {
        let src = Path::new(output);
        if !src.exists() {
            warn!(
                job = %spec.display_name(),
                output = %output,
                "declared output is missing; not archiving it"
            );
            continue;
        }

        let name = match src.file_name() {
            Some(n) => n,
            None => continue,
        };
        let dest = bucket.join(name);
        if dest.exists() {
            warn!(
                job = %spec.display_name(),
                artifact = %dest.display(),
                "artifact name collides with one from another job; overwriting"
            );
        }

        let result = if src.is_dir() {
            copy_dir(src, &dest)
        } else {
            fs::copy(src, &dest).map(|_| ()).map_err(Into::into)
        };
        if let Err(e) = result {
            warn!(
                job = %spec.display_name(),
                output = %output,
                error = %e,
                "failed to archive output"
            );
        }
    }
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("creating {:?}", dest))?;
    for entry in fs::read_dir(src).with_context(|| format!("reading {:?}", src))? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).with_context(|| format!("copying {:?} to {:?}", from, to))?;
        }
    }
    Ok(())
}
