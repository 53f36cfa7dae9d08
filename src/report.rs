// src/report.rs

//! Consolidated run reports and run finalization.
//!
//! `run.json` is the one stable external contract: the run document with
//! each job's latest status merged in under `jobs[*].status`, plus a
//! per-pipeline summary. The renderer writes it on every tick from whatever
//! status files exist; the postprocessor writes the final version after the
//! dispatcher returns and seals the cache with end time, status, and the
//! parallelism timeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::cache::{CacheStore, Run, RunStatus};
use crate::engine::Timeline;
use crate::exec::outcome::Outcome;
use crate::exec::status::JobStatus;
use crate::jobs::JobSpec;
use crate::rundir::atomic_write;

/// One job in the consolidated report: the spec with its latest status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub name: String,
    pub status: RunStatus,
}

/// The `run.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub project: String,

    pub version: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub version_patch: u64,

    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,

    pub pools: BTreeMap<String, usize>,
    pub stages: Vec<String>,
    pub parallelism: Timeline,
    #[serde(default)]
    pub aux: serde_json::Value,

    pub pipelines: Vec<PipelineReport>,
    pub jobs: Vec<JobReport>,
}

/// Build the consolidated view of a run from the cache document and the
/// per-job status files.
///
/// With `finalized` set, jobs without a complete status count against their
/// pipeline (they were skipped); otherwise such pipelines are in progress.
pub fn consolidate(run: &Run, finalized: bool) -> RunReport {
    let jobs: Vec<JobReport> = run
        .jobs
        .iter()
        .map(|spec| JobReport {
            spec: spec.clone(),
            status: JobStatus::load_tolerant(Path::new(&spec.status_file)),
        })
        .collect();

    let pipelines = pipeline_reports(&jobs, finalized);

    let status = if finalized {
        run_status(&jobs)
    } else {
        RunStatus::InProgress
    };

    RunReport {
        run_id: run.run_id.clone(),
        project: run.project.clone(),
        version: run.version.clone(),
        version_major: run.version_major,
        version_minor: run.version_minor,
        version_patch: run.version_patch,
        start_time: run.start_time,
        end_time: run.end_time,
        status,
        pools: run.pools.clone(),
        stages: run.stages.clone(),
        parallelism: run.parallelism.clone(),
        aux: run.aux.clone(),
        pipelines,
        jobs,
    }
}

/// The run succeeds iff no status file reports a hard failure; ignored
/// failures do not poison it.
fn run_status(jobs: &[JobReport]) -> RunStatus {
    let any_fail = jobs
        .iter()
        .filter_map(|j| j.status.as_ref())
        .any(|s| s.outcome == Some(Outcome::Fail));
    if any_fail {
        RunStatus::Failure
    } else {
        RunStatus::Success
    }
}

/// Per-pipeline outcomes, in first-appearance order of the job list.
fn pipeline_reports(jobs: &[JobReport], finalized: bool) -> Vec<PipelineReport> {
    let mut order: Vec<String> = Vec::new();
    for job in jobs {
        if !order.contains(&job.spec.pipeline_name) {
            order.push(job.spec.pipeline_name.clone());
        }
    }

    order
        .into_iter()
        .map(|name| {
            let members = jobs.iter().filter(|j| j.spec.pipeline_name == name);

            let mut any_fail = false;
            let mut all_ok = true;
            for job in members {
                match job.status.as_ref() {
                    Some(s) if s.complete => match s.outcome {
                        Some(Outcome::Success) | Some(Outcome::FailIgnored) => {}
                        _ => {
                            any_fail = true;
                            all_ok = false;
                        }
                    },
                    _ => all_ok = false,
                }
            }

            let status = if any_fail {
                RunStatus::Failure
            } else if all_ok {
                RunStatus::Success
            } else if finalized {
                // Incomplete jobs in a finished run were skipped.
                RunStatus::Failure
            } else {
                RunStatus::InProgress
            };

            PipelineReport { name, status }
        })
        .collect()
}

/// Atomically write the consolidated report as `run.json`.
pub fn write_run_json(store: &CacheStore, report: &RunReport) -> Result<()> {
    let json = serde_json::to_vec_pretty(report).context("serializing run.json")?;
    atomic_write(store.run_file(), &json)
}

/// The pipeline postprocessor: seal the cache with end time, final status,
/// and the parallelism timeline, then write the final `run.json`.
pub fn finalize(store: &CacheStore, timeline: Timeline) -> Result<RunReport> {
    let mut run = store.load()?;
    run.end_time = Some(Utc::now());
    run.parallelism = timeline;

    let report = consolidate(&run, true);
    run.status = report.status;

    store.save(&run)?;
    write_run_json(store, &report)?;

    Ok(report)
}
