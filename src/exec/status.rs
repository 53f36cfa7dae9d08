// src/exec/status.rs

//! Per-job status documents.
//!
//! The executor writes each job's status file twice: a preliminary document
//! as the job starts (`complete = false`) and a final one when it ends.
//! Both writes go through the atomic-write primitive, so concurrent readers
//! (the report renderer, the postprocessor) see either version whole. A
//! missing or unparseable file is read as "still running".

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exec::outcome::Outcome;
use crate::jobs::JobSpec;
use crate::rundir::atomic_write;

/// One memory sample of the job's process group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    /// Seconds since the job started.
    pub t_seconds: f64,
    /// Resident set size of the process tree, in bytes.
    pub rss_bytes: u64,
}

/// The status document for one job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    /// Snapshot of the job spec this status belongs to.
    pub wrapper_arguments: JobSpec,

    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub complete: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub wrapper_return_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_return_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,

    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_trace: Option<Vec<MemorySample>>,
}

impl JobStatus {
    /// The placeholder written when the job starts.
    pub fn preliminary(spec: &JobSpec) -> Self {
        Self {
            wrapper_arguments: spec.clone(),
            start_time: Utc::now(),
            end_time: None,
            complete: false,
            outcome: None,
            wrapper_return_code: 0,
            command_return_code: None,
            timed_out: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            memory_trace: None,
        }
    }

    /// Atomically write this document to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating status directory {:?}", parent))?;
        }
        let json = serde_json::to_vec_pretty(self).context("serializing job status")?;
        atomic_write(path, &json)
    }

    /// Load a status document, erroring on missing or malformed files.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading status file {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing status file {:?}", path))
    }

    /// Load a status document, treating missing or currently-being-written
    /// files as absent.
    pub fn load_tolerant(path: &Path) -> Option<Self> {
        Self::load(path).ok()
    }
}
