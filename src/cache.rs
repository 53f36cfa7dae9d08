// src/cache.rs

//! The persistent run document and its store.
//!
//! A run is one JSON document (`cache.json`) holding identity, pools, the
//! job list, and final timings. Mutations are whole-file replacements
//! through the atomic-write primitive; during execution the only mutating
//! surface is the per-job status files, which the report renderer unifies
//! with this document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::Timeline;
use crate::jobs::JobSpec;
use crate::rundir::atomic_write;

pub const CACHE_FILE: &str = "cache.json";
pub const RUN_FILE: &str = "run.json";
pub const NINJA_FILE: &str = "litani.ninja";
pub const JOBS_DIR: &str = "jobs";
pub const STATUS_DIR: &str = "status";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const REPORTS_DIR: &str = "reports";
pub const HTML_LINK: &str = "html";

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Success,
    Failure,
}

/// The run document persisted as `cache.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
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

    /// Named semaphores bounding per-pool concurrency.
    pub pools: BTreeMap<String, usize>,
    /// The closed set of CI stages jobs may declare.
    pub stages: Vec<String>,

    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub parallelism: Timeline,

    /// Opaque side data for external tooling.
    #[serde(default)]
    pub aux: serde_json::Value,
}

impl Run {
    /// Create a fresh in-progress run.
    pub fn new(
        run_id: String,
        project: String,
        pools: BTreeMap<String, usize>,
        stages: Vec<String>,
    ) -> Result<Self> {
        let version = env!("CARGO_PKG_VERSION").to_string();
        Ok(Self {
            run_id,
            project,
            version,
            version_major: env!("CARGO_PKG_VERSION_MAJOR").parse()?,
            version_minor: env!("CARGO_PKG_VERSION_MINOR").parse()?,
            version_patch: env!("CARGO_PKG_VERSION_PATCH").parse()?,
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::InProgress,
            pools,
            stages,
            jobs: Vec::new(),
            parallelism: Timeline::new(),
            aux: serde_json::Value::Null,
        })
    }
}

/// Parse `name:depth` pool specifications, rejecting duplicates and
/// non-positive depths.
pub fn parse_pools(specs: &[String]) -> Result<BTreeMap<String, usize>> {
    let mut pools = BTreeMap::new();

    for spec in specs {
        let (name, depth) = spec
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid pool spec '{spec}' (expected NAME:DEPTH)"))?;
        let depth: i64 = depth
            .parse()
            .map_err(|_| anyhow!("invalid pool depth in '{spec}' (expected an integer)"))?;
        if depth < 1 {
            return Err(anyhow!(
                "pool depth must be a positive integer (got {depth} in '{spec}')"
            ));
        }
        if pools.insert(name.to_string(), depth as usize).is_some() {
            return Err(anyhow!("duplicate pool name '{name}'"));
        }
    }

    Ok(pools)
}

/// Handle on a run's cache directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_file(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    pub fn run_file(&self) -> PathBuf {
        self.dir.join(RUN_FILE)
    }

    pub fn ninja_file(&self) -> PathBuf {
        self.dir.join(NINJA_FILE)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.dir.join(JOBS_DIR)
    }

    pub fn status_dir(&self) -> PathBuf {
        self.dir.join(STATUS_DIR)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join(ARTIFACTS_DIR)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.dir.join(REPORTS_DIR)
    }

    pub fn html_link(&self) -> PathBuf {
        self.dir.join(HTML_LINK)
    }

    /// Seed the directory layout and write the initial run document.
    pub fn create(&self, run: &Run) -> Result<()> {
        for sub in [JOBS_DIR, STATUS_DIR, ARTIFACTS_DIR, REPORTS_DIR] {
            let dir = self.dir.join(sub);
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating cache subdirectory {:?}", dir))?;
        }
        self.save(run)
    }

    /// Load the run document.
    pub fn load(&self) -> Result<Run> {
        let path = self.cache_file();
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading run cache {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing run cache {:?}", path))
    }

    /// Replace the run document atomically.
    pub fn save(&self, run: &Run) -> Result<()> {
        let json = serde_json::to_vec_pretty(run).context("serializing run cache")?;
        atomic_write(self.cache_file(), &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_specs_parse() {
        let pools = parse_pools(&["io:1".into(), "cpu:4".into()]).unwrap();
        assert_eq!(pools.get("io"), Some(&1));
        assert_eq!(pools.get("cpu"), Some(&4));
    }

    #[test]
    fn zero_depth_pool_is_rejected() {
        let err = parse_pools(&["io:0".into()]).unwrap_err();
        assert!(err.to_string().contains("positive integer"));
    }

    #[test]
    fn duplicate_pool_is_rejected() {
        let err = parse_pools(&["io:1".into(), "io:2".into()]).unwrap_err();
        assert!(err.to_string().contains("duplicate pool name"));
    }

    #[test]
    fn malformed_pool_spec_is_rejected() {
        assert!(parse_pools(&["io".into()]).is_err());
        assert!(parse_pools(&["io:lots".into()]).is_err());
    }

    #[test]
    fn run_document_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());

        let run = Run::new(
            "run-1".into(),
            "proj".into(),
            parse_pools(&["io:2".into()]).unwrap(),
            vec!["build".into(), "test".into(), "report".into()],
        )
        .unwrap();
        store.create(&run).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.status, RunStatus::InProgress);
        assert_eq!(loaded.pools.get("io"), Some(&2));
        assert!(store.jobs_dir().is_dir());
        assert!(store.status_dir().is_dir());
    }
}
