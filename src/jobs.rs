// src/jobs.rs

//! Job specifications and the on-disk job registry.
//!
//! `add-job` turns CLI flags into an immutable [`JobSpec`], assigns it a
//! UUID and a status file path, and persists it as `jobs/<id>.json` under
//! the cache directory. At `run-build` start the registry is loaded back
//! into the cache document. [`JobSpec::to_exec_argv`] is the single source
//! of the `litani exec` invocation rendered into the build file.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::cache::{Run, JOBS_DIR, STATUS_DIR};
use crate::cli::{ExecArgs, JobArgs};
use crate::rundir::atomic_write;

fn default_memory_interval() -> u64 {
    1
}

/// An immutable job record, as produced by `add-job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub pipeline_name: String,
    pub ci_stage: String,

    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,

    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<String>,
    #[serde(default)]
    pub interleave_stdout_stderr: bool,

    #[serde(default)]
    pub ignore_returns: Vec<i32>,
    #[serde(default)]
    pub ok_returns: Vec<i32>,
    #[serde(default)]
    pub timeout_ok: bool,
    #[serde(default)]
    pub timeout_ignore: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_table: Option<String>,

    #[serde(default)]
    pub profile_memory: bool,
    #[serde(default = "default_memory_interval")]
    pub profile_memory_interval: u64,
    #[serde(default)]
    pub tags: Vec<String>,

    pub status_file: String,
}

impl JobSpec {
    /// A short human-readable handle for diagnostics: the description when
    /// present, the command otherwise.
    pub fn display_name(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.command)
    }

    /// Render the `litani exec` invocation for this job.
    pub fn to_exec_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "litani".to_string(),
            "exec".to_string(),
            "--status-file".to_string(),
            self.status_file.clone(),
            "--job-id".to_string(),
            self.job_id.clone(),
            "--command".to_string(),
            self.command.clone(),
            "--pipeline-name".to_string(),
            self.pipeline_name.clone(),
            "--ci-stage".to_string(),
            self.ci_stage.clone(),
        ];

        let mut list = |flag: &str, values: &[String]| {
            if !values.is_empty() {
                argv.push(flag.to_string());
                argv.extend(values.iter().cloned());
            }
        };
        list("--inputs", &self.inputs);
        list("--outputs", &self.outputs);
        list("--tags", &self.tags);
        list(
            "--ignore-returns",
            &self.ignore_returns.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        );
        list(
            "--ok-returns",
            &self.ok_returns.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        );

        let mut opt = |flag: &str, value: &Option<String>| {
            if let Some(v) = value {
                argv.push(flag.to_string());
                argv.push(v.clone());
            }
        };
        opt("--description", &self.description);
        opt("--cwd", &self.cwd);
        opt("--stdout-file", &self.stdout_file);
        opt("--stderr-file", &self.stderr_file);
        opt("--outcome-table", &self.outcome_table);
        opt("--pool", &self.pool);

        if let Some(secs) = self.timeout {
            argv.push("--timeout".to_string());
            argv.push(secs.to_string());
        }
        if self.timeout_ok {
            argv.push("--timeout-ok".to_string());
        }
        if self.timeout_ignore {
            argv.push("--timeout-ignore".to_string());
        }
        if self.interleave_stdout_stderr {
            argv.push("--interleave-stdout-stderr".to_string());
        }
        if self.profile_memory {
            argv.push("--profile-memory".to_string());
            argv.push("--profile-memory-interval".to_string());
            argv.push(self.profile_memory_interval.to_string());
        }

        argv
    }
}

/// Parse a value that must be a positive integer, naming the flag and the
/// offending value in the diagnostic.
pub fn positive_int(flag: &str, value: i64) -> Result<u64> {
    if value < 1 {
        return Err(anyhow!("{flag} must be a positive integer (got {value})"));
    }
    Ok(value as u64)
}

/// Validate job flags against the run and build the spec.
///
/// `job_id` and `status_file` are assigned here for `add-job`; `exec`
/// carries them explicitly and uses [`spec_from_exec_args`] instead.
fn build_spec(
    run: &Run,
    args: &JobArgs,
    job_id: String,
    status_file: String,
) -> Result<JobSpec> {
    if !run.stages.iter().any(|s| s == &args.ci_stage) {
        return Err(anyhow!(
            "job '{}' declares unknown ci stage '{}' (declared stages: {})",
            args.description.as_deref().unwrap_or(&args.command),
            args.ci_stage,
            run.stages.join(", ")
        ));
    }

    if let Some(ref pool) = args.pool {
        if !run.pools.contains_key(pool) {
            return Err(anyhow!(
                "job '{}' references non-existent pool '{}'",
                args.description.as_deref().unwrap_or(&args.command),
                pool
            ));
        }
    }

    if args.timeout_ok && args.timeout_ignore {
        return Err(anyhow!(
            "--timeout-ok and --timeout-ignore are mutually exclusive"
        ));
    }

    let timeout = args
        .timeout
        .map(|t| positive_int("--timeout", t))
        .transpose()?;
    let profile_memory_interval =
        positive_int("--profile-memory-interval", args.profile_memory_interval)?;

    Ok(JobSpec {
        job_id,
        pipeline_name: args.pipeline_name.clone(),
        ci_stage: args.ci_stage.clone(),
        inputs: args.inputs.clone(),
        outputs: args.outputs.clone(),
        command: args.command.clone(),
        description: args.description.clone(),
        cwd: args.cwd.clone(),
        timeout,
        pool: args.pool.clone(),
        stdout_file: args.stdout_file.clone(),
        stderr_file: args.stderr_file.clone(),
        interleave_stdout_stderr: args.interleave_stdout_stderr,
        ignore_returns: args.ignore_returns.clone(),
        ok_returns: args.ok_returns.clone(),
        timeout_ok: args.timeout_ok,
        timeout_ignore: args.timeout_ignore,
        outcome_table: args.outcome_table.clone(),
        profile_memory: args.profile_memory,
        profile_memory_interval,
        tags: args.tags.clone(),
        status_file,
    })
}

/// Register a new job in the cache directory.
pub fn add_job(run: &Run, cache_dir: &Path, args: &JobArgs) -> Result<JobSpec> {
    let job_id = Uuid::new_v4().to_string();
    let status_file = cache_dir
        .join(STATUS_DIR)
        .join(format!("{job_id}.json"))
        .to_string_lossy()
        .into_owned();

    let spec = build_spec(run, args, job_id, status_file)?;

    let jobs_dir = cache_dir.join(JOBS_DIR);
    fs::create_dir_all(&jobs_dir)
        .with_context(|| format!("creating jobs directory {:?}", jobs_dir))?;

    let path = jobs_dir.join(format!("{}.json", spec.job_id));
    let json = serde_json::to_vec_pretty(&spec).context("serializing job spec")?;
    atomic_write(&path, &json)?;

    debug!(job_id = %spec.job_id, pipeline = %spec.pipeline_name, "registered job");
    Ok(spec)
}

/// Build a spec from `exec` flags. No registry write; the job id and status
/// file come from the invocation.
pub fn spec_from_exec_args(run: &Run, args: &ExecArgs) -> Result<JobSpec> {
    build_spec(run, &args.job, args.job_id.clone(), args.status_file.clone())
}

/// Load every registered job, ordered by job id for reproducible scheduling.
pub fn load_jobs(cache_dir: &Path) -> Result<Vec<JobSpec>> {
    let jobs_dir = cache_dir.join(JOBS_DIR);
    let mut jobs = Vec::new();

    if !jobs_dir.is_dir() {
        return Ok(jobs);
    }

    for entry in fs::read_dir(&jobs_dir)
        .with_context(|| format!("reading jobs directory {:?}", jobs_dir))?
    {
        let path = entry?.path();
        if path.extension().map(|e| e == "json") != Some(true) {
            continue;
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading job spec {:?}", path))?;
        let spec: JobSpec = serde_json::from_str(&contents)
            .with_context(|| format!("parsing job spec {:?}", path))?;
        jobs.push(spec);
    }

    jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Ok(jobs)
}
