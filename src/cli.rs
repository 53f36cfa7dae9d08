// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! One subcommand per user-facing operation. `add-job` and `exec` share the
//! same job flags via [`JobArgs`]; `exec` additionally takes the status file
//! and job id that `run-build` renders into the executor invocation.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `litani`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "litani",
    version,
    about = "Incremental build orchestrator for CI pipelines.",
    long_about = None
)]
pub struct Cli {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `LITANI_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create a new run directory and seed the cache.
    Init(InitArgs),

    /// Register a job to run as part of the current run.
    AddJob(JobArgs),

    /// Execute all registered jobs as a dependency DAG.
    RunBuild(RunBuildArgs),

    /// Run a single job under the execution wrapper (used internally by
    /// run-build).
    Exec(ExecArgs),

    /// Print the job DAG in Graphviz DOT format.
    Graph(GraphArgs),

    /// Enumerate the features this build of litani supports.
    PrintCapabilities(PrintCapabilitiesArgs),
}

#[derive(Debug, Clone, Args)]
pub struct InitArgs {
    /// Name of the project this run belongs to.
    #[arg(long, value_name = "NAME")]
    pub project_name: String,

    /// Job pools with their depths, e.g. `io:1 cpu:4`.
    #[arg(long, value_name = "NAME:DEPTH", num_args = 1..)]
    pub pools: Vec<String>,

    /// Use this exact directory as the run directory (must not exist).
    #[arg(long, value_name = "DIR", conflicts_with = "output_prefix")]
    pub output_directory: Option<String>,

    /// Create the run directory under `<PREFIX>/litani/runs/<run-id>`.
    #[arg(long, value_name = "DIR")]
    pub output_prefix: Option<String>,

    /// Additionally symlink the run directory at this path.
    #[arg(long, value_name = "PATH")]
    pub output_symlink: Option<String>,

    /// Do not print the run directory location on stdout.
    #[arg(long)]
    pub no_print_out_dir: bool,

    /// The closed set of CI stages jobs may declare.
    #[arg(long, value_name = "STAGE", num_args = 1.., default_values_t = [
        String::from("build"), String::from("test"), String::from("report"),
    ])]
    pub stages: Vec<String>,
}

/// Job description flags, shared between `add-job` and `exec`.
#[derive(Debug, Clone, Args)]
pub struct JobArgs {
    /// Shell command to run.
    #[arg(long, value_name = "CMD")]
    pub command: String,

    /// Pipeline this job belongs to.
    #[arg(long, value_name = "NAME")]
    pub pipeline_name: String,

    /// CI stage this job belongs to.
    #[arg(long, value_name = "STAGE")]
    pub ci_stage: String,

    /// Files the command depends on.
    #[arg(long, value_name = "PATH", num_args = 0..)]
    pub inputs: Vec<String>,

    /// Files the command produces.
    #[arg(long, value_name = "PATH", num_args = 0..)]
    pub outputs: Vec<String>,

    /// Human-readable description shown in reports and diagnostics.
    #[arg(long, value_name = "TEXT")]
    pub description: Option<String>,

    /// Directory to run the command in.
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    /// Kill the command if it runs longer than this many seconds.
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<i64>,

    /// Treat a timeout as success.
    #[arg(long)]
    pub timeout_ok: bool,

    /// Treat a timeout as a failure that does not fail the pipeline.
    #[arg(long, conflicts_with = "timeout_ok")]
    pub timeout_ignore: bool,

    /// Return codes to treat as success.
    #[arg(long, value_name = "RC", num_args = 0..)]
    pub ignore_returns: Vec<i32>,

    /// Return codes to treat as an ignored failure.
    #[arg(long, value_name = "RC", num_args = 0..)]
    pub ok_returns: Vec<i32>,

    /// JSON file mapping return codes to outcomes.
    #[arg(long, value_name = "FILE")]
    pub outcome_table: Option<String>,

    /// Also write the command's stdout to this file.
    #[arg(long, value_name = "FILE")]
    pub stdout_file: Option<String>,

    /// Also write the command's stderr to this file.
    #[arg(long, value_name = "FILE")]
    pub stderr_file: Option<String>,

    /// Merge stderr into the stdout capture.
    #[arg(long)]
    pub interleave_stdout_stderr: bool,

    /// Named pool that bounds how many of these jobs run at once.
    #[arg(long, value_name = "NAME")]
    pub pool: Option<String>,

    /// Periodically sample the resident set size of the command's process
    /// group.
    #[arg(long)]
    pub profile_memory: bool,

    /// Seconds between memory samples.
    #[arg(long, value_name = "SECONDS", default_value_t = 1)]
    pub profile_memory_interval: i64,

    /// Free-form tags attached to the job.
    #[arg(long, value_name = "TAG", num_args = 0..)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RunBuildArgs {
    /// Record every job as succeeded without running anything.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Maximum number of jobs to run concurrently (0 means unbounded).
    /// Defaults to the number of CPUs.
    #[arg(short = 'j', long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Write a copy of the final run.json to this file.
    #[arg(short = 'o', long, value_name = "FILE")]
    pub out_file: Option<String>,

    /// Exit 1 if any pipeline failed.
    #[arg(long)]
    pub fail_on_pipeline_failure: bool,

    /// Only run jobs belonging to these pipelines.
    #[arg(short = 'p', long, value_name = "NAME", num_args = 1..)]
    pub pipelines: Vec<String>,

    /// Only run jobs up to and including this CI stage.
    #[arg(short = 's', long, value_name = "STAGE", conflicts_with = "pipelines")]
    pub ci_stage: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    #[command(flatten)]
    pub job: JobArgs,

    /// Where to write the job's status document.
    #[arg(long, value_name = "FILE")]
    pub status_file: String,

    /// Identifier assigned to this job by add-job.
    #[arg(long, value_name = "ID")]
    pub job_id: String,
}

#[derive(Debug, Clone, Args)]
pub struct GraphArgs {
    /// Restrict the graph to these pipelines.
    #[arg(short = 'p', long, value_name = "NAME", num_args = 1..)]
    pub pipelines: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct PrintCapabilitiesArgs {
    /// Print one capability per line instead of JSON.
    #[arg(short = 'r', long)]
    pub human_readable: bool,
}

/// Convenience wrapper around `Cli::parse()`.
pub fn parse() -> Cli {
    Cli::parse()
}
