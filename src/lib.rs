// src/lib.rs

pub mod cache;
pub mod capabilities;
pub mod cli;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod graph;
pub mod jobs;
pub mod logging;
pub mod render;
pub mod report;
pub mod rundir;

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::info;
use uuid::Uuid;

use crate::cache::{parse_pools, CacheStore, Run, RunStatus};
use crate::cli::{Cli, Command, ExecArgs, GraphArgs, InitArgs, JobArgs, RunBuildArgs};
use crate::engine::{
    DispatchState, Dispatcher, DryRunBackend, ExecutorBackend, ProcessBackend,
};
use crate::graph::BuildGraph;
use crate::render::spawn_renderer;
use crate::rundir::{atomic_write, find_cache_dir};

/// Environment variable overriding the generated run id at `init` time.
pub const RUN_ID_ENV: &str = "LITANI_RUN_ID";

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init(args) => cmd_init(args),
        Command::AddJob(args) => cmd_add_job(args),
        Command::RunBuild(args) => cmd_run_build(args).await,
        Command::Exec(args) => cmd_exec(args).await,
        Command::Graph(args) => cmd_graph(args),
        Command::PrintCapabilities(args) => {
            capabilities::print(args.human_readable)?;
            Ok(0)
        }
    }
}

fn cmd_init(args: InitArgs) -> Result<i32> {
    let run_id = std::env::var(RUN_ID_ENV).unwrap_or_else(|_| Uuid::new_v4().to_string());
    let pools = parse_pools(&args.pools)?;

    if args.stages.is_empty() {
        return Err(anyhow!("at least one CI stage must be declared"));
    }

    // With --output-directory the caller names the run directory exactly;
    // otherwise it lives under `<prefix>/litani/runs/<run-id>` and a
    // `latest` symlink in the runs directory tracks it.
    let (run_dir, maintain_latest) = match args.output_directory {
        Some(dir) => (PathBuf::from(dir), false),
        None => {
            let prefix = args.output_prefix.unwrap_or_else(|| ".".to_string());
            (
                PathBuf::from(prefix)
                    .join("litani")
                    .join("runs")
                    .join(&run_id),
                true,
            )
        }
    };

    rundir::create_run_dir(&run_dir)?;
    let run_dir = run_dir
        .canonicalize()
        .with_context(|| format!("resolving run directory {:?}", run_dir))?;

    let store = CacheStore::new(&run_dir);
    let run = Run::new(run_id.clone(), args.project_name, pools, args.stages)?;
    store.create(&run)?;

    rundir::write_cache_pointer(std::env::current_dir()?, &run_dir)?;
    if maintain_latest {
        rundir::update_latest_symlink(&run_dir)?;
    }
    if let Some(link) = args.output_symlink {
        rundir::atomic_symlink(&run_dir, link)?;
    }

    info!(run_id = %run_id, dir = %run_dir.display(), "run initialized");
    if !args.no_print_out_dir {
        println!(
            "Report will be rendered at file://{}/index.html",
            store.html_link().display()
        );
    }

    Ok(0)
}

fn cmd_add_job(args: JobArgs) -> Result<i32> {
    let store = CacheStore::new(find_cache_dir()?);
    let run = store.load()?;
    jobs::add_job(&run, store.dir(), &args)?;
    Ok(0)
}

async fn cmd_run_build(args: RunBuildArgs) -> Result<i32> {
    let store = CacheStore::new(find_cache_dir()?);
    let mut run = store.load()?;

    if run.end_time.is_some() {
        return Err(anyhow!(
            "run in {:?} has already been executed; initialize a new run",
            store.dir()
        ));
    }

    // Record the registry in the cache before anything starts so the
    // renderer sees the full job list from its first tick.
    let job_list = jobs::load_jobs(store.dir())?;
    run.jobs = job_list.clone();
    store.save(&run)?;

    let graph = BuildGraph::assemble(job_list, &run.pools)?;
    atomic_write(
        store.ninja_file(),
        graph.ninja_syntax(&run.pools).as_bytes(),
    )?;

    let selection = if !args.pipelines.is_empty() {
        Some(graph.restrict("pipeline_name", &args.pipelines)?)
    } else if let Some(ref stage) = args.ci_stage {
        Some(graph.restrict("ci_stage", std::slice::from_ref(stage))?)
    } else {
        None
    };

    let parallel = args.parallel.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    let (events_tx, events_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (render_stop_tx, render_stop_rx) = watch::channel(false);

    // Ctrl-C stops admission and terminates running process groups; the
    // renderer keeps going until the dispatcher has drained.
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(true);
            }
        });
    }

    let backend: Box<dyn ExecutorBackend> = if args.dry_run {
        Box::new(DryRunBackend::new(events_tx))
    } else {
        Box::new(ProcessBackend::new(
            events_tx,
            store.clone(),
            shutdown_rx.clone(),
        ))
    };

    let renderer = spawn_renderer(store.clone(), render_stop_rx);

    let state = DispatchState::new(graph, &run.pools, parallel, selection);
    let dispatcher = Dispatcher::new(state, backend, events_rx, shutdown_rx);
    let summary = dispatcher.run().await?;

    let _ = render_stop_tx.send(true);
    let _ = renderer.await;

    let report = report::finalize(&store, summary.timeline)?;
    info!(status = ?report.status, "run complete");

    if let Some(ref out) = args.out_file {
        fs::copy(store.run_file(), out)
            .with_context(|| format!("copying run.json to {out}"))?;
    }

    let pipeline_failed = report
        .pipelines
        .iter()
        .any(|p| p.status != RunStatus::Success);
    if args.fail_on_pipeline_failure && pipeline_failed {
        return Ok(1);
    }
    Ok(0)
}

async fn cmd_exec(args: ExecArgs) -> Result<i32> {
    let store = CacheStore::new(find_cache_dir()?);
    let run = store.load()?;
    let spec = jobs::spec_from_exec_args(&run, &args)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let classification = exec::run_job(&store, &spec, shutdown_rx).await?;
    Ok(classification.wrapper_return_code)
}

fn cmd_graph(args: GraphArgs) -> Result<i32> {
    let store = CacheStore::new(find_cache_dir()?);
    let run = store.load()?;
    let job_list = jobs::load_jobs(store.dir())?;
    let graph = BuildGraph::assemble(job_list, &run.pools)?;

    print!("{}", graph::dot::render(&graph, &args.pipelines)?);
    Ok(0)
}
