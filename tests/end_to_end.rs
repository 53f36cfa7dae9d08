use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::Path;

use tokio::sync::{mpsc, watch};

use litani::cache::{CacheStore, Run, RunStatus};
use litani::cli::JobArgs;
use litani::engine::{
    DispatchState, Dispatcher, DryRunBackend, ExecutorBackend, ProcessBackend,
};
use litani::exec::{JobStatus, Outcome};
use litani::graph::BuildGraph;
use litani::jobs::{add_job, load_jobs};
use litani::render::render_once;
use litani::report::{consolidate, finalize, RunReport};

mod common;
use common::init_store;

type TestResult = std::result::Result<(), Box<dyn Error>>;

fn job_args(command: &str, pipeline: &str, inputs: &[String], outputs: &[String]) -> JobArgs {
    JobArgs {
        command: command.to_string(),
        pipeline_name: pipeline.to_string(),
        ci_stage: "build".to_string(),
        inputs: inputs.to_vec(),
        outputs: outputs.to_vec(),
        description: None,
        cwd: None,
        timeout: None,
        timeout_ok: false,
        timeout_ignore: false,
        ignore_returns: vec![],
        ok_returns: vec![],
        outcome_table: None,
        stdout_file: None,
        stderr_file: None,
        interleave_stdout_stderr: false,
        pool: None,
        profile_memory: false,
        profile_memory_interval: 1,
        tags: vec![],
    }
}

/// Load the registry and execute the whole DAG, the way `run-build` does.
async fn run_dag(store: &CacheStore, run: &mut Run, dry_run: bool) -> RunReport {
    let job_list = load_jobs(store.dir()).unwrap();
    run.jobs = job_list.clone();
    store.save(run).unwrap();

    let graph = BuildGraph::assemble(job_list, &run.pools).unwrap();

    let (events_tx, events_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    std::mem::forget(shutdown_tx);

    let backend: Box<dyn ExecutorBackend> = if dry_run {
        Box::new(DryRunBackend::new(events_tx))
    } else {
        Box::new(ProcessBackend::new(
            events_tx,
            store.clone(),
            shutdown_rx.clone(),
        ))
    };

    let state = DispatchState::new(graph, &run.pools, 0, None);
    let summary = Dispatcher::new(state, backend, events_rx, shutdown_rx)
        .run()
        .await
        .unwrap();

    finalize(store, summary.timeline).unwrap()
}

fn status_of<'a>(report: &'a RunReport, command_contains: &str) -> Option<&'a JobStatus> {
    report
        .jobs
        .iter()
        .find(|j| j.spec.command.contains(command_contains))
        .and_then(|j| j.status.as_ref())
}

#[tokio::test]
async fn linear_chain_runs_in_order_and_succeeds() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (store, mut run) = init_store(dir.path(), BTreeMap::new());

    let a_out = dir.path().join("a.out").to_string_lossy().into_owned();
    let b_out = dir.path().join("b.out").to_string_lossy().into_owned();

    add_job(
        &run,
        store.dir(),
        &job_args(&format!("touch {a_out}"), "pipe", &[], &[a_out.clone()]),
    )?;
    add_job(
        &run,
        store.dir(),
        &job_args(
            &format!("cat {a_out} > {b_out}"),
            "pipe",
            &[a_out.clone()],
            &[b_out.clone()],
        ),
    )?;

    let report = run_dag(&store, &mut run, false).await;

    assert_eq!(report.status, RunStatus::Success);
    assert!(Path::new(&b_out).exists());

    let a_status = status_of(&report, "touch").unwrap();
    let b_status = status_of(&report, "cat").unwrap();
    assert!(a_status.complete && b_status.complete);
    // The consumer starts strictly after its producer's status is final.
    assert!(b_status.start_time >= a_status.end_time.unwrap());

    Ok(())
}

#[tokio::test]
async fn diamond_with_pool_never_overlaps_pool_members() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut pools = BTreeMap::new();
    pools.insert("io".to_string(), 1);
    let (store, mut run) = init_store(dir.path(), pools);

    let root = dir.path().join("root.out").to_string_lossy().into_owned();
    let left = dir.path().join("left.out").to_string_lossy().into_owned();
    let right = dir.path().join("right.out").to_string_lossy().into_owned();

    add_job(
        &run,
        store.dir(),
        &job_args(&format!("touch {root}"), "pipe", &[], &[root.clone()]),
    )?;
    let mut b = job_args(
        &format!("sleep 0.3 && touch {left}"),
        "pipe",
        &[root.clone()],
        &[left.clone()],
    );
    b.pool = Some("io".to_string());
    b.description = Some("left writer".to_string());
    add_job(&run, store.dir(), &b)?;
    let mut c = job_args(
        &format!("sleep 0.3 && touch {right}"),
        "pipe",
        &[root.clone()],
        &[right.clone()],
    );
    c.pool = Some("io".to_string());
    c.description = Some("right writer".to_string());
    add_job(&run, store.dir(), &c)?;
    add_job(
        &run,
        store.dir(),
        &job_args(
            &format!("cat {left} {right}"),
            "pipe",
            &[left.clone(), right.clone()],
            &[],
        ),
    )?;

    let report = run_dag(&store, &mut run, false).await;
    assert_eq!(report.status, RunStatus::Success);

    let described = |desc: &str| {
        report
            .jobs
            .iter()
            .find(|j| j.spec.description.as_deref() == Some(desc))
            .and_then(|j| j.status.as_ref())
            .unwrap()
    };
    let b_status = described("left writer");
    let c_status = described("right writer");
    let d_status = status_of(&report, "cat").unwrap();

    // Pool depth 1: the two pool members may not overlap in time.
    let b_window = (b_status.start_time, b_status.end_time.unwrap());
    let c_window = (c_status.start_time, c_status.end_time.unwrap());
    assert!(b_window.1 <= c_window.0 || c_window.1 <= b_window.0);

    // The join runs after both.
    assert!(d_status.start_time >= b_window.1);
    assert!(d_status.start_time >= c_window.1);

    Ok(())
}

#[tokio::test]
async fn failing_job_skips_dependents_and_fails_the_run() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (store, mut run) = init_store(dir.path(), BTreeMap::new());

    let a_out = dir.path().join("a.out").to_string_lossy().into_owned();

    add_job(
        &run,
        store.dir(),
        &job_args("exit 1", "pipe", &[], &[a_out.clone()]),
    )?;
    add_job(
        &run,
        store.dir(),
        &job_args(&format!("cat {a_out}"), "pipe", &[a_out.clone()], &[]),
    )?;

    let report = run_dag(&store, &mut run, false).await;

    assert_eq!(report.status, RunStatus::Failure);

    let a_status = status_of(&report, "exit 1").unwrap();
    assert_eq!(a_status.outcome, Some(Outcome::Fail));

    // The skipped dependent never ran, so it has no status document.
    assert!(status_of(&report, "cat").is_none());

    // Every pipeline involved is reported as failed.
    assert!(report
        .pipelines
        .iter()
        .all(|p| p.status == RunStatus::Failure));

    Ok(())
}

#[tokio::test]
async fn dry_run_records_success_without_executing() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (store, mut run) = init_store(dir.path(), BTreeMap::new());

    let marker = dir.path().join("ran.marker").to_string_lossy().into_owned();
    add_job(
        &run,
        store.dir(),
        &job_args(&format!("touch {marker} && exit 1"), "pipe", &[], &[]),
    )?;

    let report = run_dag(&store, &mut run, true).await;

    assert_eq!(report.status, RunStatus::Success);
    assert!(!Path::new(&marker).exists());

    let status = report.jobs[0].status.as_ref().unwrap();
    assert_eq!(status.outcome, Some(Outcome::Success));
    assert_eq!(status.command_return_code, Some(0));
    assert_eq!(status.wrapper_return_code, 0);

    Ok(())
}

#[tokio::test]
async fn renderer_snapshots_are_always_parseable() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (store, mut run) = init_store(dir.path(), BTreeMap::new());

    add_job(&run, store.dir(), &job_args("true", "pipe", &[], &[]))?;
    run.jobs = load_jobs(store.dir())?;
    store.save(&run)?;

    // Before anything runs: in progress, job status absent.
    render_once(&store)?;
    let early: RunReport = serde_json::from_str(&fs::read_to_string(store.run_file())?)?;
    assert_eq!(early.status, RunStatus::InProgress);
    assert!(early.jobs[0].status.is_none());

    // The html symlink points at a staged directory holding the snapshot.
    let staged = fs::read_link(store.html_link())?;
    assert!(staged.join("run.json").is_file());

    // A second render swaps the link and collects the superseded directory.
    render_once(&store)?;
    let staged_after = fs::read_link(store.html_link())?;
    assert_ne!(staged, staged_after);
    assert!(!staged.exists());

    let report = run_dag(&store, &mut run, false).await;
    assert_eq!(report.status, RunStatus::Success);

    let final_doc: RunReport = serde_json::from_str(&fs::read_to_string(store.run_file())?)?;
    assert_eq!(final_doc.status, RunStatus::Success);
    assert!(final_doc.end_time.is_some());

    Ok(())
}

#[tokio::test]
async fn finalized_report_is_deterministic() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (store, mut run) = init_store(dir.path(), BTreeMap::new());

    add_job(&run, store.dir(), &job_args("true", "pipe", &[], &[]))?;
    run_dag(&store, &mut run, false).await;

    // Re-consolidating the same cache and status files yields identical
    // bytes.
    let sealed = store.load()?;
    let first = serde_json::to_vec_pretty(&consolidate(&sealed, true))?;
    let second = serde_json::to_vec_pretty(&consolidate(&sealed, true))?;
    assert_eq!(first, second);

    // And the run is now sealed against re-execution.
    assert!(sealed.end_time.is_some());

    Ok(())
}
