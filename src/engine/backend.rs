// src/engine/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The dispatcher hands ready jobs to an `ExecutorBackend` instead of
//! spawning processes itself. This keeps the scheduling state machine free
//! of process concerns and lets tests drive it with a fake backend.
//!
//! - [`ProcessBackend`] runs each job through the execution wrapper in its
//!   own task; this is what `run-build` uses.
//! - [`DryRunBackend`] records every job as succeeded without running
//!   anything (`run-build --dry-run`).

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::error;

use crate::cache::CacheStore;
use crate::errors::Result;
use crate::exec::outcome::Outcome;
use crate::exec::runner::run_job;
use crate::exec::status::JobStatus;
use crate::jobs::JobSpec;

/// A job the dispatcher has admitted for execution.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub spec: JobSpec,
}

/// Events sent back into the dispatcher's loop.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    JobFinished {
        job_id: String,
        outcome: Outcome,
        wrapper_return_code: i32,
    },
}

/// Trait abstracting how admitted jobs are executed.
pub trait ExecutorBackend: Send {
    /// Dispatch the given jobs for execution. Implementations must
    /// eventually emit one `JobFinished` event per job.
    fn spawn_ready_jobs(
        &mut self,
        jobs: Vec<ScheduledJob>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Production backend: one task per job running the execution wrapper.
pub struct ProcessBackend {
    events_tx: mpsc::Sender<DispatchEvent>,
    store: CacheStore,
    shutdown: watch::Receiver<bool>,
}

impl ProcessBackend {
    pub fn new(
        events_tx: mpsc::Sender<DispatchEvent>,
        store: CacheStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            events_tx,
            store,
            shutdown,
        }
    }
}

impl ExecutorBackend for ProcessBackend {
    fn spawn_ready_jobs(
        &mut self,
        jobs: Vec<ScheduledJob>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let events_tx = self.events_tx.clone();
        let store = self.store.clone();
        let shutdown = self.shutdown.clone();

        Box::pin(async move {
            for job in jobs {
                let events_tx = events_tx.clone();
                let store = store.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    let (outcome, wrapper_return_code) =
                        match run_job(&store, &job.spec, shutdown).await {
                            Ok(c) => (c.outcome, c.wrapper_return_code),
                            Err(e) => {
                                error!(
                                    job = %job.spec.display_name(),
                                    error = %e,
                                    "execution wrapper failed"
                                );
                                record_wrapper_failure(&job.spec, &e);
                                (Outcome::Fail, 1)
                            }
                        };

                    let _ = events_tx
                        .send(DispatchEvent::JobFinished {
                            job_id: job.spec.job_id.clone(),
                            outcome,
                            wrapper_return_code,
                        })
                        .await;
                });
            }
            Ok(())
        })
    }
}

/// When the wrapper itself errors (spawn failure, unwritable status dir),
/// still leave a complete failed status behind so the run's bookkeeping
/// stays whole.
fn record_wrapper_failure(spec: &JobSpec, err: &anyhow::Error) {
    let mut status = JobStatus::preliminary(spec);
    status.complete = true;
    status.end_time = Some(Utc::now());
    status.outcome = Some(Outcome::Fail);
    status.wrapper_return_code = 1;
    status.stderr = vec![format!("litani: {err:#}")];
    let _ = status.write(std::path::Path::new(&spec.status_file));
}

/// Dry-run backend: writes a successful status for every job without
/// invoking the execution wrapper.
pub struct DryRunBackend {
    events_tx: mpsc::Sender<DispatchEvent>,
}

impl DryRunBackend {
    pub fn new(events_tx: mpsc::Sender<DispatchEvent>) -> Self {
        Self { events_tx }
    }
}

impl ExecutorBackend for DryRunBackend {
    fn spawn_ready_jobs(
        &mut self,
        jobs: Vec<ScheduledJob>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let events_tx = self.events_tx.clone();

        Box::pin(async move {
            for job in jobs {
                let mut status = JobStatus::preliminary(&job.spec);
                status.complete = true;
                status.end_time = Some(Utc::now());
                status.outcome = Some(Outcome::Success);
                status.wrapper_return_code = 0;
                status.command_return_code = Some(0);
                status.write(std::path::Path::new(&job.spec.status_file))?;

                events_tx
                    .send(DispatchEvent::JobFinished {
                        job_id: job.spec.job_id.clone(),
                        outcome: Outcome::Success,
                        wrapper_return_code: 0,
                    })
                    .await
                    .map_err(anyhow::Error::from)?;
            }
            Ok(())
        })
    }
}
