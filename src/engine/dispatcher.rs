// src/engine/dispatcher.rs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::engine::backend::{DispatchEvent, ExecutorBackend, ScheduledJob};
use crate::engine::timeline::Timeline;
use crate::exec::outcome::Outcome;
use crate::graph::BuildGraph;

/// Per-run state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting on dependencies or an execution slot.
    Pending,
    /// Handed to the executor backend.
    Running,
    Succeeded,
    FailedIgnored,
    Failed,
    /// Never ran because an ancestor failed or an input was missing.
    Skipped,
}

impl JobState {
    fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }

    /// Whether a dependency in this state lets its consumers proceed.
    fn satisfies_dependents(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedIgnored)
    }
}

struct PoolSlots {
    depth: usize,
    in_use: usize,
}

/// The scheduling state machine, kept separate from the event loop so tests
/// can drive it synchronously.
///
/// Responsibilities:
/// - track which jobs participate in this run (pipeline / stage filters)
/// - decide when a job is ready (dependencies satisfied, source inputs
///   present on disk)
/// - admit ready jobs against the global limit and their pool's depth
/// - propagate skips through the subtree of a failed job
pub struct DispatchState {
    graph: BuildGraph,
    /// `None` for jobs excluded by a filter.
    states: Vec<Option<JobState>>,
    pools: HashMap<String, PoolSlots>,
    /// Global parallelism cap; 0 means unbounded.
    parallel: usize,
    running: usize,
}

impl DispatchState {
    pub fn new(
        graph: BuildGraph,
        pools: &BTreeMap<String, usize>,
        parallel: usize,
        selection: Option<HashSet<usize>>,
    ) -> Self {
        let states = (0..graph.jobs().len())
            .map(|i| match &selection {
                Some(sel) if !sel.contains(&i) => None,
                _ => Some(JobState::Pending),
            })
            .collect();

        let pools = pools
            .iter()
            .map(|(name, &depth)| (name.clone(), PoolSlots { depth, in_use: 0 }))
            .collect();

        Self {
            graph,
            states,
            pools,
            parallel,
            running: 0,
        }
    }

    pub fn running_count(&self) -> usize {
        self.running
    }

    pub fn state_of(&self, job_id: &str) -> Option<JobState> {
        self.graph.index_of(job_id).and_then(|i| self.states[i])
    }

    /// All participating jobs are in a terminal state.
    pub fn is_complete(&self) -> bool {
        self.states
            .iter()
            .flatten()
            .all(|s| s.is_terminal())
    }

    pub fn any_failed(&self) -> bool {
        self.states
            .iter()
            .flatten()
            .any(|s| matches!(s, JobState::Failed))
    }

    /// Collect pending jobs that are ready and admitted, mark them running,
    /// and return them. Candidates are visited in job list order so that
    /// tie-breaking among simultaneously ready jobs is deterministic.
    pub fn startable(&mut self) -> Vec<ScheduledJob> {
        let mut started = Vec::new();

        for i in 0..self.states.len() {
            if self.states[i] != Some(JobState::Pending) {
                continue;
            }

            if self.blocked_by_failure(i) {
                self.skip(i);
                continue;
            }
            if !self.deps_satisfied(i) {
                continue;
            }
            if let Some(missing) = self.missing_source_input(i) {
                warn!(
                    job = %self.graph.job(i).display_name(),
                    input = %missing,
                    "input does not exist and no job produces it; skipping job"
                );
                self.skip(i);
                continue;
            }

            if !self.admit(i) {
                continue;
            }

            self.states[i] = Some(JobState::Running);
            self.running += 1;
            debug!(job = %self.graph.job(i).display_name(), "job admitted");
            started.push(ScheduledJob {
                spec: self.graph.job(i).clone(),
            });
        }

        started
    }

    /// Record a finished job, release its slots, and skip its subtree on
    /// hard failure.
    pub fn on_finished(&mut self, job_id: &str, outcome: Outcome) -> Result<()> {
        let i = self
            .graph
            .index_of(job_id)
            .ok_or_else(|| anyhow!("completion for unknown job '{job_id}'"))?;

        if self.states[i] != Some(JobState::Running) {
            warn!(job_id = %job_id, state = ?self.states[i], "completion for a job that was not running");
        } else {
            self.running = self.running.saturating_sub(1);
            if let Some(pool) = &self.graph.job(i).pool {
                if let Some(slots) = self.pools.get_mut(pool) {
                    slots.in_use = slots.in_use.saturating_sub(1);
                }
            }
        }

        self.states[i] = Some(match outcome {
            Outcome::Success => JobState::Succeeded,
            Outcome::FailIgnored => JobState::FailedIgnored,
            Outcome::Fail => JobState::Failed,
        });

        if outcome == Outcome::Fail {
            self.skip_dependents(i);
        }

        Ok(())
    }

    /// Mark every pending job as skipped. Used on cancellation, and as a
    /// guard when no progress is possible.
    pub fn skip_remaining(&mut self) {
        for i in 0..self.states.len() {
            if self.states[i] == Some(JobState::Pending) {
                self.skip(i);
            }
        }
    }

    fn deps_satisfied(&self, i: usize) -> bool {
        self.graph.deps_of(i).iter().all(|&d| {
            match self.states[d] {
                Some(s) => s.satisfies_dependents(),
                // Excluded producers cannot run; their consumer is only in
                // the selection if the producer is too, so this is a
                // missing-input situation handled by the source check.
                None => false,
            }
        })
    }

    fn blocked_by_failure(&self, i: usize) -> bool {
        self.graph
            .deps_of(i)
            .iter()
            .any(|&d| matches!(self.states[d], Some(JobState::Failed | JobState::Skipped)))
    }

    fn missing_source_input(&self, i: usize) -> Option<String> {
        self.graph
            .source_inputs_of(i)
            .iter()
            .find(|p| !Path::new(p.as_str()).exists())
            .cloned()
    }

    fn admit(&mut self, i: usize) -> bool {
        if self.parallel != 0 && self.running >= self.parallel {
            return false;
        }

        if let Some(pool) = &self.graph.job(i).pool {
            match self.pools.get_mut(pool) {
                Some(slots) if slots.in_use < slots.depth => slots.in_use += 1,
                _ => return false,
            }
        }

        true
    }

    fn skip(&mut self, i: usize) {
        self.states[i] = Some(JobState::Skipped);
        self.skip_dependents(i);
    }

    fn skip_dependents(&mut self, from: usize) {
        let mut stack: Vec<usize> = self.graph.dependents_of(from).to_vec();
        while let Some(i) = stack.pop() {
            if self.states[i] == Some(JobState::Pending) {
                debug!(
                    job = %self.graph.job(i).display_name(),
                    "skipping job because an upstream job failed"
                );
                self.states[i] = Some(JobState::Skipped);
                stack.extend(self.graph.dependents_of(i));
            }
        }
    }
}

/// What the dispatcher hands back to `run-build`.
#[derive(Debug)]
pub struct DispatchSummary {
    pub timeline: Timeline,
    pub any_failed: bool,
}

/// The dispatcher event loop: admits ready jobs, records the parallelism
/// timeline, and reacts to completion events until every participating job
/// is terminal. On a shutdown signal it stops admitting new jobs, lets the
/// executor terminate the running ones, and skips the rest.
pub struct Dispatcher {
    state: DispatchState,
    backend: Box<dyn ExecutorBackend>,
    events_rx: mpsc::Receiver<DispatchEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        state: DispatchState,
        backend: Box<dyn ExecutorBackend>,
        events_rx: mpsc::Receiver<DispatchEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            backend,
            events_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<DispatchSummary> {
        let started = Instant::now();
        let mut timeline = Timeline::new();
        let mut cancelled = false;
        let mut shutdown_open = true;

        info!("dispatcher started");

        loop {
            if !cancelled {
                let ready = self.state.startable();
                if !ready.is_empty() {
                    let t = started.elapsed().as_secs_f64();
                    for _ in &ready {
                        timeline.record_start(t);
                    }
                    self.backend.spawn_ready_jobs(ready).await?;
                }
            }

            if self.state.is_complete() {
                break;
            }

            if self.state.running_count() == 0 {
                // Nothing running and nothing startable: the rest can never
                // become ready.
                if !cancelled {
                    warn!("no runnable jobs remain; skipping the rest");
                }
                self.state.skip_remaining();
                continue;
            }

            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(DispatchEvent::JobFinished { job_id, outcome, wrapper_return_code }) = event else {
                        return Err(anyhow!("executor event channel closed with jobs still running"));
                    };
                    debug!(
                        job_id = %job_id,
                        ?outcome,
                        wrapper_return_code,
                        "job finished"
                    );
                    timeline.record_finish(started.elapsed().as_secs_f64());
                    self.state.on_finished(&job_id, outcome)?;
                }
                changed = self.shutdown.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) => {
                            info!("shutdown requested; no new jobs will start");
                            cancelled = true;
                        }
                        Err(_) => shutdown_open = false,
                    }
                }
            }
        }

        timeline.seal(started.elapsed().as_secs_f64());
        info!(
            max_parallelism = timeline.max_running,
            "dispatcher finished"
        );

        Ok(DispatchSummary {
            any_failed: self.state.any_failed(),
            timeline,
        })
    }
}
