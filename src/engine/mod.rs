// src/engine/mod.rs

//! Scheduling and dispatch.
//!
//! - [`dispatcher`] holds the per-run job state machine and the event loop
//!   that executes the DAG under the global and per-pool parallelism caps.
//! - [`backend`] abstracts how admitted jobs are executed, so tests can
//!   drive the state machine without spawning processes.
//! - [`timeline`] records the running-job count over the run's wall-clock.

pub mod backend;
pub mod dispatcher;
pub mod timeline;

pub use backend::{DispatchEvent, DryRunBackend, ExecutorBackend, ProcessBackend, ScheduledJob};
pub use dispatcher::{DispatchState, DispatchSummary, Dispatcher, JobState};
pub use timeline::{Timeline, TimelineSample};
