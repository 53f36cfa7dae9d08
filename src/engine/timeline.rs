// src/engine/timeline.rs

//! Time-series of the number of concurrently running jobs.
//!
//! The dispatcher appends one sample per job start (+1) and finish (-1),
//! relative to the run's wall-clock start. Samples landing on the same
//! timestamp are coalesced into the last one so the series stays a function
//! of time. The sealed timeline is copied into the cache at finalization.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimelineSample {
    /// Seconds since the run started.
    pub t_seconds: f64,
    /// Jobs running at this instant.
    pub running: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub samples: Vec<TimelineSample>,
    pub max_running: usize,
    #[serde(skip)]
    current: usize,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently accounted as running.
    pub fn running(&self) -> usize {
        self.current
    }

    /// Record a job start at `t_seconds`.
    pub fn record_start(&mut self, t_seconds: f64) {
        self.current += 1;
        self.max_running = self.max_running.max(self.current);
        self.push(t_seconds);
    }

    /// Record a job finish at `t_seconds`.
    pub fn record_finish(&mut self, t_seconds: f64) {
        self.current = self.current.saturating_sub(1);
        self.push(t_seconds);
    }

    /// Close the series with a final sample at `t_seconds`.
    pub fn seal(&mut self, t_seconds: f64) {
        self.push(t_seconds);
    }

    fn push(&mut self, t_seconds: f64) {
        let sample = TimelineSample {
            t_seconds,
            running: self.current,
        };
        match self.samples.last_mut() {
            Some(last) if last.t_seconds == t_seconds => *last = sample,
            _ => self.samples.push(sample),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_and_finishes_track_running_count() {
        let mut tl = Timeline::new();
        tl.record_start(0.0);
        tl.record_start(1.0);
        tl.record_finish(2.0);
        tl.record_finish(3.0);
        tl.seal(3.5);

        let counts: Vec<usize> = tl.samples.iter().map(|s| s.running).collect();
        assert_eq!(counts, vec![1, 2, 1, 0, 0]);
        assert_eq!(tl.max_running, 2);
    }

    #[test]
    fn same_timestamp_samples_coalesce() {
        let mut tl = Timeline::new();
        tl.record_start(1.0);
        tl.record_start(1.0);
        tl.record_start(1.0);

        assert_eq!(tl.samples.len(), 1);
        assert_eq!(tl.samples[0].running, 3);
        assert_eq!(tl.max_running, 3);
    }

    #[test]
    fn finish_never_underflows() {
        let mut tl = Timeline::new();
        tl.record_finish(0.0);
        assert_eq!(tl.samples[0].running, 0);
    }
}
