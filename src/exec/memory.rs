// src/exec/memory.rs

//! Resident-set-size sampling of a job's process group.
//!
//! The sampler walks `/proc`, picks out processes whose process group
//! matches the supervised child, and sums their `VmRSS`. It runs as a
//! background task polling at the job's configured interval until the
//! supervisor stops it; the collected samples land in the status file's
//! `memory_trace`.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::exec::status::MemorySample;

/// Sum the RSS, in bytes, of all processes in the given process group.
/// Returns `None` when no member process can be observed.
#[cfg(target_os = "linux")]
pub fn sample_group_rss(pgid: u32) -> Option<u64> {
    let mut total: u64 = 0;
    let mut seen = false;

    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        if process_group_of(pid) != Some(pgid) {
            continue;
        }
        seen = true;
        total += vm_rss_bytes(pid).unwrap_or(0);
    }

    seen.then_some(total)
}

#[cfg(not(target_os = "linux"))]
pub fn sample_group_rss(_pgid: u32) -> Option<u64> {
    None
}

/// Parse the process group id out of `/proc/<pid>/stat`. The comm field may
/// contain spaces and parentheses, so fields are taken after the last `)`.
#[cfg(target_os = "linux")]
fn process_group_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = stat.rsplit_once(')')?.1;
    // Fields after comm: state, ppid, pgrp, ...
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// Read `VmRSS` from `/proc/<pid>/status`, reported there in kB.
#[cfg(target_os = "linux")]
fn vm_rss_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// A running memory sampler for one job.
pub struct MemorySampler {
    handle: JoinHandle<Vec<MemorySample>>,
    stop_tx: watch::Sender<bool>,
}

impl MemorySampler {
    /// Start sampling the process group every `interval_secs` seconds.
    pub fn spawn(pgid: u32, interval_secs: u64, started: Instant) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut samples = Vec::new();
            loop {
                if let Some(rss_bytes) = sample_group_rss(pgid) {
                    samples.push(MemorySample {
                        t_seconds: started.elapsed().as_secs_f64(),
                        rss_bytes,
                    });
                }

                tokio::select! {
                    _ = sleep(Duration::from_secs(interval_secs)) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            debug!(pgid, samples = samples.len(), "memory sampler finished");
            samples
        });

        Self { handle, stop_tx }
    }

    /// Stop the sampler and collect its samples.
    pub async fn finish(self) -> Vec<MemorySample> {
        let _ = self.stop_tx.send(true);
        self.handle.await.unwrap_or_default()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn own_process_group_has_nonzero_rss() {
        // The test binary belongs to some process group; sampling it must
        // observe at least this process.
        let pgid = nix::unistd::getpgrp().as_raw() as u32;
        let rss = sample_group_rss(pgid);
        assert!(rss.is_some());
        assert!(rss.unwrap() > 0);
    }
}
