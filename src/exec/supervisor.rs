// src/exec/supervisor.rs

//! Supervised child processes.
//!
//! One abstraction owns everything around a job's command: the shell child
//! in its own process group, the stdio capture (to memory, optionally
//! mirrored to files), the timeout timer, and the optional memory sampler.
//! Its result is a sum over exited / timed out / signalled, which the
//! outcome classifier consumes.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::exec::memory::MemorySampler;
use crate::exec::outcome::ExitResult;
use crate::exec::status::MemorySample;
use crate::jobs::JobSpec;

/// How long to wait after SIGTERM before escalating to SIGKILL.
const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Everything captured from one supervised run of a job's command.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit: ExitResult,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub memory_trace: Option<Vec<MemorySample>>,
}

enum WaitEnd {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[derive(Clone, Copy)]
enum Stream {
    Out,
    Err,
}

/// Run the job's command under supervision until it exits, times out, or
/// the run is cancelled.
pub async fn supervise(
    spec: &JobSpec,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ProcessOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }
    // The child leads its own process group so a timeout can take its
    // whole subtree down.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning command for job '{}'", spec.display_name()))?;
    let pgid = child
        .id()
        .ok_or_else(|| anyhow!("child exited before its pid could be observed"))?;

    debug!(job = %spec.display_name(), pid = pgid, "job process started");

    let collector = spawn_capture(spec, &mut child);

    let sampler = spec
        .profile_memory
        .then(|| MemorySampler::spawn(pgid, spec.profile_memory_interval, Instant::now()));

    let end = {
        let wait = async {
            match spec.timeout {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
                        Ok(res) => WaitEnd::Exited(res),
                        Err(_) => WaitEnd::TimedOut,
                    }
                }
                None => WaitEnd::Exited(child.wait().await),
            }
        };
        tokio::select! {
            end = wait => end,
            _ = cancellation(&mut shutdown) => WaitEnd::Cancelled,
        }
    };

    let (status, timed_out) = match end {
        WaitEnd::Exited(res) => (
            res.with_context(|| format!("waiting for job '{}'", spec.display_name()))?,
            false,
        ),
        WaitEnd::TimedOut => {
            warn!(
                job = %spec.display_name(),
                timeout = spec.timeout,
                "job exceeded its timeout; terminating process group"
            );
            terminate_group(pgid, &mut child).await;
            (child.wait().await?, true)
        }
        WaitEnd::Cancelled => {
            warn!(job = %spec.display_name(), "run cancelled; terminating process group");
            terminate_group(pgid, &mut child).await;
            (child.wait().await?, false)
        }
    };

    let memory_trace = match sampler {
        Some(s) => Some(s.finish().await),
        None => None,
    };
    let (stdout, stderr) = collector.await.unwrap_or_default();

    let exit = if timed_out {
        ExitResult::TimedOut
    } else if let Some(rc) = status.code() {
        ExitResult::Exited(rc)
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            ExitResult::Signaled(status.signal().unwrap_or(0))
        }
        #[cfg(not(unix))]
        {
            ExitResult::Exited(1)
        }
    };

    Ok(ProcessOutput {
        exit,
        stdout,
        stderr,
        memory_trace,
    })
}

/// Resolve when cancellation is actually signalled. A dropped sender means
/// nobody can cancel any more, not that cancellation happened.
async fn cancellation(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wire up line readers for both streams and a collector that owns the
/// captured vectors and the optional mirror files.
fn spawn_capture(
    spec: &JobSpec,
    child: &mut Child,
) -> tokio::task::JoinHandle<(Vec<String>, Vec<String>)> {
    let (line_tx, mut line_rx) = mpsc::channel::<(Stream, String)>(256);

    if let Some(stdout) = child.stdout.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((Stream::Out, line)).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((Stream::Err, line)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    let interleave = spec.interleave_stdout_stderr;
    let stdout_path = spec.stdout_file.clone();
    let stderr_path = spec.stderr_file.clone();
    let job_name = spec.display_name().to_string();

    tokio::spawn(async move {
        let mut stdout_file = match stdout_path {
            Some(p) => open_mirror(&p, &job_name).await,
            None => None,
        };
        let mut stderr_file = match stderr_path {
            Some(p) => open_mirror(&p, &job_name).await,
            None => None,
        };

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();

        while let Some((stream, line)) = line_rx.recv().await {
            // With interleaving, stderr lines share stdout's destination,
            // both in memory and on disk.
            let (lines, file) = match stream {
                Stream::Out => (&mut stdout_lines, &mut stdout_file),
                Stream::Err if interleave => (&mut stdout_lines, &mut stdout_file),
                Stream::Err => (&mut stderr_lines, &mut stderr_file),
            };
            if let Some(f) = file {
                let _ = f.write_all(line.as_bytes()).await;
                let _ = f.write_all(b"\n").await;
            }
            lines.push(line);
        }

        for file in [stdout_file, stderr_file].iter_mut().flatten() {
            let _ = file.flush().await;
        }

        (stdout_lines, stderr_lines)
    })
}

async fn open_mirror(path: &str, job_name: &str) -> Option<tokio::fs::File> {
    match tokio::fs::File::create(path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(
                job = %job_name,
                path = %path,
                error = %e,
                "could not open output mirror file; capturing to memory only"
            );
            None
        }
    }
}

/// Signal the process group: SIGTERM, a bounded grace window, then SIGKILL.
#[cfg(unix)]
async fn terminate_group(pgid: u32, child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(pgid as i32);
    let _ = killpg(group, Signal::SIGTERM);

    let deadline = Instant::now() + TERMINATION_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => sleep(Duration::from_millis(100)).await,
            Err(_) => break,
        }
    }

    let _ = killpg(group, Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn terminate_group(_pgid: u32, child: &mut Child) {
    let _ = child.kill().await;
}
