#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use litani::cache::{CacheStore, Run};
use litani::jobs::JobSpec;

/// A job spec with sensible defaults; tests override what they care about.
pub fn job(id: &str, command: &str, inputs: &[&str], outputs: &[&str]) -> JobSpec {
    JobSpec {
        job_id: id.to_string(),
        pipeline_name: "pipe".to_string(),
        ci_stage: "build".to_string(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        command: command.to_string(),
        description: None,
        cwd: None,
        timeout: None,
        pool: None,
        stdout_file: None,
        stderr_file: None,
        interleave_stdout_stderr: false,
        ignore_returns: vec![],
        ok_returns: vec![],
        timeout_ok: false,
        timeout_ignore: false,
        outcome_table: None,
        profile_memory: false,
        profile_memory_interval: 1,
        tags: vec![],
        status_file: format!("status-{id}.json"),
    }
}

/// Like [`job`], but with the status file rooted under a real directory so
/// executor tests can write it.
pub fn job_in(dir: &Path, id: &str, command: &str, inputs: &[&str], outputs: &[&str]) -> JobSpec {
    let mut spec = job(id, command, inputs, outputs);
    spec.status_file = dir
        .join("status")
        .join(format!("{id}.json"))
        .to_string_lossy()
        .into_owned();
    spec
}

/// Seed a cache directory with a fresh run document.
pub fn init_store(dir: &Path, pools: BTreeMap<String, usize>) -> (CacheStore, Run) {
    let store = CacheStore::new(dir);
    let run = Run::new(
        "test-run".to_string(),
        "test-project".to_string(),
        pools,
        vec![
            "build".to_string(),
            "test".to_string(),
            "report".to_string(),
        ],
    )
    .unwrap();
    store.create(&run).unwrap();
    (store, run)
}
