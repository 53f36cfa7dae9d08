// src/exec/outcome.rs

//! Outcome classification.
//!
//! The classifier is a pure function of the process exit and the job's
//! policy, so it can be unit tested without spawning anything. First
//! matching rule wins:
//!
//! 1. outcome table lookup on the command return code
//! 2. timeout with `timeout_ok` => success
//! 3. timeout with `timeout_ignore` => fail_ignored
//! 4. timeout => fail
//! 5. return code in `ignore_returns` => success
//! 6. return code in `ok_returns` => fail_ignored
//! 7. return code 0 => success
//! 8. anything else => fail

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::jobs::JobSpec;

/// Classified result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fail,
    FailIgnored,
}

/// How the supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResult {
    Exited(i32),
    TimedOut,
    Signaled(i32),
}

impl ExitResult {
    /// The command return code recorded in the status file. Timed-out
    /// processes have none; signalled processes use the shell convention
    /// of 128 plus the signal number.
    pub fn command_return_code(self) -> Option<i32> {
        match self {
            ExitResult::Exited(rc) => Some(rc),
            ExitResult::TimedOut => None,
            ExitResult::Signaled(sig) => Some(128 + sig),
        }
    }

    pub fn timed_out(self) -> bool {
        matches!(self, ExitResult::TimedOut)
    }
}

/// JSON map from return code (as a string key) to outcome.
pub type OutcomeTable = BTreeMap<String, Outcome>;

/// Load an outcome table from disk.
pub fn load_outcome_table(path: &Path) -> Result<OutcomeTable> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading outcome table {:?}", path))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parsing outcome table {:?}", path))
}

/// The classifier's verdict: the outcome plus the exit code of the wrapper
/// process, which is what the dispatcher sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub outcome: Outcome,
    pub wrapper_return_code: i32,
}

/// Classify a process exit under the job's outcome policy.
pub fn classify(
    exit: ExitResult,
    spec: &JobSpec,
    table: Option<&OutcomeTable>,
) -> Classification {
    let rc = exit.command_return_code();

    if let (Some(table), Some(rc)) = (table, rc) {
        if let Some(&outcome) = table.get(&rc.to_string()) {
            let wrapper = match outcome {
                Outcome::Success | Outcome::FailIgnored => 0,
                Outcome::Fail => {
                    if rc != 0 {
                        rc
                    } else {
                        1
                    }
                }
            };
            return Classification {
                outcome,
                wrapper_return_code: wrapper,
            };
        }
    }

    if exit.timed_out() {
        return if spec.timeout_ok {
            Classification {
                outcome: Outcome::Success,
                wrapper_return_code: 0,
            }
        } else if spec.timeout_ignore {
            Classification {
                outcome: Outcome::FailIgnored,
                wrapper_return_code: 0,
            }
        } else {
            Classification {
                outcome: Outcome::Fail,
                wrapper_return_code: 1,
            }
        };
    }

    // Not timed out, so there is a return code (possibly signal-derived).
    let rc = rc.unwrap_or(1);

    if spec.ignore_returns.contains(&rc) {
        Classification {
            outcome: Outcome::Success,
            wrapper_return_code: 0,
        }
    } else if spec.ok_returns.contains(&rc) {
        Classification {
            outcome: Outcome::FailIgnored,
            wrapper_return_code: 0,
        }
    } else if rc == 0 {
        Classification {
            outcome: Outcome::Success,
            wrapper_return_code: 0,
        }
    } else {
        Classification {
            outcome: Outcome::Fail,
            wrapper_return_code: rc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec {
            job_id: "j".into(),
            pipeline_name: "p".into(),
            ci_stage: "build".into(),
            inputs: vec![],
            outputs: vec![],
            command: "true".into(),
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
            status_file: "status.json".into(),
        }
    }

    #[test]
    fn zero_exit_is_success() {
        let c = classify(ExitResult::Exited(0), &spec(), None);
        assert_eq!(c.outcome, Outcome::Success);
        assert_eq!(c.wrapper_return_code, 0);
    }

    #[test]
    fn nonzero_exit_is_fail_with_that_code() {
        let c = classify(ExitResult::Exited(3), &spec(), None);
        assert_eq!(c.outcome, Outcome::Fail);
        assert_eq!(c.wrapper_return_code, 3);
    }

    #[test]
    fn ignored_return_is_success() {
        let mut s = spec();
        s.ignore_returns = vec![77];
        let c = classify(ExitResult::Exited(77), &s, None);
        assert_eq!(c.outcome, Outcome::Success);
        assert_eq!(c.wrapper_return_code, 0);
    }

    #[test]
    fn ok_return_is_ignored_failure() {
        let mut s = spec();
        s.ok_returns = vec![10];
        let c = classify(ExitResult::Exited(10), &s, None);
        assert_eq!(c.outcome, Outcome::FailIgnored);
        assert_eq!(c.wrapper_return_code, 0);
    }

    #[test]
    fn ignore_returns_beats_ok_returns() {
        let mut s = spec();
        s.ignore_returns = vec![10];
        s.ok_returns = vec![10];
        let c = classify(ExitResult::Exited(10), &s, None);
        assert_eq!(c.outcome, Outcome::Success);
    }

    #[test]
    fn timeout_without_flags_is_fail() {
        let c = classify(ExitResult::TimedOut, &spec(), None);
        assert_eq!(c.outcome, Outcome::Fail);
        assert_ne!(c.wrapper_return_code, 0);
    }

    #[test]
    fn timeout_ok_is_success() {
        let mut s = spec();
        s.timeout_ok = true;
        let c = classify(ExitResult::TimedOut, &s, None);
        assert_eq!(c.outcome, Outcome::Success);
        assert_eq!(c.wrapper_return_code, 0);
    }

    #[test]
    fn timeout_ignore_is_ignored_failure() {
        let mut s = spec();
        s.timeout_ignore = true;
        let c = classify(ExitResult::TimedOut, &s, None);
        assert_eq!(c.outcome, Outcome::FailIgnored);
        assert_eq!(c.wrapper_return_code, 0);
    }

    #[test]
    fn outcome_table_wins_over_everything() {
        let mut s = spec();
        s.ignore_returns = vec![2];
        let mut table = OutcomeTable::new();
        table.insert("2".into(), Outcome::Fail);
        let c = classify(ExitResult::Exited(2), &s, Some(&table));
        assert_eq!(c.outcome, Outcome::Fail);
        assert_eq!(c.wrapper_return_code, 2);
    }

    #[test]
    fn outcome_table_can_fail_a_zero_exit() {
        let mut table = OutcomeTable::new();
        table.insert("0".into(), Outcome::Fail);
        let c = classify(ExitResult::Exited(0), &spec(), Some(&table));
        assert_eq!(c.outcome, Outcome::Fail);
        assert_ne!(c.wrapper_return_code, 0);
    }

    #[test]
    fn table_miss_falls_through_to_policy() {
        let mut table = OutcomeTable::new();
        table.insert("9".into(), Outcome::Fail);
        let c = classify(ExitResult::Exited(0), &spec(), Some(&table));
        assert_eq!(c.outcome, Outcome::Success);
    }

    #[test]
    fn signal_exit_maps_to_shell_convention() {
        let c = classify(ExitResult::Signaled(9), &spec(), None);
        assert_eq!(c.outcome, Outcome::Fail);
        assert_eq!(c.wrapper_return_code, 137);
    }
}
