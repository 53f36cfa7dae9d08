// src/capabilities.rs

//! Feature enumeration for `print-capabilities`.
//!
//! Consumers probe this list before relying on flags that older releases
//! lack.

use anyhow::Result;

pub const CAPABILITIES: &[&str] = &[
    "ci_stages",
    "dry_run",
    "fail_on_pipeline_failure",
    "graph_rendering",
    "memory_profiling",
    "outcome_tables",
    "output_directory_flags",
    "parallelism_limits",
    "pools",
    "timeouts",
];

/// Print the capability list: JSON by default, one per line with `-r`.
pub fn print(human_readable: bool) -> Result<()> {
    if human_readable {
        for cap in CAPABILITIES {
            println!("{cap}");
        }
    } else {
        println!("{}", serde_json::to_string_pretty(CAPABILITIES)?);
    }
    Ok(())
}
