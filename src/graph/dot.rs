// src/graph/dot.rs

//! Graphviz DOT rendering for the `graph` subcommand.

use std::collections::HashSet;

use anyhow::Result;

use crate::graph::BuildGraph;

/// Render the job DAG as a DOT digraph, optionally restricted to the given
/// pipelines.
pub fn render(graph: &BuildGraph, pipelines: &[String]) -> Result<String> {
    let selected: Option<HashSet<usize>> = if pipelines.is_empty() {
        None
    } else {
        Some(graph.restrict("pipeline_name", pipelines)?)
    };

    let included = |i: usize| selected.as_ref().map(|s| s.contains(&i)).unwrap_or(true);

    let mut out = String::from("digraph litani {\n");
    out.push_str("  rankdir=LR;\n  node [shape=box];\n");

    for (i, job) in graph.jobs().iter().enumerate() {
        if !included(i) {
            continue;
        }
        out.push_str(&format!(
            "  \"{}\" [label=\"{}\"];\n",
            job.job_id,
            dot_escape(job.display_name())
        ));
    }

    for (i, job) in graph.jobs().iter().enumerate() {
        if !included(i) {
            continue;
        }
        for &d in graph.deps_of(i) {
            out.push_str(&format!(
                "  \"{}\" -> \"{}\";\n",
                graph.job(d).job_id,
                job.job_id
            ));
        }
    }

    out.push_str("}\n");
    Ok(out)
}

fn dot_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
