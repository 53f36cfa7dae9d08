// src/graph/build.rs

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, Result};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::warn;

use crate::jobs::JobSpec;

/// Synthetic target for a pipeline or CI stage aggregator.
pub fn phony_target(field: &str, value: &str) -> String {
    format!("__litani_{field}_{value}")
}

/// A phony aggregator edge: no command, used only as a filter target.
#[derive(Debug, Clone)]
pub struct Phony {
    pub target: String,
    pub inputs: Vec<String>,
    /// Indices of the jobs this aggregator covers.
    jobs: Vec<usize>,
}

/// The assembled dependency graph over the registered jobs.
///
/// Edges are derived by literal path comparison: a job depends on every job
/// that declares one of its inputs as an output. Each job's status file is
/// included among its outputs so every job has at least one output and
/// participates in the DAG.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    jobs: Vec<JobSpec>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Per job, the inputs no registered job produces. These must exist on
    /// disk before the job can run.
    source_inputs: Vec<Vec<String>>,
    phonies: Vec<Phony>,
}

impl BuildGraph {
    /// Assemble the graph, validating pool references and acyclicity.
    pub fn assemble(jobs: Vec<JobSpec>, pools: &BTreeMap<String, usize>) -> Result<Self> {
        for job in &jobs {
            if let Some(ref pool) = job.pool {
                if !pools.contains_key(pool) {
                    return Err(anyhow!(
                        "job '{}' references non-existent pool '{}'",
                        job.display_name(),
                        pool
                    ));
                }
            }
        }

        let index: HashMap<String, usize> = jobs
            .iter()
            .enumerate()
            .map(|(i, j)| (j.job_id.clone(), i))
            .collect();

        // Map each produced path to its producers. Overlapping outputs are
        // allowed; consumers then depend on every producer and the artifact
        // on disk is whichever job ran last.
        let mut producers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, job) in jobs.iter().enumerate() {
            for output in job.outputs.iter().chain(std::iter::once(&job.status_file)) {
                producers.entry(output.as_str()).or_default().push(i);
            }
        }
        for (path, who) in &producers {
            if who.len() > 1 {
                warn!(
                    path = %path,
                    producers = who.len(),
                    "multiple jobs declare the same output"
                );
            }
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];
        let mut source_inputs: Vec<Vec<String>> = vec![Vec::new(); jobs.len()];

        for (i, job) in jobs.iter().enumerate() {
            let mut seen: HashSet<usize> = HashSet::new();
            for input in &job.inputs {
                match producers.get(input.as_str()) {
                    Some(who) => {
                        for &p in who {
                            if p != i && seen.insert(p) {
                                deps[i].push(p);
                                dependents[p].push(i);
                            }
                        }
                    }
                    None => source_inputs[i].push(input.clone()),
                }
            }
        }

        // Edge direction: producer -> consumer. A topological sort fails on
        // a cycle.
        let mut dag: DiGraphMap<usize, ()> = DiGraphMap::new();
        for i in 0..jobs.len() {
            dag.add_node(i);
        }
        for (i, job_deps) in deps.iter().enumerate() {
            for &d in job_deps {
                dag.add_edge(d, i, ());
            }
        }
        if let Err(cycle) = toposort(&dag, None) {
            let job = &jobs[cycle.node_id()];
            return Err(anyhow!(
                "dependency cycle in job graph involving job '{}'",
                job.display_name()
            ));
        }

        let phonies = Self::build_phonies(&jobs);

        Ok(Self {
            jobs,
            index,
            deps,
            dependents,
            source_inputs,
            phonies,
        })
    }

    fn build_phonies(jobs: &[JobSpec]) -> Vec<Phony> {
        let mut phonies = Vec::new();

        for (field, value_of) in [
            ("pipeline_name", (|j: &JobSpec| j.pipeline_name.clone()) as fn(&JobSpec) -> String),
            ("ci_stage", |j: &JobSpec| j.ci_stage.clone()),
        ] {
            let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, job) in jobs.iter().enumerate() {
                groups.entry(value_of(job)).or_default().push(i);
            }

            for (value, members) in groups {
                let mut inputs = Vec::new();
                for &i in &members {
                    inputs.extend(jobs[i].outputs.iter().cloned());
                    inputs.push(jobs[i].status_file.clone());
                }
                phonies.push(Phony {
                    target: phony_target(field, &value),
                    inputs,
                    jobs: members,
                });
            }
        }

        phonies
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    pub fn job(&self, idx: usize) -> &JobSpec {
        &self.jobs[idx]
    }

    pub fn index_of(&self, job_id: &str) -> Option<usize> {
        self.index.get(job_id).copied()
    }

    pub fn deps_of(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    pub fn dependents_of(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    pub fn source_inputs_of(&self, idx: usize) -> &[String] {
        &self.source_inputs[idx]
    }

    pub fn phonies(&self) -> &[Phony] {
        &self.phonies
    }

    /// Jobs reachable by walking dependencies from the jobs covered by the
    /// selected phony targets. Errors on an unknown pipeline or stage.
    pub fn restrict(&self, field: &str, values: &[String]) -> Result<HashSet<usize>> {
        let mut selected: HashSet<usize> = HashSet::new();

        for value in values {
            let target = phony_target(field, value);
            let phony = self
                .phonies
                .iter()
                .find(|p| p.target == target)
                .ok_or_else(|| anyhow!("no jobs match {field} '{value}'"))?;
            selected.extend(phony.jobs.iter().copied());
        }

        // Ancestors closure: every dependency of a selected job is selected.
        let mut stack: Vec<usize> = selected.iter().copied().collect();
        while let Some(i) = stack.pop() {
            for &d in &self.deps[i] {
                if selected.insert(d) {
                    stack.push(d);
                }
            }
        }

        Ok(selected)
    }

    /// Render the graph in ninja syntax for external consumers. The command
    /// of each rule is the `litani exec` invocation for that job.
    pub fn ninja_syntax(&self, pools: &BTreeMap<String, usize>) -> String {
        let mut out = String::new();

        for (name, depth) in pools {
            out.push_str(&format!("pool {name}\n  depth = {depth}\n\n"));
        }

        for job in &self.jobs {
            let command = shell_join(&job.to_exec_argv());
            out.push_str(&format!("rule {}\n", rule_name(&job.job_id)));
            out.push_str(&format!("  command = {}\n", ninja_escape(&command)));
            out.push_str(&format!(
                "  description = {}\n\n",
                ninja_escape(job.display_name())
            ));

            let outputs: Vec<String> = job
                .outputs
                .iter()
                .chain(std::iter::once(&job.status_file))
                .map(|p| ninja_path(p))
                .collect();
            let inputs: Vec<String> = job.inputs.iter().map(|p| ninja_path(p)).collect();
            out.push_str(&format!(
                "build {}: {} {}\n",
                outputs.join(" "),
                rule_name(&job.job_id),
                inputs.join(" ")
            ));
            if let Some(ref pool) = job.pool {
                out.push_str(&format!("  pool = {pool}\n"));
            }
            out.push('\n');
        }

        // Phonies are scheduling-free filter targets and never join a pool.
        for phony in &self.phonies {
            let inputs: Vec<String> = phony.inputs.iter().map(|p| ninja_path(p)).collect();
            out.push_str(&format!(
                "build {}: phony {}\n",
                ninja_path(&phony.target),
                inputs.join(" ")
            ));
        }

        out
    }
}

fn rule_name(job_id: &str) -> String {
    format!("job_{}", job_id.replace('-', "_"))
}

/// Quote an argv for `sh -c` consumption.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn ninja_escape(s: &str) -> String {
    s.replace('$', "$$")
}

fn ninja_path(s: &str) -> String {
    s.replace('$', "$$").replace(' ', "$ ").replace(':', "$:")
}
