//! DAG definition types and the topological layering used to schedule
//! step execution.
//!
//! No teacher analogue exists for the graph type itself — `gator-core`'s
//! `plan`/`invariant` modules are flat, one-task-per-plan structures, not
//! a dependency graph. The scalar enums embedded here (`StepKind`,
//! `Priority` is `dagctl_db::models::Priority`) follow the derive-heavy,
//! serde-first style of `gator-core/src/invariant/types.rs`.

pub mod error;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

pub use error::DagError;

/// A label-match selector restricting which workers may claim a Task.
/// Empty means "run locally, don't dispatch to a worker."
pub type WorkerSelector = HashMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryPolicy {
    pub limit: u32,
    pub interval_sec: u64,
}

/// Governs whether downstream steps proceed despite a non-success result.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContinueOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub exit_code: Vec<i32>,
}

impl ContinueOn {
    /// Does this policy allow progress past a step that exited with `code`?
    pub fn allows(&self, code: i32) -> bool {
        if code == 0 {
            return true;
        }
        self.failure || self.exit_code.contains(&code)
    }
}

/// Only Shell and SubDag step variants are implemented; see DESIGN.md
/// Open Question 5 — Http is reserved for a later version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Shell {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    SubDag {
        dag_name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub continue_on: ContinueOn,
}

/// A DAG-level predicate checked before promoting Queued -> Running.
/// Evaluated by running `test` as a shell command; if `expected` is set,
/// the command's trimmed stdout must equal it, otherwise a zero exit
/// code is sufficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Precondition {
    pub test: String,
    #[serde(default)]
    pub expected: Option<String>,
}

/// Sub-DAGs run as virtual terminal nodes after the main graph finishes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandlerOn {
    pub on_success: Option<String>,
    pub on_failure: Option<String>,
    pub on_exit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDef {
    pub namespace: String,
    pub name: String,
    pub queue_name: String,
    /// 0 = unlimited (DESIGN.md Open Question 1).
    #[serde(default)]
    pub max_active_runs: u32,
    #[serde(default = "default_max_active_steps")]
    pub max_active_steps: u32,
    #[serde(default)]
    pub worker_selector: WorkerSelector,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    #[serde(default)]
    pub handler_on: HandlerOn,
    #[serde(default)]
    pub params: serde_json::Value,
    pub steps: Vec<Step>,
}

fn default_max_active_steps() -> u32 {
    1
}

impl DagDef {
    pub fn from_yaml(yaml: &str) -> Result<Self, DagError> {
        let dag: DagDef = serde_yaml::from_str(yaml)?;
        dag.validate()?;
        Ok(dag)
    }

    pub fn to_yaml(&self) -> Result<String, DagError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), DagError> {
        topological_layers(&self.steps)?;
        Ok(())
    }
}

/// Group steps into layers by dependency depth: layer 0 has no
/// dependencies, layer N's steps depend only on steps in layers `< N`.
/// A step is "eligible" (§4.6) once every step in `depends_on` has
/// succeeded or been allowed through by `continueOn`; layering here just
/// establishes the static ordering the Agent schedules within.
pub fn topological_layers(steps: &[Step]) -> Result<Vec<Vec<&Step>>, DagError> {
    let by_name: HashMap<&str, &Step> = steps.iter().map(|s| (s.name.as_str(), s)).collect();

    for step in steps {
        for dep in &step.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(DagError::UnknownDependency(step.name.clone(), dep.clone()));
            }
        }
    }

    let mut remaining_deps: HashMap<&str, HashSet<&str>> = steps
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();

    let mut layers = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    while placed.len() < steps.len() {
        let ready: Vec<&str> = remaining_deps
            .iter()
            .filter(|(name, deps)| !placed.contains(*name) && deps.is_empty())
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            // Every unplaced step still has an unmet dependency: a cycle.
            let stuck = remaining_deps
                .keys()
                .find(|name| !placed.contains(**name))
                .expect("unplaced steps remain");
            return Err(DagError::Cycle(stuck.to_string()));
        }

        let mut layer: Vec<&Step> = ready.iter().map(|name| by_name[name]).collect();
        layer.sort_by(|a, b| a.name.cmp(&b.name));

        for name in &ready {
            placed.insert(name);
            remaining_deps.remove(name);
        }
        for deps in remaining_deps.values_mut() {
            for name in &ready {
                deps.remove(name);
            }
        }

        layers.push(layer);
    }

    Ok(layers)
}

/// Evaluate every precondition; all must pass for the DAG-level gate to
/// open. A pure predicate per the glossary: no side effects, safe to
/// re-run every scheduler tick.
pub async fn preconditions_satisfied(preconditions: &[Precondition]) -> bool {
    for p in preconditions {
        if !precondition_satisfied(p).await {
            return false;
        }
    }
    true
}

async fn precondition_satisfied(p: &Precondition) -> bool {
    let output = match tokio::process::Command::new("sh").arg("-c").arg(&p.test).output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(test = %p.test, error = %e, "precondition command failed to spawn");
            return false;
        }
    };

    match &p.expected {
        Some(expected) => String::from_utf8_lossy(&output.stdout).trim() == expected.trim(),
        None => output.status.success(),
    }
}

/// Kahn's-algorithm-style linearization, used where callers want a flat
/// execution order rather than explicit layers (e.g. dry-run printing).
pub fn topological_order(steps: &[Step]) -> Result<Vec<&Step>, DagError> {
    Ok(topological_layers(steps)?.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            kind: StepKind::Shell {
                command: "true".to_string(),
                args: vec![],
            },
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            retry_policy: None,
            continue_on: ContinueOn::default(),
        }
    }

    #[test]
    fn linear_chain_layers_one_per_step() {
        let steps = vec![shell_step("a", &[]), shell_step("b", &["a"]), shell_step("c", &["b"])];
        let layers = topological_layers(&steps).unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0][0].name, "a");
        assert_eq!(layers[2][0].name, "c");
    }

    #[test]
    fn independent_steps_share_a_layer() {
        let steps = vec![shell_step("a", &[]), shell_step("b", &[]), shell_step("c", &["a", "b"])];
        let layers = topological_layers(&steps).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].len(), 2);
        assert_eq!(layers[1][0].name, "c");
    }

    #[test]
    fn cycle_is_rejected() {
        let steps = vec![shell_step("a", &["b"]), shell_step("b", &["a"])];
        assert!(matches!(topological_layers(&steps), Err(DagError::Cycle(_))));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let steps = vec![shell_step("a", &["ghost"])];
        assert!(matches!(
            topological_layers(&steps),
            Err(DagError::UnknownDependency(_, _))
        ));
    }

    #[test]
    fn continue_on_allows_listed_exit_codes() {
        let policy = ContinueOn {
            failure: false,
            skipped: false,
            exit_code: vec![2, 3],
        };
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(1));
    }

    #[test]
    fn continue_on_failure_allows_any_nonzero_code() {
        let policy = ContinueOn {
            failure: true,
            ..Default::default()
        };
        assert!(policy.allows(1));
        assert!(policy.allows(17));
    }
}
