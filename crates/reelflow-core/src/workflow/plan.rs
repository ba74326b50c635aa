//! Dependency planning for a job's step references.
//!
//! Uses `petgraph` to model "step B references step A's output" as an edge
//! A -> B. Planning runs before anything executes and has no side effects:
//!
//! 1. Every reference must parse and name a step instance of the job.
//! 2. `petgraph::algo::toposort` rejects reference cycles.
//! 3. A reference to a later step is only allowed if that step is already
//!    completed.
//! 4. Steps are ordered topologically, ties broken by definition order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use reelflow_types::ValueMap;
use reelflow_types::job::{JobDocument, StepStatus};
use reelflow_types::reference::{ReferenceError, collect_references};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A job whose references cannot be executed safely. Nothing has run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanningError {
    #[error("step '{step}' has an invalid reference: {source}")]
    InvalidReference {
        step: String,
        #[source]
        source: ReferenceError,
    },

    #[error("step '{step}' references unknown step '{target}'")]
    UnknownReference { step: String, target: String },

    #[error("cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("step '{step}' references later step '{target}', which has not completed")]
    ForwardReference { step: String, target: String },
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Ordered view of a job's steps and their reference edges.
#[derive(Debug, Clone)]
pub struct JobPlan {
    ids: Vec<String>,
    /// Direct dependencies of each step, as definition indices.
    dependencies: Vec<BTreeSet<usize>>,
    /// Topological order, ties broken by definition index.
    order: Vec<usize>,
}

impl JobPlan {
    /// Step ids in execution order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|&i| self.ids[i].as_str())
    }

    /// Steps whose output `step_id` references directly.
    pub fn dependencies(&self, step_id: &str) -> Vec<&str> {
        self.index_of(step_id)
            .map(|idx| {
                self.dependencies[idx]
                    .iter()
                    .map(|&d| self.ids[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transitive dependents of `step_id`, in definition order.
    ///
    /// If `step_id` is not found, returns an empty vec.
    pub fn dependents(&self, step_id: &str) -> Vec<&str> {
        let Some(start) = self.index_of(step_id) else {
            return Vec::new();
        };

        let mut visited = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for (idx, deps) in self.dependencies.iter().enumerate() {
                if deps.contains(&current) && visited.insert(idx) {
                    stack.push(idx);
                }
            }
        }

        visited.into_iter().map(|i| self.ids[i].as_str()).collect()
    }

    fn index_of(&self, step_id: &str) -> Option<usize> {
        self.ids.iter().position(|id| id == step_id)
    }
}

/// Step ids referenced anywhere in a parameter mapping.
pub fn referenced_steps(params: &ValueMap) -> Result<BTreeSet<String>, ReferenceError> {
    Ok(collect_references(&Value::Object(params.clone()))?
        .into_iter()
        .filter_map(|r| r.step_id().map(str::to_string))
        .collect())
}

/// Plan a job from its current document.
pub fn plan_job(job: &JobDocument) -> Result<JobPlan, PlanningError> {
    let ids: Vec<String> = job.steps.iter().map(|s| s.id.clone()).collect();
    let id_to_idx: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    // Collect direct dependencies from the declared (unresolved) params.
    let mut dependencies = Vec::with_capacity(ids.len());
    for step in &job.steps {
        let targets =
            referenced_steps(&step.declared_params).map_err(|source| {
                PlanningError::InvalidReference {
                    step: step.id.clone(),
                    source,
                }
            })?;

        let mut deps = BTreeSet::new();
        for target in targets {
            if target == step.id {
                return Err(PlanningError::CycleDetected(step.id.clone()));
            }
            let idx = id_to_idx.get(target.as_str()).ok_or_else(|| {
                PlanningError::UnknownReference {
                    step: step.id.clone(),
                    target: target.clone(),
                }
            })?;
            deps.insert(*idx);
        }
        dependencies.push(deps);
    }

    // Build directed graph: edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = ids.iter().map(|id| graph.add_node(id.as_str())).collect();
    for (to, deps) in dependencies.iter().enumerate() {
        for &from in deps {
            graph.add_edge(nodes[from], nodes[to], ());
        }
    }

    // Topological sort -- detects cycles
    toposort(&graph, None).map_err(|cycle| {
        PlanningError::CycleDetected(graph[cycle.node_id()].to_string())
    })?;

    // Forward references are only acceptable against completed steps.
    for (idx, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            if dep > idx && job.steps[dep].status != StepStatus::Completed {
                return Err(PlanningError::ForwardReference {
                    step: ids[idx].clone(),
                    target: ids[dep].clone(),
                });
            }
        }
    }

    let order = stable_order(&dependencies).ok_or_else(|| {
        PlanningError::CycleDetected(ids.first().cloned().unwrap_or_default())
    })?;

    Ok(JobPlan {
        ids,
        dependencies,
        order,
    })
}

/// Kahn's algorithm with a min-heap so independent steps keep definition order.
fn stable_order(dependencies: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let n = dependencies.len();
    let mut indegree: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (idx, deps) in dependencies.iter().enumerate() {
        for &d in deps {
            dependents[d].push(idx);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &next in &dependents[idx] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    (order.len() == n).then_some(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reelflow_types::workflow::{StepInvocation, WorkflowDefinition};
    use serde_json::json;

    fn step(id: &str, params: serde_json::Value) -> StepInvocation {
        let params: ValueMap = serde_json::from_value(params).unwrap();
        StepInvocation::new(id, "echo", params)
    }

    fn job(steps: Vec<StepInvocation>) -> JobDocument {
        let def = WorkflowDefinition {
            name: "wf".into(),
            description: None,
            key_inputs: vec![],
            workspace_dirs: vec![],
            steps,
        };
        JobDocument::new("job", &def, ValueMap::new(), Utc::now())
    }

    #[test]
    fn linear_chain_keeps_definition_order() {
        let job = job(vec![
            step("download", json!({"url": "${input.source}"})),
            step("transcribe", json!({"file": "${download.file}"})),
            step("insights", json!({"transcript": "${transcribe.text}"})),
        ]);
        let plan = plan_job(&job).unwrap();
        assert_eq!(
            plan.order().collect::<Vec<_>>(),
            vec!["download", "transcribe", "insights"]
        );
        assert_eq!(plan.dependencies("insights"), vec!["transcribe"]);
    }

    #[test]
    fn independent_steps_keep_definition_order() {
        let job = job(vec![
            step("c", json!({})),
            step("a", json!({})),
            step("b", json!({"x": "${c.out}"})),
        ]);
        let plan = plan_job(&job).unwrap();
        assert_eq!(plan.order().collect::<Vec<_>>(), vec!["c", "a", "b"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let job = job(vec![
            step("a", json!({"x": "${b.out}"})),
            step("b", json!({"x": "${a.out}"})),
        ]);
        assert!(matches!(
            plan_job(&job),
            Err(PlanningError::CycleDetected(_))
        ));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let job = job(vec![step("a", json!({"x": "${a.out}"}))]);
        assert_eq!(
            plan_job(&job).unwrap_err(),
            PlanningError::CycleDetected("a".into())
        );
    }

    #[test]
    fn forward_reference_to_pending_step_is_rejected() {
        let job = job(vec![
            step("a", json!({"x": "${b.out}"})),
            step("b", json!({})),
        ]);
        assert_eq!(
            plan_job(&job).unwrap_err(),
            PlanningError::ForwardReference {
                step: "a".into(),
                target: "b".into()
            }
        );
    }

    #[test]
    fn forward_reference_to_completed_step_is_allowed() {
        let mut job = job(vec![
            step("a", json!({"x": "${b.out}"})),
            step("b", json!({})),
        ]);
        job.steps[1].mark_completed(ValueMap::new(), Utc::now());
        let plan = plan_job(&job).unwrap();
        assert_eq!(plan.order().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn unknown_and_malformed_references_are_rejected() {
        let j = job(vec![step("a", json!({"x": "${ghost.out}"}))]);
        assert!(matches!(
            plan_job(&j),
            Err(PlanningError::UnknownReference { .. })
        ));

        let j = job(vec![step("a", json!({"x": "${ghost"}))]);
        assert!(matches!(
            plan_job(&j),
            Err(PlanningError::InvalidReference { .. })
        ));
    }

    #[test]
    fn transitive_dependents() {
        let job = job(vec![
            step("download", json!({})),
            step("transcribe", json!({"f": "${download.file}"})),
            step("insights", json!({"t": "${transcribe.text}"})),
            step("thumbnail", json!({})),
            step("render", json!({"clips": ["${insights.clips}", "${download.file}"]})),
        ]);
        let plan = plan_job(&job).unwrap();
        assert_eq!(
            plan.dependents("download"),
            vec!["transcribe", "insights", "render"]
        );
        assert!(plan.dependents("thumbnail").is_empty());
        assert!(plan.dependents("missing").is_empty());
    }

    #[test]
    fn input_and_job_references_add_no_edges() {
        let job = job(vec![step(
            "a",
            json!({"x": "${input.source}", "y": "${job.job_id}"}),
        )]);
        let plan = plan_job(&job).unwrap();
        assert!(plan.dependencies("a").is_empty());
    }
}
