//! Step graph construction and cycle detection.
//!
//! A definition's control flow is a directed graph: each step has an edge to
//! the step after it, and each condition step has an edge to every step in
//! its branches. Runs walk this graph forward only, so it must be acyclic.

use std::collections::HashMap;

use orbin_types::workflow::{StepConfig, StepSpec};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

/// Build the control-flow graph for `steps`.
fn build_graph(steps: &[StepSpec]) -> Result<DiGraph<&str, ()>, WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();
    let index_of: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    for pair in nodes.windows(2) {
        graph.add_edge(pair[0], pair[1], ());
    }

    for (i, step) in steps.iter().enumerate() {
        if let StepConfig::Condition {
            then_steps,
            else_steps,
            ..
        } = &step.config
        {
            for target in then_steps.iter().chain(else_steps) {
                let to = index_of.get(target.as_str()).ok_or_else(|| {
                    WorkflowError::UnknownStep(format!(
                        "condition step '{}' references unknown step '{}'",
                        step.id, target
                    ))
                })?;
                graph.add_edge(nodes[i], nodes[*to], ());
            }
        }
    }

    Ok(graph)
}

/// Validate that the step graph has no cycles.
pub fn validate_step_graph(steps: &[StepSpec]) -> Result<(), WorkflowError> {
    let graph = build_graph(steps)?;
    toposort(&graph, None).map_err(|cycle| {
        let step_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{step_id}'"))
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn action(id: &str) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Action {
                handler: "noop".to_string(),
                params: Value::Null,
            },
            retry_policy: None,
            continue_on_failure: false,
            timeout_ms: None,
        }
    }

    fn condition(id: &str, then_steps: &[&str]) -> StepSpec {
        StepSpec {
            config: StepConfig::Condition {
                handler: "noop".to_string(),
                params: Value::Null,
                then_steps: then_steps.iter().map(|s| s.to_string()).collect(),
                else_steps: vec![],
            },
            ..action(id)
        }
    }

    #[test]
    fn test_linear_pipeline_is_acyclic() {
        let steps = vec![action("a"), action("b"), action("c")];
        assert!(validate_step_graph(&steps).is_ok());
    }

    #[test]
    fn test_forward_branch_is_acyclic() {
        let steps = vec![condition("a", &["c"]), action("b"), action("c")];
        assert!(validate_step_graph(&steps).is_ok());
    }

    #[test]
    fn test_backward_branch_is_a_cycle() {
        let steps = vec![action("a"), condition("b", &["a"]), action("c")];
        let err = validate_step_graph(&steps).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn test_self_branch_is_a_cycle() {
        let steps = vec![condition("a", &["a"]), action("b")];
        assert!(matches!(
            validate_step_graph(&steps),
            Err(WorkflowError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_unknown_branch_target() {
        let steps = vec![condition("a", &["ghost"])];
        assert!(matches!(
            validate_step_graph(&steps),
            Err(WorkflowError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_single_step() {
        assert!(validate_step_graph(&[action("only")]).is_ok());
    }
}
