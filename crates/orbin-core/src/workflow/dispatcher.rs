//! Run dispatcher: decides what a run does next.
//!
//! Steps run in definition order. The planner walks the definition against
//! the run's step records and stops at the first step that is not finished:
//!
//! - completed and skipped steps are passed over
//! - a completed `condition` step marks the steps of the branch not taken
//!   for skipping
//! - a failed step fails the run unless it has `continue_on_failure`
//! - a missing or pending step is started
//! - a retrying step is resumed once `next_retry_at` is due
//! - a running delay step completes once `resume_at` is due
//! - a running step past `timeout_at` times out
//!
//! Planning is pure. The engine applies the plan with compare-and-set writes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use orbin_types::run::{RunError, StepExecution, StepOutputs, StepStatus, WorkflowRun};
use orbin_types::workflow::{StepConfig, WorkflowDefinition};
use serde_json::Value;

/// The next thing a run should do.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Start a step. `existing` is false when its record must be created.
    Start {
        step_id: String,
        input: Value,
        existing: bool,
    },
    /// A retrying step is due for its next attempt.
    Resume { step_id: String },
    /// A running delay step reached its resume time.
    CompleteDelay { step_id: String },
    /// A running step exceeded its execution timeout.
    TimeoutStep { step_id: String },
    /// Nothing to do until a step reports or `wake_at` passes.
    Wait { wake_at: Option<DateTime<Utc>> },
    /// Every step finished without an unresolved failure.
    CompleteRun { result: Value },
    /// A step failed terminally and its failure propagates.
    FailRun { error: RunError },
}

/// A plan for one dispatcher pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    /// Steps to mark skipped before acting. Missing records are created
    /// directly in `skipped`.
    pub skips: Vec<String>,
    pub next: NextAction,
}

/// Interpret a condition step's output as a branch decision.
///
/// Accepts a bare boolean or an object with a boolean `result` field.
pub fn branch_taken(output: &Value) -> Option<bool> {
    match output {
        Value::Bool(b) => Some(*b),
        Value::Object(map) => map.get("result").and_then(Value::as_bool),
        _ => None,
    }
}

/// Interpret a loop step's output as its continuation predicate.
pub fn loop_continues(output: &Value) -> bool {
    output
        .get("continue")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Compute the next action for `run`.
pub fn plan(
    definition: &WorkflowDefinition,
    run: &WorkflowRun,
    steps: &[StepExecution],
    now: DateTime<Utc>,
) -> DispatchPlan {
    let by_id: HashMap<&str, &StepExecution> =
        steps.iter().map(|s| (s.step_id.as_str(), s)).collect();

    let mut not_taken: HashSet<&str> = HashSet::new();
    let mut skips = Vec::new();
    let mut last_output: Option<&Value> = None;

    for spec in &definition.steps {
        let existing = by_id.get(spec.id.as_str()).copied();

        if not_taken.contains(spec.id.as_str()) {
            match existing.map(|s| s.status) {
                None | Some(StepStatus::Pending) | Some(StepStatus::Retrying) => {
                    skips.push(spec.id.clone());
                    continue;
                }
                // Records that already ran are treated like any other.
                _ => {}
            }
        }

        let Some(step) = existing else {
            let input = last_output.cloned().unwrap_or_else(|| run.trigger_data.clone());
            return DispatchPlan {
                skips,
                next: NextAction::Start {
                    step_id: spec.id.clone(),
                    input,
                    existing: false,
                },
            };
        };

        match step.status {
            StepStatus::Completed => {
                if let StepConfig::Condition {
                    then_steps,
                    else_steps,
                    ..
                } = &spec.config
                {
                    let output = step.output.as_ref().unwrap_or(&Value::Null);
                    match branch_taken(output) {
                        Some(true) => not_taken.extend(else_steps.iter().map(String::as_str)),
                        Some(false) => not_taken.extend(then_steps.iter().map(String::as_str)),
                        None => {}
                    }
                }
                if let Some(output) = &step.output {
                    last_output = Some(output);
                }
            }
            StepStatus::Skipped => {}
            StepStatus::Failed => {
                if spec.continue_on_failure {
                    continue;
                }
                let message = step
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| format!("step '{}' failed", spec.id));
                return DispatchPlan {
                    skips,
                    next: NextAction::FailRun {
                        error: RunError {
                            message,
                            stack: step.error.as_ref().and_then(|e| e.stack.clone()),
                            step_id: Some(spec.id.clone()),
                        },
                    },
                };
            }
            StepStatus::Pending => {
                let input = step
                    .input
                    .clone()
                    .or_else(|| last_output.cloned())
                    .unwrap_or_else(|| run.trigger_data.clone());
                return DispatchPlan {
                    skips,
                    next: NextAction::Start {
                        step_id: spec.id.clone(),
                        input,
                        existing: true,
                    },
                };
            }
            StepStatus::Retrying => {
                let next = match step.next_retry_at {
                    Some(at) if at > now => NextAction::Wait { wake_at: Some(at) },
                    _ => NextAction::Resume {
                        step_id: spec.id.clone(),
                    },
                };
                return DispatchPlan { skips, next };
            }
            StepStatus::Running => {
                let next = if step.timeout_at.is_some_and(|at| at <= now) {
                    NextAction::TimeoutStep {
                        step_id: spec.id.clone(),
                    }
                } else if step.resume_at.is_some_and(|at| at <= now) {
                    NextAction::CompleteDelay {
                        step_id: spec.id.clone(),
                    }
                } else {
                    let wake_at = match (step.resume_at, step.timeout_at) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    NextAction::Wait { wake_at }
                };
                return DispatchPlan { skips, next };
            }
        }
    }

    let outputs: StepOutputs = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| (s.step_id.clone(), s.output.clone().unwrap_or(Value::Null)))
        .collect();
    let result = serde_json::to_value(outputs).unwrap_or(Value::Null);

    DispatchPlan {
        skips,
        next: NextAction::CompleteRun { result },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use orbin_types::run::{RunStatus, StepError};
    use orbin_types::workflow::{
        RetryPolicy, StepSpec, TriggerSpec, TriggerType, WorkflowStatus,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn action(id: &str) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            name: id.to_uppercase(),
            config: StepConfig::Action {
                handler: "test.echo".to_string(),
                params: Value::Null,
            },
            retry_policy: None,
            continue_on_failure: false,
            timeout_ms: None,
        }
    }

    fn condition(id: &str, then_steps: &[&str], else_steps: &[&str]) -> StepSpec {
        StepSpec {
            config: StepConfig::Condition {
                handler: "test.branch".to_string(),
                params: Value::Null,
                then_steps: then_steps.iter().map(|s| s.to_string()).collect(),
                else_steps: else_steps.iter().map(|s| s.to_string()).collect(),
            },
            ..action(id)
        }
    }

    fn definition(steps: Vec<StepSpec>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            name: "pipeline".to_string(),
            description: None,
            status: WorkflowStatus::Active,
            version: 1,
            trigger: TriggerSpec::Manual {},
            steps,
            retry_policy: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn run_for(def: &WorkflowDefinition) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            organization_id: def.organization_id,
            workflow_id: def.id,
            workflow_version: def.version,
            status: RunStatus::Running,
            trigger_type: TriggerType::Manual,
            trigger_data: json!({"seed": 1}),
            idempotency_key: None,
            result: None,
            error: None,
            default_retry_policy: RetryPolicy::default(),
            deadline_at: None,
            replay_of: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
            steps: vec![],
        }
    }

    fn record(run: &WorkflowRun, step_id: &str, status: StepStatus, output: Option<Value>) -> StepExecution {
        StepExecution {
            id: Uuid::now_v7(),
            run_id: run.id,
            organization_id: run.organization_id,
            step_id: step_id.to_string(),
            step_name: step_id.to_uppercase(),
            status,
            attempt: 1,
            iteration: 1,
            retry_policy: RetryPolicy::default(),
            input: None,
            output,
            error: None,
            next_retry_at: None,
            resume_at: None,
            timeout_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_step_receives_trigger_data() {
        let def = definition(vec![action("a"), action("b")]);
        let run = run_for(&def);

        let plan = plan(&def, &run, &[], Utc::now());
        assert!(plan.skips.is_empty());
        assert_eq!(
            plan.next,
            NextAction::Start {
                step_id: "a".to_string(),
                input: json!({"seed": 1}),
                existing: false,
            }
        );
    }

    #[test]
    fn test_next_step_receives_previous_output() {
        let def = definition(vec![action("a"), action("b")]);
        let run = run_for(&def);
        let steps = vec![record(&run, "a", StepStatus::Completed, Some(json!({"n": 2})))];

        let plan = plan(&def, &run, &steps, Utc::now());
        assert_eq!(
            plan.next,
            NextAction::Start {
                step_id: "b".to_string(),
                input: json!({"n": 2}),
                existing: false,
            }
        );
    }

    #[test]
    fn test_running_step_blocks_successors() {
        let def = definition(vec![action("a"), action("b")]);
        let run = run_for(&def);
        let steps = vec![record(&run, "a", StepStatus::Running, None)];

        let plan = plan(&def, &run, &steps, Utc::now());
        assert_eq!(plan.next, NextAction::Wait { wake_at: None });
    }

    #[test]
    fn test_retrying_step_waits_until_due() {
        let def = definition(vec![action("a")]);
        let run = run_for(&def);
        let now = Utc::now();
        let mut step = record(&run, "a", StepStatus::Retrying, None);
        step.next_retry_at = Some(now + Duration::seconds(2));

        let waiting = plan(&def, &run, std::slice::from_ref(&step), now);
        assert_eq!(
            waiting.next,
            NextAction::Wait {
                wake_at: step.next_retry_at
            }
        );

        let due = plan(&def, &run, &[step], now + Duration::seconds(2));
        assert_eq!(
            due.next,
            NextAction::Resume {
                step_id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_delay_and_timeout_deadlines() {
        let def = definition(vec![action("a")]);
        let run = run_for(&def);
        let now = Utc::now();

        let mut delayed = record(&run, "a", StepStatus::Running, None);
        delayed.resume_at = Some(now);
        assert_eq!(
            plan(&def, &run, &[delayed], now).next,
            NextAction::CompleteDelay {
                step_id: "a".to_string()
            }
        );

        let mut slow = record(&run, "a", StepStatus::Running, None);
        slow.timeout_at = Some(now + Duration::seconds(5));
        assert_eq!(
            plan(&def, &run, std::slice::from_ref(&slow), now).next,
            NextAction::Wait {
                wake_at: slow.timeout_at
            }
        );
        assert_eq!(
            plan(&def, &run, &[slow], now + Duration::seconds(5)).next,
            NextAction::TimeoutStep {
                step_id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_failed_step_fails_run_with_step_id() {
        let def = definition(vec![action("a"), action("b"), action("c")]);
        let run = run_for(&def);
        let mut failed = record(&run, "b", StepStatus::Failed, None);
        failed.error = Some(StepError::new("upstream 503"));
        let steps = vec![record(&run, "a", StepStatus::Completed, None), failed];

        let plan = plan(&def, &run, &steps, Utc::now());
        match plan.next {
            NextAction::FailRun { error } => {
                assert_eq!(error.step_id.as_deref(), Some("b"));
                assert_eq!(error.message, "upstream 503");
            }
            other => panic!("expected FailRun, got {other:?}"),
        }
    }

    #[test]
    fn test_continue_on_failure_proceeds() {
        let mut b = action("b");
        b.continue_on_failure = true;
        let def = definition(vec![action("a"), b, action("c")]);
        let run = run_for(&def);
        let steps = vec![
            record(&run, "a", StepStatus::Completed, Some(json!("from-a"))),
            record(&run, "b", StepStatus::Failed, None),
        ];

        let plan = plan(&def, &run, &steps, Utc::now());
        assert_eq!(
            plan.next,
            NextAction::Start {
                step_id: "c".to_string(),
                input: json!("from-a"),
                existing: false,
            }
        );
    }

    #[test]
    fn test_condition_skips_branch_not_taken() {
        let def = definition(vec![
            condition("check", &["fast"], &["slow"]),
            action("fast"),
            action("slow"),
            action("finish"),
        ]);
        let run = run_for(&def);
        let steps = vec![
            record(&run, "check", StepStatus::Completed, Some(json!(true))),
            record(&run, "fast", StepStatus::Completed, Some(json!("done"))),
        ];

        let plan = plan(&def, &run, &steps, Utc::now());
        assert_eq!(plan.skips, vec!["slow".to_string()]);
        assert_eq!(
            plan.next,
            NextAction::Start {
                step_id: "finish".to_string(),
                input: json!("done"),
                existing: false,
            }
        );
    }

    #[test]
    fn test_false_condition_skips_then_branch() {
        let def = definition(vec![
            condition("check", &["notify"], &[]),
            action("notify"),
        ]);
        let run = run_for(&def);
        let steps = vec![record(
            &run,
            "check",
            StepStatus::Completed,
            Some(json!({"result": false})),
        )];

        let plan = plan(&def, &run, &steps, Utc::now());
        assert_eq!(plan.skips, vec!["notify".to_string()]);
        assert!(matches!(plan.next, NextAction::CompleteRun { .. }));
    }

    #[test]
    fn test_all_finished_completes_with_outputs() {
        let def = definition(vec![action("a"), action("b")]);
        let run = run_for(&def);
        let steps = vec![
            record(&run, "a", StepStatus::Completed, Some(json!(1))),
            record(&run, "b", StepStatus::Skipped, None),
        ];

        let plan = plan(&def, &run, &steps, Utc::now());
        assert_eq!(
            plan.next,
            NextAction::CompleteRun {
                result: json!({"a": 1})
            }
        );
    }

    #[test]
    fn test_branch_and_loop_predicates() {
        assert_eq!(branch_taken(&json!(true)), Some(true));
        assert_eq!(branch_taken(&json!({"result": false})), Some(false));
        assert_eq!(branch_taken(&json!("yes")), None);
        assert!(loop_continues(&json!({"continue": true})));
        assert!(!loop_continues(&json!({"continue": false})));
        assert!(!loop_continues(&json!(null)));
    }
}
