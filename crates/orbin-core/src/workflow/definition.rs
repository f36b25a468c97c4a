//! Workflow definition parsing and save-time validation.
//!
//! Configuration errors (bad retry policies, dangling step references,
//! cyclic step graphs, malformed schedules) are rejected here so they never
//! reach a run.

use std::collections::HashSet;
use std::path::Path;

use orbin_types::workflow::{StepConfig, TriggerSpec, WorkflowDefinition};
use thiserror::Error;

use super::dag::validate_step_graph;
use super::retry::{self, RetryPolicyError};
use super::scheduler::normalize_schedule;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure, including unknown step types.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Step graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references a step id that does not exist.
    #[error("unknown step reference: {0}")]
    UnknownStep(String),

    /// A retry policy violates its constraints.
    #[error("invalid retry policy{}: {source}", .step.as_deref().map(|s| format!(" on step '{s}'")).unwrap_or_default())]
    InvalidRetryPolicy {
        step: Option<String>,
        #[source]
        source: RetryPolicyError,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load and validate a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let yaml = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&yaml)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition before it is saved.
///
/// Checks:
/// - name is non-empty and the definition has at least one step
/// - step ids are unique and non-empty
/// - every retry policy satisfies its constraints
/// - condition branches reference existing steps
/// - loop guards and step timeouts are non-zero
/// - a schedule trigger carries a parseable cron expression
/// - the step graph is acyclic (a branch back to an earlier step is a cycle)
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    if let Some(policy) = &def.retry_policy {
        retry::validate(policy).map_err(|source| WorkflowError::InvalidRetryPolicy {
            step: None,
            source,
        })?;
    }

    for step in &def.steps {
        if let Some(policy) = &step.retry_policy {
            retry::validate(policy).map_err(|source| WorkflowError::InvalidRetryPolicy {
                step: Some(step.id.clone()),
                source,
            })?;
        }

        if step.timeout_ms == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }

        match &step.config {
            StepConfig::Condition {
                then_steps,
                else_steps,
                ..
            } => {
                for target in then_steps.iter().chain(else_steps) {
                    if !seen_ids.contains(target.as_str()) {
                        return Err(WorkflowError::UnknownStep(format!(
                            "condition step '{}' references unknown step '{}'",
                            step.id, target
                        )));
                    }
                }
            }
            StepConfig::Loop { max_iterations, .. } => {
                if *max_iterations == Some(0) {
                    return Err(WorkflowError::ValidationError(format!(
                        "loop step '{}' max_iterations must be >= 1",
                        step.id
                    )));
                }
            }
            StepConfig::Action { handler, .. } if handler.trim().is_empty() => {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' must name a handler",
                    step.id
                )));
            }
            _ => {}
        }
    }

    match &def.trigger {
        TriggerSpec::Schedule { cron, .. } => {
            normalize_schedule(cron)
                .map_err(|e| WorkflowError::ValidationError(e.to_string()))?;
        }
        TriggerSpec::Webhook { path } if !path.starts_with('/') => {
            return Err(WorkflowError::ValidationError(format!(
                "webhook path '{path}' must start with '/'"
            )));
        }
        _ => {}
    }

    validate_step_graph(&def.steps)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
