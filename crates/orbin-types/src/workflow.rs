//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the versioned, organization-owned description of
//! a workflow: an ordered list of steps plus the trigger that starts it. Every
//! save produces a new version; runs pin the version they were created from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow definition at a specific version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Owning organization.
    #[serde(default)]
    pub organization_id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lifecycle status. Only `active` workflows accept triggers.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Monotonically increasing version, assigned by the engine on save.
    #[serde(default)]
    pub version: u32,
    /// How runs of this workflow are started.
    pub trigger: TriggerSpec,
    /// Steps in execution order.
    pub steps: Vec<StepSpec>,
    /// Workflow-wide retry policy, used when a step has no override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Position of a step in definition order.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step Spec
// ---------------------------------------------------------------------------

/// A single step in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Stable step id, unique within a definition.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Step-kind specific configuration.
    pub config: StepConfig,
    /// Overrides the workflow and organization default retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// When set, a terminal failure of this step does not fail the run.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_failure: bool,
    /// Execution timeout for a single attempt. Exceeding it is fatal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepSpec {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }
}

/// The kind of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Action,
    Condition,
    Loop,
    Delay,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Delay => "delay",
        }
    }
}

/// Step-specific configuration.
///
/// Internally tagged by `type`:
/// ```yaml
/// config:
///   type: action
///   handler: http.post
///   params:
///     url: https://example.com/hook
/// ```
/// `params` is handed to the step handler untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Invoke a handler and record its output.
    Action {
        handler: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Invoke a handler whose boolean output selects a branch. Steps in the
    /// branch not taken are skipped.
    Condition {
        handler: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        then_steps: Vec<String>,
        #[serde(default)]
        else_steps: Vec<String>,
    },
    /// Invoke a handler repeatedly while its output carries `continue: true`.
    Loop {
        handler: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Wait, then complete with no output.
    Delay { duration_ms: u64 },
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Action { .. } => StepType::Action,
            Self::Condition { .. } => StepType::Condition,
            Self::Loop { .. } => StepType::Loop,
            Self::Delay { .. } => StepType::Delay,
        }
    }

    /// Handler name for step kinds executed by a worker. `None` for delays.
    pub fn handler(&self) -> Option<&str> {
        match self {
            Self::Action { handler, .. }
            | Self::Condition { handler, .. }
            | Self::Loop { handler, .. } => Some(handler),
            Self::Delay { .. } => None,
        }
    }

    pub fn params(&self) -> &serde_json::Value {
        match self {
            Self::Action { params, .. }
            | Self::Condition { params, .. }
            | Self::Loop { params, .. } => params,
            Self::Delay { .. } => &serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Attempt budget and exponential backoff parameters.
///
/// Field aliases accept the camelCase form stored in organization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_coefficient", alias = "backoffCoefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_initial_interval_ms", alias = "initialInterval")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms", alias = "maxInterval")]
    pub max_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_coefficient: default_backoff_coefficient(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger Spec
// ---------------------------------------------------------------------------

/// How a workflow is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Started from the CLI or API.
    Manual {},
    /// Started by an inbound HTTP delivery on `path`.
    Webhook { path: String },
    /// Started by a cron schedule.
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Started by an internal event of the given type.
    Event { event_type: String },
}

impl TriggerSpec {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Manual {} => TriggerType::Manual,
            Self::Webhook { .. } => TriggerType::Webhook,
            Self::Schedule { .. } => TriggerType::Schedule,
            Self::Event { .. } => TriggerType::Event,
        }
    }
}

/// The source that produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Schedule,
    Event,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Event => "event",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "webhook" => Ok(Self::Webhook),
            "schedule" => Ok(Self::Schedule),
            "event" => Ok(Self::Event),
            other => Err(format!("invalid trigger type: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_SYNC_YAML: &str = r#"
name: order-sync
status: active
trigger:
  type: webhook
  path: /hooks/orders
steps:
  - id: fetch
    name: Fetch order
    config:
      type: action
      handler: http.get
      params:
        url: https://shop.example.com/orders
  - id: is-large
    name: Large order?
    config:
      type: condition
      handler: order.is_large
      then_steps: [notify]
  - id: notify
    name: Notify sales
    continue_on_failure: true
    retry_policy:
      max_attempts: 5
    config:
      type: action
      handler: slack.post
  - id: cooldown
    name: Cool down
    config:
      type: delay
      duration_ms: 500
"#;

    #[test]
    fn test_parse_definition_from_yaml() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_SYNC_YAML).unwrap();
        assert_eq!(def.name, "order-sync");
        assert_eq!(def.status, WorkflowStatus::Active);
        assert_eq!(def.version, 0);
        assert_eq!(def.steps.len(), 4);
        assert_eq!(
            def.trigger,
            TriggerSpec::Webhook {
                path: "/hooks/orders".to_string()
            }
        );

        let fetch = def.step("fetch").unwrap();
        assert_eq!(fetch.step_type(), StepType::Action);
        assert_eq!(fetch.config.handler(), Some("http.get"));
        assert_eq!(
            fetch.config.params(),
            &json!({"url": "https://shop.example.com/orders"})
        );

        let notify = def.step("notify").unwrap();
        assert!(notify.continue_on_failure);
        let policy = notify.retry_policy.unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval_ms, 1_000);

        assert_eq!(def.step_index("cooldown"), Some(3));
        assert_eq!(def.step("cooldown").unwrap().config.handler(), None);
    }

    #[test]
    fn test_unknown_step_type_is_rejected() {
        let yaml = r#"
name: bad
trigger: { type: manual }
steps:
  - id: a
    name: A
    config: { type: teleport }
"#;
        let result: Result<WorkflowDefinition, _> = serde_yaml_ng::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!((policy.backoff_coefficient - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.initial_interval_ms, 1_000);
        assert_eq!(policy.max_interval_ms, 60_000);
    }

    #[test]
    fn test_retry_policy_accepts_camel_case() {
        let policy: RetryPolicy = serde_json::from_value(json!({
            "maxAttempts": 4,
            "backoffCoefficient": 1.5,
            "initialInterval": 250,
            "maxInterval": 10000
        }))
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_interval_ms, 250);
        assert_eq!(policy.max_interval_ms, 10_000);
    }

    #[test]
    fn test_step_config_serializes_with_type_tag() {
        let config = StepConfig::Delay { duration_ms: 30 };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value, json!({"type": "delay", "duration_ms": 30}));
    }

    #[test]
    fn test_trigger_type_names() {
        let spec = TriggerSpec::Schedule {
            cron: "0 9 * * *".to_string(),
            timezone: None,
        };
        assert_eq!(spec.trigger_type(), TriggerType::Schedule);
        assert_eq!(TriggerType::Webhook.to_string(), "webhook");
    }
}
