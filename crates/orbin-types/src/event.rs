//! Execution events and the inbound event log.
//!
//! `ExecutionEvent` is published on the core's event bus whenever the engine
//! changes run or step state. Workers subscribe to `StepDispatched` and usage
//! accounting subscribes to `RunFinished`.
//!
//! `EventRecord` is the persisted log of inbound trigger deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;
use crate::workflow::{StepType, TriggerType};

/// Work handed to a step handler for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepWork {
    pub run_id: Uuid,
    pub organization_id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub step_type: StepType,
    pub attempt: u32,
    pub iteration: u32,
    pub handler: String,
    pub params: serde_json::Value,
    pub input: serde_json::Value,
}

/// State change notifications emitted by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunCreated {
        run_id: Uuid,
        organization_id: Uuid,
        workflow_id: Uuid,
        trigger_type: TriggerType,
    },
    StepDispatched(StepWork),
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        will_retry: bool,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
    },
    /// A run reached a terminal state. Drives usage accounting.
    RunFinished {
        run_id: Uuid,
        organization_id: Uuid,
        workflow_id: Uuid,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },
}

impl ExecutionEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
            Self::StepDispatched(work) => work.run_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound event log
// ---------------------------------------------------------------------------

/// Processing status of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid event status: '{other}'")),
        }
    }
}

/// One inbound trigger delivery as recorded in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    /// e.g. `webhook`, `schedule`, `manual`, or an internal event type.
    pub event_type: String,
    /// Externally supplied delivery id, used as the idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub source: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: EventStatus,
    /// Run created (or matched) for this delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
