//! Trigger ingestion: turns inbound deliveries into run creation.
//!
//! Every trigger source (webhook receiver, cron tick, manual invocation,
//! internal event) funnels through [`TriggerIngestor::ingest`], which creates
//! the run under the delivery's event id and records the delivery in the
//! event log with its outcome.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orbin_types::event::{EventRecord, EventStatus};
use orbin_types::workflow::{TriggerSpec, TriggerType, WorkflowDefinition, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::{CreateRunOutcome, CreateRunRequest, EngineError, ExecutionEngine};
use crate::repository::organization::OrganizationRepository;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The workflow is not started by this kind of trigger.
    #[error("workflow {workflow_id} is triggered by {expected}, not {got}")]
    TriggerMismatch {
        workflow_id: Uuid,
        expected: TriggerType,
        got: TriggerType,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// TriggerEvent
// ---------------------------------------------------------------------------

/// One inbound delivery addressed to a workflow.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub organization_id: Uuid,
    pub workflow_id: Uuid,
    pub trigger_type: TriggerType,
    /// Where the delivery came from: webhook path, cron expression, CLI.
    pub source: String,
    /// Externally supplied delivery id. Used as the idempotency key.
    pub event_id: Option<String>,
    pub payload: Value,
    /// Event log type. Defaults to the trigger type's name.
    pub event_type: Option<String>,
    /// Wall-clock ceiling for the created run.
    pub timeout: Option<std::time::Duration>,
}

impl TriggerEvent {
    pub fn new(
        organization_id: Uuid,
        workflow_id: Uuid,
        trigger_type: TriggerType,
        source: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            organization_id,
            workflow_id,
            trigger_type,
            source: source.into(),
            event_id: None,
            payload,
            event_type: None,
            timeout: None,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// Idempotency key of a cron fire. Stable across restarts so a catch-up
/// fire and a live fire for the same instant collapse into one run.
pub fn schedule_event_id(workflow_id: &Uuid, fired_at: DateTime<Utc>) -> String {
    format!("schedule:{workflow_id}:{}", fired_at.timestamp())
}

// ---------------------------------------------------------------------------
// TriggerIngestor
// ---------------------------------------------------------------------------

pub struct TriggerIngestor<R: WorkflowRepository, O: OrganizationRepository> {
    engine: Arc<ExecutionEngine<R, O>>,
}

impl<R: WorkflowRepository, O: OrganizationRepository> Clone for TriggerIngestor<R, O> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<R: WorkflowRepository, O: OrganizationRepository> TriggerIngestor<R, O> {
    pub fn new(engine: Arc<ExecutionEngine<R, O>>) -> Self {
        Self { engine }
    }

    /// Create a run for a delivery and log it.
    ///
    /// A manual trigger may start any workflow; other kinds must match the
    /// workflow's trigger. A repeated event id within the retention window
    /// returns the existing run.
    pub async fn ingest(&self, event: TriggerEvent) -> Result<CreateRunOutcome, TriggerError> {
        let result = self.create(&event).await;

        let (status, run_id, error) = match &result {
            Ok(outcome) => (EventStatus::Processed, Some(outcome.run_id()), None),
            Err(e) => (EventStatus::Failed, None, Some(e.to_string())),
        };
        let now = Utc::now();
        let record = EventRecord {
            id: Uuid::now_v7(),
            organization_id: event.organization_id,
            workflow_id: Some(event.workflow_id),
            event_type: event
                .event_type
                .clone()
                .unwrap_or_else(|| event.trigger_type.as_str().to_string()),
            event_id: event.event_id.clone(),
            source: event.source.clone(),
            payload: event.payload.clone(),
            status,
            run_id,
            error,
            processed_at: Some(now),
            created_at: now,
        };
        if let Err(e) = self.engine.workflows().record_event(&record).await {
            tracing::warn!(workflow_id = %event.workflow_id, error = %e, "failed to record event");
        }

        match &result {
            Ok(outcome) => tracing::info!(
                workflow_id = %event.workflow_id,
                trigger = %event.trigger_type,
                run_id = %outcome.run_id(),
                duplicate = matches!(outcome, CreateRunOutcome::Duplicate(_)),
                "trigger ingested"
            ),
            Err(e) => tracing::warn!(
                workflow_id = %event.workflow_id,
                trigger = %event.trigger_type,
                error = %e,
                "trigger rejected"
            ),
        }
        result
    }

    async fn create(&self, event: &TriggerEvent) -> Result<CreateRunOutcome, TriggerError> {
        let def = self
            .engine
            .get_workflow(&event.organization_id, &event.workflow_id)
            .await?;
        let expected = def.trigger.trigger_type();
        if event.trigger_type != TriggerType::Manual && event.trigger_type != expected {
            return Err(TriggerError::TriggerMismatch {
                workflow_id: def.id,
                expected,
                got: event.trigger_type,
            });
        }

        let mut req = CreateRunRequest::new(
            event.organization_id,
            event.workflow_id,
            event.trigger_type,
            event.payload.clone(),
        );
        req.idempotency_key = event.event_id.clone();
        req.timeout = event.timeout;
        Ok(self.engine.create_run(req).await?)
    }

    /// Start every active workflow of the organization listening for
    /// `event_type`. Returns the runs created or matched.
    pub async fn route_event(
        &self,
        organization_id: &Uuid,
        event_type: &str,
        source: &str,
        event_id: Option<&str>,
        payload: Value,
    ) -> Result<Vec<Uuid>, TriggerError> {
        let listeners: Vec<WorkflowDefinition> = self
            .engine
            .list_workflows(Some(organization_id))
            .await?
            .into_iter()
            .filter(|def| def.status == WorkflowStatus::Active)
            .filter(|def| {
                matches!(&def.trigger, TriggerSpec::Event { event_type: t } if t == event_type)
            })
            .collect();

        let mut run_ids = Vec::with_capacity(listeners.len());
        for def in listeners {
            let mut event = TriggerEvent::new(
                *organization_id,
                def.id,
                TriggerType::Event,
                source,
                payload.clone(),
            );
            event.event_type = Some(event_type.to_string());
            event.event_id = event_id.map(str::to_string);

            match self.ingest(event).await {
                Ok(outcome) => run_ids.push(outcome.run_id()),
                Err(e) => {
                    tracing::warn!(workflow_id = %def.id, %event_type, error = %e, "event listener failed")
                }
            }
        }
        Ok(run_ids)
    }

    /// Handle one cron fire for a workflow.
    pub async fn fire_schedule(
        &self,
        workflow_id: &Uuid,
        fired_at: DateTime<Utc>,
    ) -> Result<CreateRunOutcome, TriggerError> {
        let def = self
            .engine
            .workflows()
            .get_definition(workflow_id)
            .await
            .map_err(EngineError::from)?
            .ok_or(EngineError::WorkflowNotFound(*workflow_id))?;
        let source = match &def.trigger {
            TriggerSpec::Schedule { cron, .. } => cron.clone(),
            _ => "schedule".to_string(),
        };

        let event = TriggerEvent::new(
            def.organization_id,
            def.id,
            TriggerType::Schedule,
            source,
            serde_json::json!({ "scheduled_at": fired_at.to_rfc3339() }),
        )
        .with_event_id(schedule_event_id(&def.id, fired_at));
        self.ingest(event).await
    }

    /// When a workflow's schedule last fired, from the event log.
    pub async fn last_schedule_fire(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let latest = self
            .engine
            .workflows()
            .latest_event(workflow_id, TriggerType::Schedule.as_str())
            .await
            .map_err(EngineError::from)?;
        Ok(latest.map(|record| {
            record
                .payload
                .get("scheduled_at")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(record.created_at)
        }))
    }

    /// Last fire time of every scheduled workflow in `defs` that has fired
    /// before. Feeds missed-run catch-up.
    pub async fn schedule_baseline(
        &self,
        defs: &[WorkflowDefinition],
    ) -> Result<HashMap<Uuid, DateTime<Utc>>, TriggerError> {
        let mut baseline = HashMap::new();
        for def in defs {
            if def.trigger.trigger_type() != TriggerType::Schedule {
                continue;
            }
            if let Some(at) = self.last_schedule_fire(&def.id).await? {
                baseline.insert(def.id, at);
            }
        }
        Ok(baseline)
    }

    pub async fn list_events(
        &self,
        organization_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<EventRecord>, TriggerError> {
        Ok(self
            .engine
            .workflows()
            .list_events(organization_id, limit)
            .await
            .map_err(EngineError::from)?)
    }
}
