//! Workflow definition and manual trigger handlers.

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use orbin_core::engine::CreateRunOutcome;
use orbin_core::trigger::TriggerEvent;
use orbin_types::workflow::{TriggerType, WorkflowDefinition, WorkflowStatus};

use crate::http::error::AppError;
use crate::http::extractors::organization::OrganizationId;
use crate::http::response::{ApiResponse, RequestClock};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SetStatusBody {
    pub status: WorkflowStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRunBody {
    /// Handed to the first step as its input.
    #[serde(default)]
    pub trigger_data: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Wall-clock ceiling for the run.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RunCreated {
    pub run_id: Uuid,
    /// The idempotency key matched an existing run.
    pub duplicate: bool,
}

impl From<CreateRunOutcome> for RunCreated {
    fn from(outcome: CreateRunOutcome) -> Self {
        Self {
            run_id: outcome.run_id(),
            duplicate: matches!(outcome, CreateRunOutcome::Duplicate(_)),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows - Save a definition as its next version.
pub async fn save_workflow(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Json(mut body): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let clock = RequestClock::start();
    body.organization_id = org;

    let saved = state.engine.save_workflow(body).await?;
    state.webhooks.refresh(&saved);

    let link = format!("/api/v1/workflows/{}", saved.id);
    Ok(Json(clock.respond(saved).with_link("self", &link)))
}

/// GET /api/v1/workflows - Latest version of every workflow of the organization.
pub async fn list_workflows(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
) -> Result<Json<ApiResponse<Vec<WorkflowDefinition>>>, AppError> {
    let clock = RequestClock::start();
    let defs = state.engine.list_workflows(Some(&org)).await?;
    Ok(Json(clock.respond(defs).with_link("self", "/api/v1/workflows")))
}

/// GET /api/v1/workflows/{id}
pub async fn get_workflow(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let clock = RequestClock::start();
    let def = state.engine.get_workflow(&org, &id).await?;

    Ok(Json(
        clock
            .respond(def)
            .with_link("self", &format!("/api/v1/workflows/{id}"))
            .with_link("runs", &format!("/api/v1/runs?workflow_id={id}")),
    ))
}

/// PUT /api/v1/workflows/{id}/status - Activate, pause, or archive.
pub async fn set_workflow_status(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Path(id): Path<Uuid>,
    Json(body): Json<SetStatusBody>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let clock = RequestClock::start();
    let def = state.engine.set_workflow_status(&org, &id, body.status).await?;
    state.webhooks.refresh(&def);
    Ok(Json(clock.respond(def)))
}

/// POST /api/v1/workflows/{id}/runs - Start a run manually.
pub async fn trigger_workflow(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Path(id): Path<Uuid>,
    body: Option<Json<TriggerRunBody>>,
) -> Result<Json<ApiResponse<RunCreated>>, AppError> {
    let clock = RequestClock::start();
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let mut event = TriggerEvent::new(org, id, TriggerType::Manual, "api", body.trigger_data);
    event.event_id = body.idempotency_key;
    event.timeout = body.timeout_ms.map(std::time::Duration::from_millis);

    let created = RunCreated::from(state.ingestor.ingest(event).await?);
    let link = format!("/api/v1/runs/{}", created.run_id);
    Ok(Json(clock.respond(created).with_link("run", &link)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use orbin_core::workflow::definition::parse_workflow_yaml;

    pub(crate) fn order_sync(org: Uuid) -> WorkflowDefinition {
        let mut def = parse_workflow_yaml(
            r#"
name: order-sync
status: active
trigger:
  type: webhook
  path: orders
steps:
  - id: fetch
    name: Fetch order
    config: { type: action, handler: echo }
  - id: push
    name: Push order
    config: { type: action, handler: set, params: { value: pushed } }
"#,
        )
        .unwrap();
        def.organization_id = org;
        def
    }

    #[tokio::test]
    async fn test_save_then_get_workflow() {
        let state = test_state().await;
        let org = Uuid::now_v7();

        let Json(saved) = save_workflow(State(state.clone()), OrganizationId(org), Json(order_sync(org)))
            .await
            .unwrap();
        let saved = saved.data.unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(state.webhooks.lookup("/orders").unwrap().workflow_id, saved.id);

        let Json(fetched) = get_workflow(State(state.clone()), OrganizationId(org), Path(saved.id))
            .await
            .unwrap();
        assert_eq!(fetched.data.unwrap().name, "order-sync");

        let other_org = get_workflow(State(state), OrganizationId(Uuid::now_v7()), Path(saved.id)).await;
        assert!(matches!(other_org, Err(AppError::Engine(_))));
    }

    #[tokio::test]
    async fn test_trigger_workflow_dedupes_by_key() {
        let state = test_state().await;
        let org = Uuid::now_v7();
        let def = state.engine.save_workflow(order_sync(org)).await.unwrap();

        let body = || TriggerRunBody {
            trigger_data: serde_json::json!({"order": 7}),
            idempotency_key: Some("evt_7".to_string()),
            timeout_ms: Some(60_000),
        };
        let Json(first) = trigger_workflow(State(state.clone()), OrganizationId(org), Path(def.id), Some(Json(body())))
            .await
            .unwrap();
        let Json(second) = trigger_workflow(State(state.clone()), OrganizationId(org), Path(def.id), Some(Json(body())))
            .await
            .unwrap();

        let first = first.data.unwrap();
        let second = second.data.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.run_id, second.run_id);

        let run = state.engine.get_run(&first.run_id).await.unwrap();
        assert!(run.deadline_at.is_some());
        assert_eq!(run.trigger_type, TriggerType::Manual);
    }

    #[tokio::test]
    async fn test_paused_workflow_rejects_trigger() {
        let state = test_state().await;
        let org = Uuid::now_v7();
        let def = state.engine.save_workflow(order_sync(org)).await.unwrap();

        let Json(paused) = set_workflow_status(
            State(state.clone()),
            OrganizationId(org),
            Path(def.id),
            Json(SetStatusBody {
                status: WorkflowStatus::Paused,
            }),
        )
        .await
        .unwrap();
        assert_eq!(paused.data.unwrap().version, 2);
        assert!(state.webhooks.is_empty());

        let err = trigger_workflow(State(state), OrganizationId(org), Path(def.id), None)
            .await
            .unwrap_err();
        assert_eq!(err.parts().1, "WORKFLOW_NOT_ACTIVE");
    }
}
