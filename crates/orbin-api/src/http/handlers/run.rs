//! Run inspection, control, and external step result handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orbin_core::engine::{EngineError, ReportOutcome};
use orbin_types::run::{RunStatus, StepOutcome, WorkflowRun};

use crate::http::error::AppError;
use crate::http::extractors::organization::OrganizationId;
use crate::http::extractors::query::RunListQuery;
use crate::http::response::{ApiResponse, RequestClock};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StepResultBody {
    /// The attempt this result belongs to.
    pub attempt: u32,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Serialize)]
pub struct StepResultAck {
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    /// `applied`, `duplicate`, `stale`, or `discarded`.
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub status: RunStatus,
}

#[derive(Debug, Serialize)]
pub struct ReplayCreated {
    pub run_id: Uuid,
    pub replay_of: Uuid,
}

fn report_label(outcome: ReportOutcome) -> &'static str {
    match outcome {
        ReportOutcome::Applied => "applied",
        ReportOutcome::Duplicate => "duplicate",
        ReportOutcome::Stale => "stale",
        ReportOutcome::Discarded => "discarded",
    }
}

/// Load a run and hide it from other organizations.
async fn owned_run(state: &AppState, org: &Uuid, run_id: &Uuid) -> Result<WorkflowRun, AppError> {
    match state.engine.get_run(run_id).await {
        Ok(run) if run.organization_id == *org => Ok(run),
        Ok(_) => Err(AppError::Engine(EngineError::RunNotFound(*run_id))),
        Err(e) => Err(e.into()),
    }
}

/// GET /api/v1/runs - Runs of the organization, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Query(query): Query<RunListQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowRun>>>, AppError> {
    let clock = RequestClock::start();
    let filter = query.into_filter()?;
    let runs = state.engine.list_runs(&org, &filter).await?;
    Ok(Json(clock.respond(runs).with_link("self", "/api/v1/runs")))
}

/// GET /api/v1/runs/{id} - A run with its step executions.
pub async fn get_run(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let clock = RequestClock::start();
    let run = owned_run(&state, &org, &id).await?;
    let workflow_link = format!("/api/v1/workflows/{}", run.workflow_id);

    Ok(Json(
        clock
            .respond(run)
            .with_link("self", &format!("/api/v1/runs/{id}"))
            .with_link("workflow", &workflow_link),
    ))
}

/// POST /api/v1/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<RunStatusView>>, AppError> {
    let clock = RequestClock::start();
    owned_run(&state, &org, &id).await?;
    state.engine.cancel_run(&id).await?;

    let run = state.engine.get_run(&id).await?;
    Ok(Json(clock.respond(RunStatusView {
        run_id: id,
        status: run.status,
    })))
}

/// POST /api/v1/runs/{id}/replay - New run of the pinned version with the
/// same trigger data.
pub async fn replay_run(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ReplayCreated>>, AppError> {
    let clock = RequestClock::start();
    owned_run(&state, &org, &id).await?;
    let run_id = state.engine.replay_run(&id).await?;

    let link = format!("/api/v1/runs/{run_id}");
    Ok(Json(
        clock
            .respond(ReplayCreated { run_id, replay_of: id })
            .with_link("run", &link),
    ))
}

/// POST /api/v1/runs/{id}/steps/{step_id}/result - Report the outcome of a
/// step attempt executed outside this process.
pub async fn report_step_result(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Path((id, step_id)): Path<(Uuid, String)>,
    Json(body): Json<StepResultBody>,
) -> Result<Json<ApiResponse<StepResultAck>>, AppError> {
    let clock = RequestClock::start();
    owned_run(&state, &org, &id).await?;

    let outcome = state
        .engine
        .report_step_result(&id, &step_id, body.attempt, body.outcome)
        .await?;

    Ok(Json(clock.respond(StepResultAck {
        run_id: id,
        step_id,
        attempt: body.attempt,
        outcome: report_label(outcome),
    })))
}
