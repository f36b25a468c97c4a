//! Internal event publishing and the delivery log.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use orbin_types::event::EventRecord;

use crate::http::error::AppError;
use crate::http::extractors::organization::OrganizationId;
use crate::http::extractors::query::EventListQuery;
use crate::http::response::{ApiResponse, RequestClock};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PublishEventBody {
    pub event_type: String,
    /// Deduplicates redelivery of the same event per listening workflow.
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct EventRouted {
    pub event_type: String,
    /// Runs created or matched, one per listening workflow.
    pub run_ids: Vec<Uuid>,
}

/// POST /api/v1/events - Start every active workflow listening for the type.
pub async fn publish_event(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Json(body): Json<PublishEventBody>,
) -> Result<Json<ApiResponse<EventRouted>>, AppError> {
    let clock = RequestClock::start();
    if body.event_type.trim().is_empty() {
        return Err(AppError::Validation("event_type must not be empty".to_string()));
    }

    let run_ids = state
        .ingestor
        .route_event(&org, &body.event_type, "api", body.event_id.as_deref(), body.payload)
        .await?;

    Ok(Json(clock.respond(EventRouted {
        event_type: body.event_type,
        run_ids,
    })))
}

/// GET /api/v1/events - Trigger delivery log, newest first.
pub async fn list_events(
    State(state): State<AppState>,
    OrganizationId(org): OrganizationId,
    Query(query): Query<EventListQuery>,
) -> Result<Json<ApiResponse<Vec<EventRecord>>>, AppError> {
    let clock = RequestClock::start();
    let events = state.ingestor.list_events(&org, query.limit).await?;
    Ok(Json(clock.respond(events).with_link("self", "/api/v1/events")))
}
