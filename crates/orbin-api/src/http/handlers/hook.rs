//! Inbound webhook receiver.
//!
//! Deliveries are routed by path to the workflow that registered it. When the
//! owning organization has a webhook secret, the body must carry a valid
//! `X-Orbin-Signature: sha256=<hex>` HMAC. `X-Orbin-Delivery` deduplicates
//! redelivered payloads.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::Value;

use orbin_core::trigger::TriggerEvent;
use orbin_infra::workflow::webhook_handler::{DELIVERY_ID_HEADER, SIGNATURE_HEADER, verify_delivery};
use orbin_types::workflow::TriggerType;

use crate::http::error::AppError;
use crate::http::handlers::workflow::RunCreated;
use crate::http::response::{ApiResponse, RequestClock};
use crate::state::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /hooks/{*path}
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<RunCreated>>, AppError> {
    let clock = RequestClock::start();
    let route = state.webhooks.lookup(&path)?;

    let settings = state.engine.organization_settings(&route.organization_id).await?;
    if let Err(e) = verify_delivery(
        settings.webhook_secret.as_deref(),
        &body,
        header_str(&headers, SIGNATURE_HEADER),
    ) {
        tracing::warn!(%path, workflow_id = %route.workflow_id, error = %e, "webhook rejected");
        return Err(e.into());
    }

    // Non-JSON bodies are kept as a string so the run still sees them.
    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };

    let mut event = TriggerEvent::new(
        route.organization_id,
        route.workflow_id,
        TriggerType::Webhook,
        format!("/{}", path.trim_start_matches('/')),
        payload,
    );
    event.event_id = header_str(&headers, DELIVERY_ID_HEADER).map(str::to_string);

    tracing::info!(%path, workflow = %route.workflow_name, "webhook delivery");
    let created = RunCreated::from(state.ingestor.ingest(event).await?);
    let link = format!("/api/v1/runs/{}", created.run_id);
    Ok(Json(clock.respond(created).with_link("run", &link)))
}
