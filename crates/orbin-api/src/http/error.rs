//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use orbin_core::engine::EngineError;
use orbin_core::trigger::TriggerError;
use orbin_infra::workflow::webhook_handler::WebhookError;
use orbin_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    Trigger(TriggerError),
    Webhook(WebhookError),
    /// Malformed request input.
    Validation(String),
    /// A resource exists but belongs to another organization, or is absent.
    NotFound(String),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<TriggerError> for AppError {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::Engine(inner) => AppError::Engine(inner),
            other => AppError::Trigger(other),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(e: WebhookError) -> Self {
        AppError::Webhook(e)
    }
}

impl AppError {
    /// Status, machine-readable code, and message for this error.
    pub fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Engine(e) => engine_parts(e),
            AppError::Trigger(e @ TriggerError::TriggerMismatch { .. }) => {
                (StatusCode::BAD_REQUEST, "TRIGGER_MISMATCH", e.to_string())
            }
            AppError::Trigger(TriggerError::Engine(e)) => engine_parts(e),
            AppError::Webhook(e @ WebhookError::PathNotFound(_)) => {
                (StatusCode::NOT_FOUND, "WEBHOOK_NOT_FOUND", e.to_string())
            }
            AppError::Webhook(
                e @ (WebhookError::HmacVerificationFailed | WebhookError::MissingSignature),
            ) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", e.to_string()),
            AppError::Webhook(e) => (StatusCode::INTERNAL_SERVER_ERROR, "WEBHOOK_ERROR", e.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        }
    }
}

fn engine_parts(e: &EngineError) -> (StatusCode, &'static str, String) {
    let (status, code) = match e {
        EngineError::WorkflowNotFound(_) => (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND"),
        EngineError::VersionNotFound { .. } => (StatusCode::NOT_FOUND, "VERSION_NOT_FOUND"),
        EngineError::RunNotFound(_) => (StatusCode::NOT_FOUND, "RUN_NOT_FOUND"),
        EngineError::StepNotFound { .. } => (StatusCode::NOT_FOUND, "STEP_NOT_FOUND"),
        EngineError::WorkflowNotActive { .. } => (StatusCode::CONFLICT, "WORKFLOW_NOT_ACTIVE"),
        EngineError::DuplicateDispatch { .. } => (StatusCode::CONFLICT, "DUPLICATE_DISPATCH"),
        EngineError::Contended(_) => (StatusCode::CONFLICT, "CONFLICT"),
        EngineError::IllegalTransition(_) => (StatusCode::CONFLICT, "ILLEGAL_TRANSITION"),
        EngineError::InvalidRequest(_)
        | EngineError::InvalidDefinition(_)
        | EngineError::InvalidRetryPolicy(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        EngineError::Repository(RepositoryError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
        EngineError::Repository(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    };
    (status, code, e.to_string())
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(%code, %message, "request failed");
        } else {
            tracing::debug!(%code, %message, "request rejected");
        }
        (status, Json(ApiResponse::error(code, &message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbin_types::error::TransitionError;
    use orbin_types::workflow::{TriggerType, WorkflowStatus};
    use uuid::Uuid;

    #[test]
    fn test_engine_error_status_codes() {
        let id = Uuid::now_v7();
        let cases = [
            (EngineError::RunNotFound(id), StatusCode::NOT_FOUND, "RUN_NOT_FOUND"),
            (
                EngineError::WorkflowNotActive {
                    id,
                    status: WorkflowStatus::Paused,
                },
                StatusCode::CONFLICT,
                "WORKFLOW_NOT_ACTIVE",
            ),
            (
                EngineError::IllegalTransition(TransitionError::illegal("run", "completed", "canceled")),
                StatusCode::CONFLICT,
                "ILLEGAL_TRANSITION",
            ),
            (
                EngineError::InvalidRequest("bad".to_string()),
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
            ),
            (
                EngineError::Repository(RepositoryError::Query("disk".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
            ),
        ];

        for (err, status, code) in cases {
            let (got_status, got_code, _) = AppError::from(err).parts();
            assert_eq!(got_status, status);
            assert_eq!(got_code, code);
        }
    }

    #[test]
    fn test_trigger_error_unwraps_engine_error() {
        let err = AppError::from(TriggerError::Engine(EngineError::WorkflowNotFound(Uuid::now_v7())));
        assert!(matches!(err, AppError::Engine(EngineError::WorkflowNotFound(_))));

        let mismatch = AppError::from(TriggerError::TriggerMismatch {
            workflow_id: Uuid::now_v7(),
            expected: TriggerType::Schedule,
            got: TriggerType::Webhook,
        });
        assert_eq!(mismatch.parts().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_webhook_errors_are_unauthorized() {
        let (status, _, _) = AppError::from(WebhookError::MissingSignature).parts();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = AppError::from(WebhookError::PathNotFound("/x".to_string())).parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
