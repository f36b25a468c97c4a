//! Query parameter extractors for list endpoints.

use orbin_types::run::{RunFilter, RunStatus};
use serde::Deserialize;
use uuid::Uuid;

use crate::http::error::AppError;

/// Query parameters for `GET /runs`.
#[derive(Debug, Deserialize)]
pub struct RunListQuery {
    /// pending, running, completed, failed, canceled, timed_out.
    pub status: Option<String>,
    pub workflow_id: Option<Uuid>,
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    50
}

impl Default for RunListQuery {
    fn default() -> Self {
        Self {
            status: None,
            workflow_id: None,
            limit: default_run_limit(),
        }
    }
}

impl RunListQuery {
    pub fn into_filter(self) -> Result<RunFilter, AppError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<RunStatus>)
            .transpose()
            .map_err(AppError::Validation)?;
        Ok(RunFilter {
            status,
            workflow_id: self.workflow_id,
            limit: Some(self.limit),
        })
    }
}

/// Query parameters for `GET /events`.
#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    #[serde(default = "default_event_limit")]
    pub limit: u32,
}

fn default_event_limit() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_list_query_into_filter() {
        let query = RunListQuery {
            status: Some("timed_out".to_string()),
            workflow_id: None,
            limit: 5,
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.status, Some(RunStatus::TimedOut));
        assert_eq!(filter.limit, Some(5));

        let bad = RunListQuery {
            status: Some("sleeping".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad.into_filter(), Err(AppError::Validation(_))));
    }
}
