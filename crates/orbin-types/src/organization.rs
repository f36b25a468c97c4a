//! Organization settings consumed by the execution core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::RetryPolicy;

/// Per-organization settings and usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationSettings {
    pub organization_id: Uuid,
    /// Applied to steps with no step- or workflow-level override.
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
    /// Shared secret for HMAC verification of webhook deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// Finished runs, counted once each by usage accounting.
    #[serde(default)]
    pub current_executions: u64,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl OrganizationSettings {
    pub fn new(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            default_retry_policy: RetryPolicy::default(),
            webhook_secret: None,
            current_executions: 0,
            updated_at: Utc::now(),
        }
    }
}
