//! SQLite organization settings repository.

use chrono::Utc;
use orbin_core::repository::organization::OrganizationRepository;
use orbin_types::error::RepositoryError;
use orbin_types::organization::OrganizationSettings;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::workflow::{format_datetime, from_json, to_json};

pub struct SqliteOrganizationRepository {
    pool: DatabasePool,
}

impl SqliteOrganizationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

impl OrganizationRepository for SqliteOrganizationRepository {
    async fn get_settings(
        &self,
        organization_id: &Uuid,
    ) -> Result<Option<OrganizationSettings>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT default_retry_policy, webhook_secret, current_executions, updated_at
               FROM organization_settings WHERE organization_id = ?"#,
        )
        .bind(organization_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let policy: String = row.try_get("default_retry_policy").map_err(query_err)?;
        let executions: i64 = row.try_get("current_executions").map_err(query_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(query_err)?;

        Ok(Some(OrganizationSettings {
            organization_id: *organization_id,
            default_retry_policy: from_json(&policy, "default_retry_policy")?,
            webhook_secret: row.try_get("webhook_secret").map_err(query_err)?,
            current_executions: u64::try_from(executions).unwrap_or(0),
            updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))?,
        }))
    }

    async fn save_settings(&self, settings: &OrganizationSettings) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO organization_settings
               (organization_id, default_retry_policy, webhook_secret, current_executions, updated_at)
               VALUES (?, ?, ?, 0, ?)
               ON CONFLICT(organization_id) DO UPDATE SET
                 default_retry_policy = excluded.default_retry_policy,
                 webhook_secret = excluded.webhook_secret,
                 updated_at = excluded.updated_at"#,
        )
        .bind(settings.organization_id.to_string())
        .bind(to_json(&settings.default_retry_policy)?)
        .bind(&settings.webhook_secret)
        .bind(format_datetime(&settings.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn increment_usage(&self, organization_id: &Uuid, delta: u64) -> Result<(), RepositoryError> {
        let delta = i64::try_from(delta)
            .map_err(|_| RepositoryError::Query(format!("usage delta out of range: {delta}")))?;
        let defaults = OrganizationSettings::new(*organization_id);

        sqlx::query(
            r#"INSERT INTO organization_settings
               (organization_id, default_retry_policy, webhook_secret, current_executions, updated_at)
               VALUES (?, ?, NULL, ?, ?)
               ON CONFLICT(organization_id) DO UPDATE SET
                 current_executions = current_executions + excluded.current_executions,
                 updated_at = excluded.updated_at"#,
        )
        .bind(organization_id.to_string())
        .bind(to_json(&defaults.default_retry_policy)?)
        .bind(delta)
        .bind(format_datetime(&defaults.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }
}
