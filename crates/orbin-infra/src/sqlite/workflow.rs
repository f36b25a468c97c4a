//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `orbin-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs, one row per
//! version. Runs and step executions are stored column by column so status
//! compare-and-set is a single `UPDATE ... WHERE status = ?` whose
//! `rows_affected()` decides the winner.

use chrono::{DateTime, SecondsFormat, Utc};
use orbin_core::repository::workflow::{RunInsert, WorkflowRepository};
use orbin_core::workflow::step::StepVersion;
use orbin_types::error::RepositoryError;
use orbin_types::event::{EventRecord, EventStatus};
use orbin_types::run::{
    RunError, RunFilter, RunStatus, StepError, StepExecution, StepStatus, WorkflowRun,
};
use orbin_types::workflow::{RetryPolicy, TriggerType, WorkflowDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRunRow {
    id: String,
    organization_id: String,
    workflow_id: String,
    workflow_version: i64,
    status: String,
    trigger_type: String,
    trigger_data: String,
    idempotency_key: Option<String>,
    result: Option<String>,
    error: Option<String>,
    default_retry_policy: String,
    deadline_at: Option<String>,
    replay_of: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    created_at: String,
}

impl WorkflowRunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            trigger_type: row.try_get("trigger_type")?,
            trigger_data: row.try_get("trigger_data")?,
            idempotency_key: row.try_get("idempotency_key")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            default_retry_policy: row.try_get("default_retry_policy")?,
            deadline_at: row.try_get("deadline_at")?,
            replay_of: row.try_get("replay_of")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            organization_id: parse_uuid(&self.organization_id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_version: to_u32(self.workflow_version, "workflow_version")?,
            status: self
                .status
                .parse::<RunStatus>()
                .map_err(RepositoryError::Query)?,
            trigger_type: self
                .trigger_type
                .parse::<TriggerType>()
                .map_err(RepositoryError::Query)?,
            trigger_data: from_json(&self.trigger_data, "trigger_data")?,
            idempotency_key: self.idempotency_key,
            result: opt_from_json(self.result.as_deref(), "result")?,
            error: opt_from_json::<RunError>(self.error.as_deref(), "run error")?,
            default_retry_policy: from_json::<RetryPolicy>(
                &self.default_retry_policy,
                "default_retry_policy",
            )?,
            deadline_at: opt_datetime(self.deadline_at.as_deref())?,
            replay_of: self.replay_of.as_deref().map(parse_uuid).transpose()?,
            started_at: opt_datetime(self.started_at.as_deref())?,
            completed_at: opt_datetime(self.completed_at.as_deref())?,
            duration_ms: self.duration_ms,
            created_at: parse_datetime(&self.created_at)?,
            steps: Vec::new(),
        })
    }
}

struct StepExecutionRow {
    id: String,
    run_id: String,
    organization_id: String,
    step_id: String,
    step_name: String,
    status: String,
    attempt: i64,
    iteration: i64,
    retry_policy: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    next_retry_at: Option<String>,
    resume_at: Option<String>,
    timeout_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    created_at: String,
}

impl StepExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            organization_id: row.try_get("organization_id")?,
            step_id: row.try_get("step_id")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            iteration: row.try_get("iteration")?,
            retry_policy: row.try_get("retry_policy")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            next_retry_at: row.try_get("next_retry_at")?,
            resume_at: row.try_get("resume_at")?,
            timeout_at: row.try_get("timeout_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_step(self) -> Result<StepExecution, RepositoryError> {
        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            organization_id: parse_uuid(&self.organization_id)?,
            step_id: self.step_id,
            step_name: self.step_name,
            status: self
                .status
                .parse::<StepStatus>()
                .map_err(RepositoryError::Query)?,
            attempt: to_u32(self.attempt, "attempt")?,
            iteration: to_u32(self.iteration, "iteration")?,
            retry_policy: from_json(&self.retry_policy, "retry_policy")?,
            input: opt_from_json(self.input.as_deref(), "step input")?,
            output: opt_from_json(self.output.as_deref(), "step output")?,
            error: opt_from_json::<StepError>(self.error.as_deref(), "step error")?,
            next_retry_at: opt_datetime(self.next_retry_at.as_deref())?,
            resume_at: opt_datetime(self.resume_at.as_deref())?,
            timeout_at: opt_datetime(self.timeout_at.as_deref())?,
            started_at: opt_datetime(self.started_at.as_deref())?,
            completed_at: opt_datetime(self.completed_at.as_deref())?,
            duration_ms: self.duration_ms,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct EventRow {
    id: String,
    organization_id: String,
    workflow_id: Option<String>,
    event_type: String,
    event_id: Option<String>,
    source: String,
    payload: String,
    status: String,
    run_id: Option<String>,
    error: Option<String>,
    processed_at: Option<String>,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            workflow_id: row.try_get("workflow_id")?,
            event_type: row.try_get("event_type")?,
            event_id: row.try_get("event_id")?,
            source: row.try_get("source")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            run_id: row.try_get("run_id")?,
            error: row.try_get("error")?,
            processed_at: row.try_get("processed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_event(self) -> Result<EventRecord, RepositoryError> {
        Ok(EventRecord {
            id: parse_uuid(&self.id)?,
            organization_id: parse_uuid(&self.organization_id)?,
            workflow_id: self.workflow_id.as_deref().map(parse_uuid).transpose()?,
            event_type: self.event_type,
            event_id: self.event_id,
            source: self.source,
            payload: from_json(&self.payload, "event payload")?,
            status: self
                .status
                .parse::<EventStatus>()
                .map_err(RepositoryError::Query)?,
            run_id: self.run_id.as_deref().map(parse_uuid).transpose()?,
            error: self.error,
            processed_at: opt_datetime(self.processed_at.as_deref())?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn opt_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

/// Fixed-width UTC timestamps sort lexicographically in time order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_u32(value: i64, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("{column} out of range: {value}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn opt_to_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

pub(crate) fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn opt_from_json<T: DeserializeOwned>(s: Option<&str>, what: &str) -> Result<Option<T>, RepositoryError> {
    s.map(|s| from_json(s, what)).transpose()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

const SELECT_LATEST_DEFINITION: &str = "SELECT v.definition FROM workflows w \
     JOIN workflow_versions v ON v.workflow_id = w.id AND v.version = w.latest_version";

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def)?;
        let now = format_datetime(&Utc::now());
        let id = def.id.to_string();

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO workflows (id, organization_id, name, status, latest_version, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 latest_version = MAX(latest_version, excluded.latest_version),
                 updated_at = excluded.updated_at"#,
        )
        .bind(&id)
        .bind(def.organization_id.to_string())
        .bind(&def.name)
        .bind(def.status.as_str())
        .bind(i64::from(def.version))
        .bind(format_datetime(&def.created_at))
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        sqlx::query(
            "INSERT INTO workflow_versions (workflow_id, version, definition, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(i64::from(def.version))
        .bind(&definition_json)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!(
                    "workflow {} version {} already exists",
                    def.id, def.version
                ))
            } else {
                query_err(e)
            }
        })?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_LATEST_DEFINITION} WHERE w.id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| {
            let json: String = row.try_get("definition").map_err(query_err)?;
            from_json(&json, "workflow definition")
        })
        .transpose()
    }

    async fn get_definition_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_versions WHERE workflow_id = ? AND version = ?",
        )
        .bind(id.to_string())
        .bind(i64::from(version))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|row| {
            let json: String = row.try_get("definition").map_err(query_err)?;
            from_json(&json, "workflow definition")
        })
        .transpose()
    }

    async fn list_definitions(
        &self,
        organization_id: Option<&Uuid>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = match organization_id {
            Some(org) => {
                sqlx::query(&format!(
                    "{SELECT_LATEST_DEFINITION} WHERE w.organization_id = ? ORDER BY w.name ASC"
                ))
                .bind(org.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!("{SELECT_LATEST_DEFINITION} ORDER BY w.name ASC"))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let json: String = row.try_get("definition").map_err(query_err)?;
            defs.push(from_json(&json, "workflow definition")?);
        }
        Ok(defs)
    }

    async fn insert_run(
        &self,
        run: &WorkflowRun,
        dedupe_since: DateTime<Utc>,
    ) -> Result<RunInsert, RepositoryError> {
        let workflow_id = run.workflow_id.to_string();
        let created_at = format_datetime(&run.created_at);

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        if let Some(key) = &run.idempotency_key {
            let existing: Option<(String, String)> = sqlx::query_as(
                "SELECT run_id, created_at FROM idempotency_keys WHERE workflow_id = ? AND key = ?",
            )
            .bind(&workflow_id)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;

            match existing {
                Some((run_id, seen_at)) if parse_datetime(&seen_at)? >= dedupe_since => {
                    return Ok(RunInsert::Existing(parse_uuid(&run_id)?));
                }
                _ => {}
            }

            sqlx::query(
                r#"INSERT INTO idempotency_keys (workflow_id, key, run_id, created_at)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT(workflow_id, key) DO UPDATE SET
                     run_id = excluded.run_id,
                     created_at = excluded.created_at"#,
            )
            .bind(&workflow_id)
            .bind(key)
            .bind(run.id.to_string())
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, organization_id, workflow_id, workflow_version, status, trigger_type,
                trigger_data, idempotency_key, result, error, default_retry_policy,
                deadline_at, replay_of, started_at, completed_at, duration_ms, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.organization_id.to_string())
        .bind(&workflow_id)
        .bind(i64::from(run.workflow_version))
        .bind(run.status.as_str())
        .bind(run.trigger_type.as_str())
        .bind(to_json(&run.trigger_data)?)
        .bind(&run.idempotency_key)
        .bind(opt_to_json(run.result.as_ref())?)
        .bind(opt_to_json(run.error.as_ref())?)
        .bind(to_json(&run.default_retry_policy)?)
        .bind(run.deadline_at.as_ref().map(format_datetime))
        .bind(run.replay_of.map(|id| id.to_string()))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(run.duration_ms)
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("run {} already exists", run.id))
            } else {
                query_err(e)
            }
        })?;

        tx.commit().await.map_err(query_err)?;
        Ok(RunInsert::Created)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| WorkflowRunRow::from_row(&row).map_err(query_err)?.into_run())
            .transpose()
    }

    async fn list_runs(
        &self,
        organization_id: &Uuid,
        filter: &RunFilter,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let status = filter.status.map(|s| s.as_str());
        let workflow_id = filter.workflow_id.map(|id| id.to_string());
        // SQLite treats a negative LIMIT as unbounded.
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs
               WHERE organization_id = ?
                 AND (? IS NULL OR status = ?)
                 AND (? IS NULL OR workflow_id = ?)
               ORDER BY created_at DESC, id DESC
               LIMIT ?"#,
        )
        .bind(organization_id.to_string())
        .bind(status)
        .bind(status)
        .bind(&workflow_id)
        .bind(&workflow_id)
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(WorkflowRunRow::from_row(row).map_err(query_err)?.into_run()?);
        }
        Ok(runs)
    }

    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status IN ('pending', 'running') ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(WorkflowRunRow::from_row(row).map_err(query_err)?.into_run()?);
        }
        Ok(runs)
    }

    async fn compare_and_set_run(
        &self,
        run: &WorkflowRun,
        expected: RunStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 status = ?, result = ?, error = ?, started_at = ?, completed_at = ?, duration_ms = ?
               WHERE id = ? AND status = ?"#,
        )
        .bind(run.status.as_str())
        .bind(opt_to_json(run.result.as_ref())?)
        .bind(opt_to_json(run.error.as_ref())?)
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(run.duration_ms)
        .bind(run.id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_usage(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET usage_counted = 1
               WHERE id = ? AND usage_counted = 0
                 AND status IN ('completed', 'failed', 'canceled', 'timed_out')"#,
        )
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_uncounted_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs
               WHERE usage_counted = 0
                 AND status IN ('completed', 'failed', 'canceled', 'timed_out')
               ORDER BY created_at ASC, id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(WorkflowRunRow::from_row(row).map_err(query_err)?.into_run()?);
        }
        Ok(runs)
    }

    async fn insert_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_executions
               (id, run_id, organization_id, step_id, step_name, status, attempt, iteration,
                retry_policy, input, output, error, next_retry_at, resume_at, timeout_at,
                started_at, completed_at, duration_ms, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.run_id.to_string())
        .bind(step.organization_id.to_string())
        .bind(&step.step_id)
        .bind(&step.step_name)
        .bind(step.status.as_str())
        .bind(i64::from(step.attempt))
        .bind(i64::from(step.iteration))
        .bind(to_json(&step.retry_policy)?)
        .bind(opt_to_json(step.input.as_ref())?)
        .bind(opt_to_json(step.output.as_ref())?)
        .bind(opt_to_json(step.error.as_ref())?)
        .bind(step.next_retry_at.as_ref().map(format_datetime))
        .bind(step.resume_at.as_ref().map(format_datetime))
        .bind(step.timeout_at.as_ref().map(format_datetime))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.duration_ms)
        .bind(format_datetime(&step.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!(
                    "run {} already has a record for step '{}'",
                    step.run_id, step.step_id
                ))
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn get_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM step_executions WHERE run_id = ? AND step_id = ?")
            .bind(run_id.to_string())
            .bind(step_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| StepExecutionRow::from_row(&row).map_err(query_err)?.into_step())
            .transpose()
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE run_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(StepExecutionRow::from_row(row).map_err(query_err)?.into_step()?);
        }
        Ok(steps)
    }

    async fn compare_and_set_step(
        &self,
        step: &StepExecution,
        expected: StepVersion,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE step_executions SET
                 status = ?, attempt = ?, iteration = ?, input = ?, output = ?, error = ?,
                 next_retry_at = ?, resume_at = ?, timeout_at = ?,
                 started_at = ?, completed_at = ?, duration_ms = ?
               WHERE run_id = ? AND step_id = ? AND status = ? AND attempt = ? AND iteration = ?"#,
        )
        .bind(step.status.as_str())
        .bind(i64::from(step.attempt))
        .bind(i64::from(step.iteration))
        .bind(opt_to_json(step.input.as_ref())?)
        .bind(opt_to_json(step.output.as_ref())?)
        .bind(opt_to_json(step.error.as_ref())?)
        .bind(step.next_retry_at.as_ref().map(format_datetime))
        .bind(step.resume_at.as_ref().map(format_datetime))
        .bind(step.timeout_at.as_ref().map(format_datetime))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.duration_ms)
        .bind(step.run_id.to_string())
        .bind(&step.step_id)
        .bind(expected.status.as_str())
        .bind(i64::from(expected.attempt))
        .bind(i64::from(expected.iteration))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_step_timers(&self) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM step_executions
               WHERE status IN ('pending', 'running', 'retrying')
                 AND (next_retry_at IS NOT NULL OR resume_at IS NOT NULL OR timeout_at IS NOT NULL)
               ORDER BY created_at ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(StepExecutionRow::from_row(row).map_err(query_err)?.into_step()?);
        }
        Ok(steps)
    }

    async fn record_event(&self, event: &EventRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO events
               (id, organization_id, workflow_id, event_type, event_id, source, payload,
                status, run_id, error, processed_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(event.organization_id.to_string())
        .bind(event.workflow_id.map(|id| id.to_string()))
        .bind(&event.event_type)
        .bind(&event.event_id)
        .bind(&event.source)
        .bind(to_json(&event.payload)?)
        .bind(event.status.as_str())
        .bind(event.run_id.map(|id| id.to_string()))
        .bind(&event.error)
        .bind(event.processed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&event.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn list_events(
        &self,
        organization_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE organization_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(organization_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(EventRow::from_row(row).map_err(query_err)?.into_event()?);
        }
        Ok(events)
    }

    async fn latest_event(
        &self,
        workflow_id: &Uuid,
        event_type: &str,
    ) -> Result<Option<EventRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT * FROM events WHERE workflow_id = ? AND event_type = ?
               ORDER BY created_at DESC, id DESC LIMIT 1"#,
        )
        .bind(workflow_id.to_string())
        .bind(event_type)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|row| EventRow::from_row(&row).map_err(query_err)?.into_event())
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
