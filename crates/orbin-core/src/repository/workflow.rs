//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, runs, step
//! executions, and the inbound event log. The infrastructure layer
//! (orbin-infra) implements this trait with SQLite persistence.
//!
//! Status changes go through `compare_and_set_*`: the write only lands when
//! the stored record still matches what the caller read. A `false` return
//! means another writer got there first and the caller abandons its change.

use chrono::{DateTime, Utc};
use orbin_types::error::RepositoryError;
use orbin_types::event::EventRecord;
use orbin_types::run::{RunFilter, RunStatus, StepExecution, WorkflowRun};
use orbin_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use crate::workflow::step::StepVersion;

/// Result of inserting a run under an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunInsert {
    Created,
    /// A run already exists for this (workflow, key) within the window.
    Existing(Uuid),
}

/// Repository trait for workflow persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a definition version. `(id, version)` is never overwritten.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Latest version of a definition.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// A specific version of a definition.
    fn get_definition_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Latest version of every definition, optionally limited to one organization.
    fn list_definitions(
        &self,
        organization_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run. When the run carries an idempotency key and a run with
    /// the same (workflow, key) was created at or after `dedupe_since`, that
    /// run's id is returned instead and nothing is written.
    fn insert_run(
        &self,
        run: &WorkflowRun,
        dedupe_since: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<RunInsert, RepositoryError>> + Send;

    /// Get a run without its step executions.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Runs of one organization, newest first.
    fn list_runs(
        &self,
        organization_id: &Uuid,
        filter: &RunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Runs in `pending` or `running`, oldest first.
    fn list_active_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Overwrite a run's mutable fields if its stored status is still `expected`.
    fn compare_and_set_run(
        &self,
        run: &WorkflowRun,
        expected: RunStatus,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark a terminal run as counted toward organization usage. Returns
    /// `false` when the run was already counted or is not terminal.
    fn claim_usage(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Terminal runs not yet counted toward usage, oldest first.
    fn list_uncounted_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Insert a step execution. Fails with `RepositoryError::Conflict` when the
    /// run already has a record for this step id.
    fn insert_step(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// Step executions of a run in creation order.
    fn list_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    /// Overwrite a step's mutable fields if the stored record still matches
    /// `expected` (status, attempt, and loop iteration).
    fn compare_and_set_step(
        &self,
        step: &StepExecution,
        expected: StepVersion,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Non-terminal steps carrying a retry, resume, or timeout deadline.
    fn list_step_timers(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------------

    fn record_event(
        &self,
        event: &EventRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Most recent events of an organization, newest first.
    fn list_events(
        &self,
        organization_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<EventRecord>, RepositoryError>> + Send;

    /// Most recent event of `event_type` recorded for a workflow.
    fn latest_event(
        &self,
        workflow_id: &Uuid,
        event_type: &str,
    ) -> impl std::future::Future<Output = Result<Option<EventRecord>, RepositoryError>> + Send;
}
