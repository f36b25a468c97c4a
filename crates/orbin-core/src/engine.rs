//! Execution engine: the run/step driver behind every external operation.
//!
//! The engine owns no long-lived run state. Every operation reads the
//! current records, computes the next transition with the pure state
//! machines in [`crate::workflow`], and persists it with a compare-and-set.
//! A lost compare-and-set means another caller already moved the record, so
//! the engine drops its own change and lets the winner's pass continue.
//!
//! Timers (retry, delay resume, step timeout, run deadline) live in an
//! in-process min-heap. [`ExecutionEngine::tick`] pops the due entries and
//! advances their runs. The heap is a cache of what the records already say:
//! [`ExecutionEngine::refresh_timers`] rebuilds it from storage after a
//! restart.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use orbin_types::config::EngineConfig;
use orbin_types::error::{RepositoryError, TransitionError};
use orbin_types::event::{ExecutionEvent, StepWork};
use orbin_types::organization::OrganizationSettings;
use orbin_types::run::{
    RunFilter, RunStatus, StepError, StepExecution, StepOutcome, StepStatus, WorkflowRun,
};
use orbin_types::workflow::{
    RetryPolicy, StepConfig, StepSpec, TriggerType, WorkflowDefinition, WorkflowStatus,
};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::organization::OrganizationRepository;
use crate::repository::workflow::{RunInsert, WorkflowRepository};
use crate::workflow::definition::{WorkflowError, validate_definition};
use crate::workflow::dispatcher::{self, NextAction, branch_taken, loop_continues};
use crate::workflow::retry::{self, RetryPolicyError};
use crate::workflow::run as run_sm;
use crate::workflow::step::{self as step_sm, FailureDisposition, StepVersion, Transition};
use crate::workflow::timers::{TimerKey, TimerKind, TimerQueue};

/// Upper bound on dispatcher passes in a single `advance` call.
const MAX_ADVANCE_PASSES: usize = 256;

/// Attempts at a contended run transition before giving up.
const RUN_CAS_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("workflow {id} is {status}, not active")]
    WorkflowNotActive { id: Uuid, status: WorkflowStatus },

    #[error("workflow {id} has no version {version}")]
    VersionNotFound { id: Uuid, version: u32 },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} has no step '{step_id}'")]
    StepNotFound { run_id: Uuid, step_id: String },

    /// A second dispatch for a step that already has a record.
    #[error("step '{step_id}' of run {run_id} was already dispatched")]
    DuplicateDispatch { run_id: Uuid, step_id: String },

    /// Every compare-and-set attempt lost to a concurrent writer.
    #[error("run {0} is being modified concurrently")]
    Contended(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    #[error(transparent)]
    InvalidDefinition(#[from] WorkflowError),

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(#[from] RetryPolicyError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// Input to [`ExecutionEngine::create_run`].
#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    pub organization_id: Uuid,
    pub workflow_id: Uuid,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    /// Deduplicates deliveries of the same trigger within the retention window.
    pub idempotency_key: Option<String>,
    /// Wall-clock ceiling for the whole run.
    pub timeout: Option<std::time::Duration>,
}

impl CreateRunRequest {
    pub fn new(
        organization_id: Uuid,
        workflow_id: Uuid,
        trigger_type: TriggerType,
        trigger_data: Value,
    ) -> Self {
        Self {
            organization_id,
            workflow_id,
            trigger_type,
            trigger_data,
            idempotency_key: None,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateRunOutcome {
    Created(Uuid),
    /// The idempotency key matched an existing run.
    Duplicate(Uuid),
}

impl CreateRunOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Duplicate(id) => *id,
        }
    }
}

/// What happened to a reported step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied,
    /// A success for a step that already completed.
    Duplicate,
    /// The result names an attempt or state the step is no longer in, or a
    /// concurrent writer got there first.
    Stale,
    /// The run ended while the step was running; the result was dropped.
    Discarded,
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine<R: WorkflowRepository, O: OrganizationRepository> {
    workflows: Arc<R>,
    organizations: Arc<O>,
    event_bus: EventBus,
    config: EngineConfig,
    timers: Mutex<TimerQueue>,
}

impl<R: WorkflowRepository, O: OrganizationRepository> ExecutionEngine<R, O> {
    pub fn new(workflows: Arc<R>, organizations: Arc<O>, event_bus: EventBus, config: EngineConfig) -> Self {
        Self {
            workflows,
            organizations,
            event_bus,
            config,
            timers: Mutex::new(TimerQueue::new()),
        }
    }

    pub fn workflows(&self) -> &Arc<R> {
        &self.workflows
    }

    pub fn organizations(&self) -> &Arc<O> {
        &self.organizations
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of live timers.
    pub async fn pending_timers(&self) -> usize {
        self.timers.lock().await.len()
    }

    // -----------------------------------------------------------------------
    // Workflow definitions
    // -----------------------------------------------------------------------

    /// Validate and store a definition as its next version.
    pub async fn save_workflow(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        validate_definition(&def)?;

        let now = Utc::now();
        match self.workflows.get_definition(&def.id).await? {
            Some(previous) if previous.organization_id != def.organization_id => {
                return Err(EngineError::WorkflowNotFound(def.id));
            }
            Some(previous) => {
                def.version = previous.version + 1;
                def.created_at = previous.created_at;
            }
            None => {
                def.version = 1;
                def.created_at = now;
            }
        }
        def.updated_at = now;

        self.workflows.save_definition(&def).await?;
        tracing::info!(
            workflow_id = %def.id,
            version = def.version,
            status = %def.status,
            "workflow saved"
        );
        Ok(def)
    }

    /// Latest version of a workflow owned by `organization_id`.
    pub async fn get_workflow(
        &self,
        organization_id: &Uuid,
        workflow_id: &Uuid,
    ) -> Result<WorkflowDefinition, EngineError> {
        self.workflows
            .get_definition(workflow_id)
            .await?
            .filter(|def| def.organization_id == *organization_id)
            .ok_or(EngineError::WorkflowNotFound(*workflow_id))
    }

    pub async fn list_workflows(
        &self,
        organization_id: Option<&Uuid>,
    ) -> Result<Vec<WorkflowDefinition>, EngineError> {
        Ok(self.workflows.list_definitions(organization_id).await?)
    }

    /// Change a workflow's status by saving a new version.
    pub async fn set_workflow_status(
        &self,
        organization_id: &Uuid,
        workflow_id: &Uuid,
        status: WorkflowStatus,
    ) -> Result<WorkflowDefinition, EngineError> {
        let mut def = self.get_workflow(organization_id, workflow_id).await?;
        if def.status == status {
            return Ok(def);
        }
        def.status = status;
        self.save_workflow(def).await
    }

    // -----------------------------------------------------------------------
    // Organization settings
    // -----------------------------------------------------------------------

    pub async fn organization_settings(
        &self,
        organization_id: &Uuid,
    ) -> Result<OrganizationSettings, EngineError> {
        Ok(self
            .organizations
            .get_settings(organization_id)
            .await?
            .unwrap_or_else(|| {
                let mut settings = OrganizationSettings::new(*organization_id);
                settings.default_retry_policy = self.config.default_retry_policy;
                settings
            }))
    }

    /// Set the organization's default retry policy. Applies to runs created
    /// afterwards.
    pub async fn set_default_retry_policy(
        &self,
        organization_id: &Uuid,
        policy: RetryPolicy,
    ) -> Result<OrganizationSettings, EngineError> {
        retry::validate(&policy)?;
        let mut settings = self.organization_settings(organization_id).await?;
        settings.default_retry_policy = policy;
        settings.updated_at = Utc::now();
        self.organizations.save_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn set_webhook_secret(
        &self,
        organization_id: &Uuid,
        secret: Option<String>,
    ) -> Result<OrganizationSettings, EngineError> {
        let mut settings = self.organization_settings(organization_id).await?;
        settings.webhook_secret = secret;
        settings.updated_at = Utc::now();
        self.organizations.save_settings(&settings).await?;
        Ok(settings)
    }

    // -----------------------------------------------------------------------
    // Run creation
    // -----------------------------------------------------------------------

    /// Create a run of the latest version of an active workflow.
    ///
    /// A repeated idempotency key within the retention window returns the
    /// existing run as [`CreateRunOutcome::Duplicate`].
    pub async fn create_run(&self, req: CreateRunRequest) -> Result<CreateRunOutcome, EngineError> {
        let def = self.get_workflow(&req.organization_id, &req.workflow_id).await?;
        if def.status != WorkflowStatus::Active {
            return Err(EngineError::WorkflowNotActive {
                id: def.id,
                status: def.status,
            });
        }

        let now = Utc::now();
        let deadline_at = match req.timeout {
            Some(timeout) => Some(deadline_after(now, timeout)?),
            None => None,
        };
        let default_retry_policy = self
            .organization_settings(&req.organization_id)
            .await?
            .default_retry_policy;

        let run = WorkflowRun {
            id: Uuid::now_v7(),
            organization_id: req.organization_id,
            workflow_id: def.id,
            workflow_version: def.version,
            status: RunStatus::Pending,
            trigger_type: req.trigger_type,
            trigger_data: req.trigger_data,
            idempotency_key: req.idempotency_key,
            result: None,
            error: None,
            default_retry_policy,
            deadline_at,
            replay_of: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: now,
            steps: Vec::new(),
        };

        self.insert_and_advance(run, now).await
    }

    /// Re-run a run's pinned workflow version with the same trigger data.
    pub async fn replay_run(&self, run_id: &Uuid) -> Result<Uuid, EngineError> {
        let source = self
            .workflows
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(*run_id))?;
        self.load_pinned(&source).await?;

        let now = Utc::now();
        let deadline_at = source
            .deadline_at
            .map(|deadline| deadline - source.created_at)
            .and_then(|budget| now.checked_add_signed(budget));

        let run = WorkflowRun {
            id: Uuid::now_v7(),
            status: RunStatus::Pending,
            idempotency_key: None,
            result: None,
            error: None,
            deadline_at,
            replay_of: Some(source.id),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: now,
            steps: Vec::new(),
            ..source
        };

        tracing::info!(source_run_id = %run_id, run_id = %run.id, "replaying run");
        Ok(self.insert_and_advance(run, now).await?.run_id())
    }

    async fn insert_and_advance(
        &self,
        run: WorkflowRun,
        now: DateTime<Utc>,
    ) -> Result<CreateRunOutcome, EngineError> {
        let retention = TimeDelta::try_seconds(
            i64::try_from(self.config.idempotency_retention_secs).unwrap_or(i64::MAX),
        )
        .unwrap_or(TimeDelta::MAX);
        let dedupe_since = now
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        if let RunInsert::Existing(existing) = self.workflows.insert_run(&run, dedupe_since).await? {
            tracing::info!(
                workflow_id = %run.workflow_id,
                run_id = %existing,
                idempotency_key = ?run.idempotency_key,
                "duplicate trigger delivery"
            );
            return Ok(CreateRunOutcome::Duplicate(existing));
        }

        if let Some(deadline) = run.deadline_at {
            self.timers
                .lock()
                .await
                .schedule(TimerKey::run_deadline(run.id), deadline);
        }

        tracing::info!(
            run_id = %run.id,
            workflow_id = %run.workflow_id,
            version = run.workflow_version,
            trigger = %run.trigger_type,
            "run created"
        );
        self.event_bus.publish(ExecutionEvent::RunCreated {
            run_id: run.id,
            organization_id: run.organization_id,
            workflow_id: run.workflow_id,
            trigger_type: run.trigger_type,
        });

        if let Err(e) = self.advance_at(run.id, now).await {
            tracing::warn!(run_id = %run.id, error = %e, "initial dispatch failed");
        }
        Ok(CreateRunOutcome::Created(run.id))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// A run with its step executions embedded.
    pub async fn get_run(&self, run_id: &Uuid) -> Result<WorkflowRun, EngineError> {
        let mut run = self
            .workflows
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(*run_id))?;
        run.steps = self.workflows.list_steps(run_id).await?;
        Ok(run)
    }

    pub async fn list_runs(
        &self,
        organization_id: &Uuid,
        filter: &RunFilter,
    ) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.workflows.list_runs(organization_id, filter).await?)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Drive a run forward until it waits on a step, a timer, or finishes.
    pub async fn advance(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.advance_at(run_id, Utc::now()).await
    }

    async fn advance_at(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<(), EngineError> {
        for _ in 0..MAX_ADVANCE_PASSES {
            let run = self
                .workflows
                .get_run(&run_id)
                .await?
                .ok_or(EngineError::RunNotFound(run_id))?;

            if run.status.is_terminal() {
                self.timers.lock().await.cancel_run(run_id);
                return Ok(());
            }
            if run_sm::deadline_passed(&run, now) {
                self.time_out_run(run, now).await?;
                return Ok(());
            }

            let def = self.load_pinned(&run).await?;
            let steps = self.workflows.list_steps(&run_id).await?;
            let plan = dispatcher::plan(&def, &run, &steps, now);

            for step_id in &plan.skips {
                self.skip_step(&def, &run, &steps, step_id, now).await?;
            }

            let progressed = match plan.next {
                NextAction::Start {
                    step_id,
                    input,
                    existing,
                } => match self.start_step(&def, &run, &step_id, input, existing, now).await {
                    Err(EngineError::DuplicateDispatch { run_id, step_id }) => {
                        tracing::debug!(%run_id, %step_id, "step already dispatched elsewhere");
                        false
                    }
                    other => other?,
                },
                NextAction::Resume { step_id } => self.resume_step(&def, &run, &step_id, now).await?,
                NextAction::CompleteDelay { step_id } => {
                    self.complete_delay(&run, &step_id, now).await?
                }
                NextAction::TimeoutStep { step_id } => {
                    self.time_out_step(&def, &run, &step_id, now).await?
                }
                NextAction::Wait { wake_at } => {
                    if let Some(at) = wake_at {
                        let key = wake_timer(run_id, &steps, at);
                        self.timers.lock().await.schedule(key, at);
                    }
                    false
                }
                NextAction::CompleteRun { result } => {
                    self.finish_run(run, now, |r| run_sm::complete(r, result, now))
                        .await?;
                    false
                }
                NextAction::FailRun { error } => {
                    self.finish_run(run, now, |r| run_sm::fail(r, error, now))
                        .await?;
                    false
                }
            };

            if !progressed {
                return Ok(());
            }
        }

        tracing::warn!(%run_id, passes = MAX_ADVANCE_PASSES, "dispatch pass budget exhausted");
        Ok(())
    }

    /// Create (or claim) a step's record and move it to `running`.
    async fn start_step(
        &self,
        def: &WorkflowDefinition,
        run: &WorkflowRun,
        step_id: &str,
        input: Value,
        existing: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let spec = spec_of(def, run, step_id)?;

        if run.status == RunStatus::Pending {
            let mut started = run.clone();
            run_sm::start(&mut started, now)?;
            if !self
                .workflows
                .compare_and_set_run(&started, RunStatus::Pending)
                .await?
            {
                tracing::debug!(run_id = %run.id, "run start lost a race");
                return Ok(false);
            }
            tracing::info!(run_id = %run.id, "run started");
        }

        let mut step = if existing {
            self.load_step(&run.id, step_id).await?
        } else {
            let policy = resolve_policy(def, spec, run);
            let record = step_sm::new_execution(run, spec, policy, input.clone(), now);
            match self.workflows.insert_step(&record).await {
                Ok(()) => record,
                Err(RepositoryError::Conflict(_)) => {
                    return Err(EngineError::DuplicateDispatch {
                        run_id: run.id,
                        step_id: step_id.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };
        if step.input.is_none() {
            step.input = Some(input);
        }

        let expected = StepVersion::of(&step);
        step_sm::start(&mut step, spec, now)?;
        if !self.store_step(&step, expected).await? {
            return Ok(false);
        }

        self.dispatch(def, run, spec, &step).await;
        Ok(true)
    }

    /// `retrying -> running` once the retry is due.
    async fn resume_step(
        &self,
        def: &WorkflowDefinition,
        run: &WorkflowRun,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let spec = spec_of(def, run, step_id)?;
        let mut step = self.load_step(&run.id, step_id).await?;
        let expected = StepVersion::of(&step);
        step_sm::start(&mut step, spec, now)?;
        if !self.store_step(&step, expected).await? {
            return Ok(false);
        }
        tracing::info!(run_id = %run.id, %step_id, attempt = step.attempt, "retrying step");
        self.dispatch(def, run, spec, &step).await;
        Ok(true)
    }

    /// Arm the step's timers and hand handler steps to workers.
    async fn dispatch(
        &self,
        def: &WorkflowDefinition,
        run: &WorkflowRun,
        spec: &StepSpec,
        step: &StepExecution,
    ) {
        self.arm_step_timers(step).await;

        let Some(work) = step_work(def, run, spec, step) else {
            tracing::debug!(run_id = %run.id, step_id = %spec.id, "delay step started");
            return;
        };
        tracing::debug!(
            run_id = %run.id,
            step_id = %spec.id,
            attempt = step.attempt,
            iteration = step.iteration,
            handler = %work.handler,
            "step dispatched"
        );
        self.event_bus.publish(ExecutionEvent::StepDispatched(work));
    }

    /// Work for every handler step currently `running` in an active run.
    ///
    /// Workers that missed `StepDispatched` events use this to pick the
    /// attempts back up. An attempt executed twice reports twice; the second
    /// report is a duplicate or stale.
    pub async fn running_work(&self) -> Result<Vec<StepWork>, EngineError> {
        let mut out = Vec::new();
        for run in self.workflows.list_active_runs().await? {
            let steps = self.workflows.list_steps(&run.id).await?;
            if !steps.iter().any(|s| s.status == StepStatus::Running) {
                continue;
            }
            let def = self.load_pinned(&run).await?;
            for step in steps.iter().filter(|s| s.status == StepStatus::Running) {
                let Some(spec) = def.step(&step.step_id) else {
                    continue;
                };
                if let Some(work) = step_work(&def, &run, spec, step) {
                    out.push(work);
                }
            }
        }
        Ok(out)
    }

    async fn complete_delay(
        &self,
        run: &WorkflowRun,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let mut step = self.load_step(&run.id, step_id).await?;
        let expected = StepVersion::of(&step);
        let passthrough = step.input.clone();
        if step_sm::complete(&mut step, passthrough, now)? == Transition::Noop {
            return Ok(true);
        }
        if !self.store_step(&step, expected).await? {
            return Ok(false);
        }
        self.event_bus.publish(ExecutionEvent::StepCompleted {
            run_id: run.id,
            step_id: step.step_id.clone(),
            attempt: step.attempt,
        });
        Ok(true)
    }

    async fn time_out_step(
        &self,
        def: &WorkflowDefinition,
        run: &WorkflowRun,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let spec = spec_of(def, run, step_id)?;
        let mut step = self.load_step(&run.id, step_id).await?;
        let expected = StepVersion::of(&step);
        let message = match spec.timeout_ms {
            Some(ms) => format!("step exceeded its timeout of {ms} ms"),
            None => "step exceeded its timeout".to_string(),
        };
        step_sm::fail(&mut step, StepError::new(message), true, now)?;
        if !self.store_step(&step, expected).await? {
            return Ok(false);
        }
        tracing::warn!(run_id = %run.id, %step_id, attempt = step.attempt, "step timed out");
        self.event_bus.publish(ExecutionEvent::StepFailed {
            run_id: run.id,
            step_id: step.step_id.clone(),
            attempt: step.attempt,
            will_retry: false,
        });
        Ok(true)
    }

    /// Mark a step of the branch not taken as skipped, creating its record
    /// when it never ran.
    async fn skip_step(
        &self,
        def: &WorkflowDefinition,
        run: &WorkflowRun,
        steps: &[StepExecution],
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let applied = match steps.iter().find(|s| s.step_id == step_id) {
            Some(existing) => {
                let mut step = existing.clone();
                let expected = StepVersion::of(&step);
                step_sm::skip(&mut step, now)? == Transition::Applied
                    && self.store_step(&step, expected).await?
            }
            None => {
                let spec = spec_of(def, run, step_id)?;
                let policy = resolve_policy(def, spec, run);
                let mut step = step_sm::new_execution(run, spec, policy, Value::Null, now);
                step.input = None;
                step_sm::skip(&mut step, now)?;
                match self.workflows.insert_step(&step).await {
                    Ok(()) => true,
                    Err(RepositoryError::Conflict(_)) => false,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if applied {
            tracing::debug!(run_id = %run.id, %step_id, "step skipped");
            self.event_bus.publish(ExecutionEvent::StepSkipped {
                run_id: run.id,
                step_id: step_id.to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step results
    // -----------------------------------------------------------------------

    /// Apply a worker's result for one attempt of a step.
    ///
    /// Results for an attempt the step is no longer on are ignored, and a
    /// repeated success for a completed step changes nothing.
    pub async fn report_step_result(
        &self,
        run_id: &Uuid,
        step_id: &str,
        attempt: u32,
        outcome: StepOutcome,
    ) -> Result<ReportOutcome, EngineError> {
        let now = Utc::now();
        let run = self
            .workflows
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(*run_id))?;
        let mut step = self.load_step(run_id, step_id).await?;

        if step.status == StepStatus::Completed && matches!(outcome, StepOutcome::Success { .. }) {
            tracing::debug!(%run_id, %step_id, attempt, "duplicate success report");
            return Ok(ReportOutcome::Duplicate);
        }
        if step.status != StepStatus::Running || step.attempt != attempt {
            tracing::debug!(
                %run_id,
                %step_id,
                attempt,
                current_attempt = step.attempt,
                status = %step.status,
                "stale step result"
            );
            return Ok(ReportOutcome::Stale);
        }

        let expected = StepVersion::of(&step);
        let before = step.clone();

        if run.status.is_terminal() {
            return self.discard_result(before, expected, run.status, now).await;
        }

        let def = self.load_pinned(&run).await?;
        let spec = spec_of(&def, &run, step_id)?;

        let event = match outcome {
            StepOutcome::Success { output } => self.apply_success(spec, &mut step, output, now)?,
            StepOutcome::Failure { error, retryable } => {
                tracing::warn!(%run_id, %step_id, attempt, retryable, error = %error.message, "step failed");
                Some(self.apply_failure(&mut step, error, !retryable, now))
            }
        };

        if !self.store_step(&step, expected).await? {
            return Ok(ReportOutcome::Stale);
        }

        // The run may have ended between the first read and the step write.
        let current = self
            .workflows
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(*run_id))?;
        if current.status.is_terminal() {
            return self
                .discard_result(before, StepVersion::of(&step), current.status, now)
                .await;
        }

        if let Some(at) = step.next_retry_at {
            self.timers.lock().await.schedule(
                TimerKey::step(*run_id, TimerKind::StepRetry, step_id),
                at,
            );
        }
        if let Some(event) = event {
            self.event_bus.publish(event);
        }

        if let Err(e) = self.advance_at(*run_id, now).await {
            tracing::warn!(%run_id, error = %e, "dispatch after step result failed");
        }
        Ok(ReportOutcome::Applied)
    }

    /// Store `running` as `skipped` over the record at `current`, dropping
    /// the reported result.
    async fn discard_result(
        &self,
        running: StepExecution,
        current: StepVersion,
        run_status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, EngineError> {
        let mut step = running;
        step_sm::discard(&mut step, now)?;
        if !self.store_step(&step, current).await? {
            return Ok(ReportOutcome::Stale);
        }
        tracing::info!(
            run_id = %step.run_id,
            step_id = %step.step_id,
            %run_status,
            "result discarded"
        );
        self.event_bus.publish(ExecutionEvent::StepSkipped {
            run_id: step.run_id,
            step_id: step.step_id.clone(),
        });
        Ok(ReportOutcome::Discarded)
    }

    fn apply_success(
        &self,
        spec: &StepSpec,
        step: &mut StepExecution,
        output: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionEvent>, EngineError> {
        match &spec.config {
            StepConfig::Condition { .. } if branch_taken(&output).is_none() => {
                let error = StepError::new(format!(
                    "condition step '{}' must output a boolean, got {output}",
                    spec.id
                ));
                Ok(Some(self.apply_failure(step, error, true, now)))
            }
            StepConfig::Loop { max_iterations, .. } if loop_continues(&output) => {
                let cap = max_iterations.unwrap_or(self.config.max_loop_iterations);
                if step.iteration >= cap {
                    let error = StepError::new(format!(
                        "loop step '{}' exceeded {cap} iterations",
                        spec.id
                    ));
                    return Ok(Some(self.apply_failure(step, error, true, now)));
                }
                step_sm::reenter(step, output)?;
                tracing::debug!(
                    run_id = %step.run_id,
                    step_id = %step.step_id,
                    iteration = step.iteration,
                    "loop iteration"
                );
                Ok(None)
            }
            _ => {
                step_sm::complete(step, Some(output), now)?;
                Ok(Some(ExecutionEvent::StepCompleted {
                    run_id: step.run_id,
                    step_id: step.step_id.clone(),
                    attempt: step.attempt,
                }))
            }
        }
    }

    fn apply_failure(
        &self,
        step: &mut StepExecution,
        error: StepError,
        fatal: bool,
        now: DateTime<Utc>,
    ) -> ExecutionEvent {
        let attempt = step.attempt;
        // `fail` only rejects non-running steps, which callers have ruled out.
        let will_retry = matches!(
            step_sm::fail(step, error, fatal, now),
            Ok(FailureDisposition::Retrying { .. })
        );
        ExecutionEvent::StepFailed {
            run_id: step.run_id,
            step_id: step.step_id.clone(),
            attempt,
            will_retry,
        }
    }

    // -----------------------------------------------------------------------
    // Run termination
    // -----------------------------------------------------------------------

    /// Cancel a pending or running run. Pending and retrying steps are
    /// skipped; a running step is left to report, and its result is discarded.
    pub async fn cancel_run(&self, run_id: &Uuid) -> Result<(), EngineError> {
        for _ in 0..RUN_CAS_ATTEMPTS {
            let now = Utc::now();
            let mut run = self
                .workflows
                .get_run(run_id)
                .await?
                .ok_or(EngineError::RunNotFound(*run_id))?;
            let expected = run.status;

            if let Err(e) = run_sm::cancel(&mut run, now) {
                tracing::warn!(%run_id, status = %expected, error = %e, "cancel rejected");
                return Err(e.into());
            }
            if self.workflows.compare_and_set_run(&run, expected).await? {
                tracing::info!(%run_id, "run canceled");
                self.close_run(&run, now).await?;
                return Ok(());
            }
        }
        Err(EngineError::Contended(*run_id))
    }

    async fn time_out_run(&self, mut run: WorkflowRun, now: DateTime<Utc>) -> Result<(), EngineError> {
        let expected = run.status;
        run_sm::time_out(&mut run, now)?;
        if self.workflows.compare_and_set_run(&run, expected).await? {
            tracing::warn!(run_id = %run.id, deadline = ?run.deadline_at, "run timed out");
            self.close_run(&run, now).await?;
        }
        Ok(())
    }

    /// Apply a terminal transition to a non-terminal run.
    async fn finish_run(
        &self,
        mut run: WorkflowRun,
        now: DateTime<Utc>,
        transition: impl FnOnce(&mut WorkflowRun) -> Result<(), TransitionError>,
    ) -> Result<(), EngineError> {
        let expected = run.status;
        if expected == RunStatus::Pending {
            run_sm::start(&mut run, now)?;
        }
        if let Err(e) = transition(&mut run) {
            tracing::warn!(run_id = %run.id, status = %expected, error = %e, "run transition rejected");
            return Err(e.into());
        }
        if !self.workflows.compare_and_set_run(&run, expected).await? {
            tracing::debug!(run_id = %run.id, "run finish lost a race");
            return Ok(());
        }
        match &run.error {
            Some(error) => tracing::warn!(
                run_id = %run.id,
                status = %run.status,
                step_id = ?error.step_id,
                error = %error.message,
                "run finished"
            ),
            None => tracing::info!(
                run_id = %run.id,
                status = %run.status,
                duration_ms = ?run.duration_ms,
                "run finished"
            ),
        }
        self.close_run(&run, now).await
    }

    /// Side effects of a run reaching a terminal state.
    async fn close_run(&self, run: &WorkflowRun, now: DateTime<Utc>) -> Result<(), EngineError> {
        for mut step in self.workflows.list_steps(&run.id).await? {
            if !matches!(step.status, StepStatus::Pending | StepStatus::Retrying) {
                continue;
            }
            let expected = StepVersion::of(&step);
            step_sm::skip(&mut step, now)?;
            if self.store_step(&step, expected).await? {
                self.event_bus.publish(ExecutionEvent::StepSkipped {
                    run_id: run.id,
                    step_id: step.step_id.clone(),
                });
            }
        }

        self.timers.lock().await.cancel_run(run.id);

        self.event_bus.publish(ExecutionEvent::RunFinished {
            run_id: run.id,
            organization_id: run.organization_id,
            workflow_id: run.workflow_id,
            status: run.status,
            duration_ms: run.duration_ms,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Advance every run with a timer due at or before `now`. Returns the
    /// number of runs touched.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due = self.timers.lock().await.pop_due(now);
        let mut run_ids: Vec<Uuid> = due.into_iter().map(|key| key.run_id).collect();
        run_ids.sort_unstable();
        run_ids.dedup();

        for run_id in &run_ids {
            if let Err(e) = self.advance_at(*run_id, now).await {
                tracing::warn!(%run_id, error = %e, "timer dispatch failed");
            }
        }
        run_ids.len()
    }

    /// Rebuild the timer heap from persisted deadlines.
    pub async fn refresh_timers(&self) -> Result<usize, EngineError> {
        let runs = self.workflows.list_active_runs().await?;
        let steps = self.workflows.list_step_timers().await?;

        let mut timers = self.timers.lock().await;
        for run in &runs {
            if let Some(deadline) = run.deadline_at {
                timers.schedule(TimerKey::run_deadline(run.id), deadline);
            }
        }
        for step in &steps {
            for (key, at) in step_timers(step) {
                timers.schedule(key, at);
            }
        }
        Ok(timers.len())
    }

    /// Rebuild timers and advance every active run. Used at startup to pick
    /// up runs a crashed process left behind.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let timers = self.refresh_timers().await?;
        let runs = self.workflows.list_active_runs().await?;
        for run in &runs {
            if let Err(e) = self.advance(run.id).await {
                tracing::warn!(run_id = %run.id, error = %e, "recovery dispatch failed");
            }
        }
        tracing::info!(runs = runs.len(), timers, "recovered active runs");
        Ok(runs.len())
    }

    async fn arm_step_timers(&self, step: &StepExecution) {
        let mut timers = self.timers.lock().await;
        for (key, at) in step_timers(step) {
            timers.schedule(key, at);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load_pinned(&self, run: &WorkflowRun) -> Result<WorkflowDefinition, EngineError> {
        self.workflows
            .get_definition_version(&run.workflow_id, run.workflow_version)
            .await?
            .ok_or(EngineError::VersionNotFound {
                id: run.workflow_id,
                version: run.workflow_version,
            })
    }

    async fn load_step(&self, run_id: &Uuid, step_id: &str) -> Result<StepExecution, EngineError> {
        self.workflows
            .get_step(run_id, step_id)
            .await?
            .ok_or_else(|| EngineError::StepNotFound {
                run_id: *run_id,
                step_id: step_id.to_string(),
            })
    }

    async fn store_step(&self, step: &StepExecution, expected: StepVersion) -> Result<bool, EngineError> {
        let stored = self.workflows.compare_and_set_step(step, expected).await?;
        if !stored {
            tracing::debug!(
                run_id = %step.run_id,
                step_id = %step.step_id,
                expected_status = %expected.status,
                "step update lost a race"
            );
        }
        Ok(stored)
    }
}

fn spec_of<'a>(
    def: &'a WorkflowDefinition,
    run: &WorkflowRun,
    step_id: &str,
) -> Result<&'a StepSpec, EngineError> {
    def.step(step_id).ok_or_else(|| EngineError::StepNotFound {
        run_id: run.id,
        step_id: step_id.to_string(),
    })
}

/// Step override, then workflow override, then the organization default
/// captured on the run.
fn resolve_policy(def: &WorkflowDefinition, spec: &StepSpec, run: &WorkflowRun) -> RetryPolicy {
    spec.retry_policy
        .or(def.retry_policy)
        .unwrap_or(run.default_retry_policy)
}

fn deadline_after(now: DateTime<Utc>, timeout: std::time::Duration) -> Result<DateTime<Utc>, EngineError> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| EngineError::InvalidRequest(format!("run timeout {timeout:?} is out of range")))
}

/// `None` for delay steps, which no worker executes.
fn step_work(
    def: &WorkflowDefinition,
    run: &WorkflowRun,
    spec: &StepSpec,
    step: &StepExecution,
) -> Option<StepWork> {
    let handler = spec.config.handler()?;
    Some(StepWork {
        run_id: run.id,
        organization_id: run.organization_id,
        workflow_id: def.id,
        step_id: spec.id.clone(),
        step_name: spec.name.clone(),
        step_type: spec.step_type(),
        attempt: step.attempt,
        iteration: step.iteration,
        handler: handler.to_string(),
        params: spec.config.params().clone(),
        input: step.input.clone().unwrap_or(Value::Null),
    })
}

fn step_timers(step: &StepExecution) -> Vec<(TimerKey, DateTime<Utc>)> {
    let slots = [
        (TimerKind::StepRetry, step.next_retry_at),
        (TimerKind::DelayResume, step.resume_at),
        (TimerKind::StepTimeout, step.timeout_at),
    ];
    slots
        .into_iter()
        .filter_map(|(kind, at)| {
            at.map(|at| (TimerKey::step(step.run_id, kind, step.step_id.clone()), at))
        })
        .collect()
}

/// The timer behind a `Wait` deadline.
fn wake_timer(run_id: Uuid, steps: &[StepExecution], at: DateTime<Utc>) -> TimerKey {
    steps
        .iter()
        .flat_map(step_timers)
        .find(|(_, due)| *due == at)
        .map(|(key, _)| key)
        .unwrap_or_else(|| TimerKey::run_deadline(run_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
