//! Step execution state machine.
//!
//! ```text
//! pending -> running -> completed
//!               |
//!               +-> failed            (fatal, or attempts exhausted)
//!               +-> retrying -> running   (when next_retry_at is due)
//!               +-> pending           (loop re-entry, next iteration)
//! pending | retrying -> skipped
//! running -> skipped                  (result discarded, run already terminal)
//! ```
//!
//! Every function mutates the record in memory only. Callers persist the
//! result with a compare-and-set keyed on the record's previous
//! [`StepVersion`].

use chrono::{DateTime, Utc};
use orbin_types::error::TransitionError;
use orbin_types::run::{StepError, StepExecution, StepStatus, WorkflowRun};
use orbin_types::workflow::{RetryPolicy, StepConfig, StepSpec};
use uuid::Uuid;

use super::retry;

const ENTITY: &str = "step";

/// The fields a step compare-and-set is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepVersion {
    pub status: StepStatus,
    pub attempt: u32,
    pub iteration: u32,
}

impl StepVersion {
    pub fn of(step: &StepExecution) -> Self {
        Self {
            status: step.status,
            attempt: step.attempt,
            iteration: step.iteration,
        }
    }
}

/// Whether a transition changed the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The record was already in the requested state.
    Noop,
}

/// What a failure turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Scheduled for another attempt at the given time.
    Retrying { next_retry_at: DateTime<Utc> },
    /// Terminal failure.
    Failed,
}

/// Build the pending record for a step that just became runnable.
pub fn new_execution(
    run: &WorkflowRun,
    spec: &StepSpec,
    retry_policy: RetryPolicy,
    input: serde_json::Value,
    now: DateTime<Utc>,
) -> StepExecution {
    StepExecution {
        id: Uuid::now_v7(),
        run_id: run.id,
        organization_id: run.organization_id,
        step_id: spec.id.clone(),
        step_name: spec.name.clone(),
        status: StepStatus::Pending,
        attempt: 1,
        iteration: 1,
        retry_policy,
        input: Some(input),
        output: None,
        error: None,
        next_retry_at: None,
        resume_at: None,
        timeout_at: None,
        started_at: None,
        completed_at: None,
        duration_ms: None,
        created_at: now,
    }
}

/// `pending -> running`, or `retrying -> running` once the retry is due.
///
/// Arms the delay resume time for delay steps and the execution deadline for
/// steps with a timeout.
pub fn start(
    step: &mut StepExecution,
    spec: &StepSpec,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    match step.status {
        StepStatus::Pending => {}
        StepStatus::Retrying if step.next_retry_at.is_none_or(|at| at <= now) => {}
        other => return Err(TransitionError::illegal(ENTITY, other, StepStatus::Running)),
    }

    step.status = StepStatus::Running;
    step.next_retry_at = None;
    step.started_at = Some(now);
    step.completed_at = None;
    step.duration_ms = None;
    step.resume_at = match &spec.config {
        StepConfig::Delay { duration_ms } => Some(after(now, *duration_ms)),
        _ => None,
    };
    step.timeout_at = spec.timeout_ms.map(|ms| after(now, ms));
    Ok(())
}

/// `running -> completed`. Idempotent on an already-completed step.
pub fn complete(
    step: &mut StepExecution,
    output: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    match step.status {
        StepStatus::Completed => Ok(Transition::Noop),
        StepStatus::Running => {
            step.status = StepStatus::Completed;
            step.output = output;
            step.error = None;
            finish(step, now);
            Ok(Transition::Applied)
        }
        other => Err(TransitionError::illegal(
            ENTITY,
            other,
            StepStatus::Completed,
        )),
    }
}

/// `running -> failed`, continuing to `retrying` when the failure is not
/// fatal and the policy has attempts left.
pub fn fail(
    step: &mut StepExecution,
    error: StepError,
    fatal: bool,
    now: DateTime<Utc>,
) -> Result<FailureDisposition, TransitionError> {
    if step.status != StepStatus::Running {
        return Err(TransitionError::illegal(
            ENTITY,
            step.status,
            StepStatus::Failed,
        ));
    }

    step.error = Some(error);
    step.resume_at = None;
    step.timeout_at = None;

    if !fatal && retry::is_retryable(&step.retry_policy, step.attempt) {
        step.attempt += 1;
        let next_retry_at = retry::retry_at(&step.retry_policy, step.attempt, now);
        step.status = StepStatus::Retrying;
        step.next_retry_at = Some(next_retry_at);
        return Ok(FailureDisposition::Retrying { next_retry_at });
    }

    step.status = StepStatus::Failed;
    finish(step, now);
    Ok(FailureDisposition::Failed)
}

/// `pending | retrying -> skipped`: branch not taken, or run ended first.
pub fn skip(step: &mut StepExecution, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
    match step.status {
        StepStatus::Skipped => Ok(Transition::Noop),
        StepStatus::Pending | StepStatus::Retrying => {
            step.status = StepStatus::Skipped;
            step.next_retry_at = None;
            step.completed_at = Some(now);
            Ok(Transition::Applied)
        }
        other => Err(TransitionError::illegal(ENTITY, other, StepStatus::Skipped)),
    }
}

/// `running -> skipped` for a step whose run is already terminal. The
/// reported result is dropped.
pub fn discard(step: &mut StepExecution, now: DateTime<Utc>) -> Result<(), TransitionError> {
    if step.status != StepStatus::Running {
        return Err(TransitionError::illegal(
            ENTITY,
            step.status,
            StepStatus::Skipped,
        ));
    }
    step.status = StepStatus::Skipped;
    step.resume_at = None;
    step.timeout_at = None;
    finish(step, now);
    Ok(())
}

/// `running -> pending` with the next loop iteration and a fresh attempt
/// budget. The iteration's output becomes the next iteration's input.
pub fn reenter(
    step: &mut StepExecution,
    output: serde_json::Value,
) -> Result<(), TransitionError> {
    if step.status != StepStatus::Running {
        return Err(TransitionError::illegal(
            ENTITY,
            step.status,
            StepStatus::Pending,
        ));
    }
    step.status = StepStatus::Pending;
    step.iteration += 1;
    step.attempt = 1;
    step.input = Some(output.clone());
    step.output = Some(output);
    step.error = None;
    step.started_at = None;
    step.timeout_at = None;
    Ok(())
}

fn finish(step: &mut StepExecution, now: DateTime<Utc>) {
    step.completed_at = Some(now);
    step.duration_ms = step
        .started_at
        .map(|started| (now - started).num_milliseconds());
}

fn after(now: DateTime<Utc>, millis: u64) -> DateTime<Utc> {
    let millis = i64::try_from(millis).unwrap_or(i64::MAX);
    now.checked_add_signed(chrono::Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
