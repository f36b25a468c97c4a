//! Workflow run state machine.
//!
//! `pending -> running -> {completed | failed | canceled | timed_out}`, plus
//! `pending -> {canceled | timed_out}` for runs that end before any step
//! starts. Terminal states are immutable: any further transition is an
//! [`TransitionError::Illegal`].

use chrono::{DateTime, Utc};
use orbin_types::error::TransitionError;
use orbin_types::run::{RunError, RunStatus, WorkflowRun};

use super::step::Transition;

const ENTITY: &str = "run";

/// `pending -> running`. A run that is already running is left unchanged.
pub fn start(run: &mut WorkflowRun, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
    match run.status {
        RunStatus::Running => Ok(Transition::Noop),
        RunStatus::Pending => {
            run.status = RunStatus::Running;
            run.started_at = Some(now);
            Ok(Transition::Applied)
        }
        other => Err(TransitionError::illegal(ENTITY, other, RunStatus::Running)),
    }
}

/// `running -> completed` with the collected step outputs.
pub fn complete(
    run: &mut WorkflowRun,
    result: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    require_running(run, RunStatus::Completed)?;
    run.result = Some(result);
    finish(run, RunStatus::Completed, now);
    Ok(())
}

/// `running -> failed`.
pub fn fail(run: &mut WorkflowRun, error: RunError, now: DateTime<Utc>) -> Result<(), TransitionError> {
    require_running(run, RunStatus::Failed)?;
    run.error = Some(error);
    finish(run, RunStatus::Failed, now);
    Ok(())
}

/// `pending | running -> canceled`.
pub fn cancel(run: &mut WorkflowRun, now: DateTime<Utc>) -> Result<(), TransitionError> {
    require_active(run, RunStatus::Canceled)?;
    run.error = Some(RunError {
        message: "run canceled".to_string(),
        stack: None,
        step_id: None,
    });
    finish(run, RunStatus::Canceled, now);
    Ok(())
}

/// `pending | running -> timed_out`.
pub fn time_out(run: &mut WorkflowRun, now: DateTime<Utc>) -> Result<(), TransitionError> {
    require_active(run, RunStatus::TimedOut)?;
    let message = match run.deadline_at {
        Some(deadline) => format!("run exceeded its deadline of {}", deadline.to_rfc3339()),
        None => "run exceeded its deadline".to_string(),
    };
    run.error = Some(RunError {
        message,
        stack: None,
        step_id: None,
    });
    finish(run, RunStatus::TimedOut, now);
    Ok(())
}

/// Whether the run's wall-clock deadline has passed.
pub fn deadline_passed(run: &WorkflowRun, now: DateTime<Utc>) -> bool {
    run.deadline_at.is_some_and(|deadline| deadline <= now)
}

fn require_running(run: &WorkflowRun, to: RunStatus) -> Result<(), TransitionError> {
    if run.status == RunStatus::Running {
        Ok(())
    } else {
        Err(TransitionError::illegal(ENTITY, run.status, to))
    }
}

fn require_active(run: &WorkflowRun, to: RunStatus) -> Result<(), TransitionError> {
    if run.status.is_terminal() {
        Err(TransitionError::illegal(ENTITY, run.status, to))
    } else {
        Ok(())
    }
}

fn finish(run: &mut WorkflowRun, status: RunStatus, now: DateTime<Utc>) {
    run.status = status;
    run.completed_at = Some(now);
    let since = run.started_at.unwrap_or(run.created_at);
    run.duration_ms = Some((now - since).num_milliseconds());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use orbin_types::workflow::{RetryPolicy, TriggerType};
    use serde_json::json;
    use uuid::Uuid;

    fn pending_run() -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_version: 2,
            status: RunStatus::Pending,
            trigger_type: TriggerType::Webhook,
            trigger_data: json!({"order": 1}),
            idempotency_key: Some("evt-1".to_string()),
            result: None,
            error: None,
            default_retry_policy: RetryPolicy::default(),
            deadline_at: None,
            replay_of: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
            steps: vec![],
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut run = pending_run();
        let now = Utc::now();
        assert_eq!(start(&mut run, now).unwrap(), Transition::Applied);
        assert_eq!(run.started_at, Some(now));

        let later = now + Duration::seconds(1);
        assert_eq!(start(&mut run, later).unwrap(), Transition::Noop);
        assert_eq!(run.started_at, Some(now));
    }

    #[test]
    fn test_complete_sets_result_and_duration() {
        let mut run = pending_run();
        let started = Utc::now();
        start(&mut run, started).unwrap();

        let done = started + Duration::milliseconds(2_500);
        complete(&mut run, json!({"a": 1}), done).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result, Some(json!({"a": 1})));
        assert_eq!(run.completed_at, Some(done));
        assert_eq!(run.duration_ms, Some(2_500));
    }

    #[test]
    fn test_fail_records_failing_step() {
        let mut run = pending_run();
        start(&mut run, Utc::now()).unwrap();
        let error = RunError {
            message: "card declined".to_string(),
            stack: None,
            step_id: Some("charge".to_string()),
        };
        fail(&mut run, error, Utc::now()).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.unwrap().step_id.as_deref(), Some("charge"));
    }

    #[test]
    fn test_pending_run_cannot_complete() {
        let mut run = pending_run();
        assert!(complete(&mut run, json!({}), Utc::now()).is_err());
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[test]
    fn test_pending_run_can_be_canceled() {
        let mut run = pending_run();
        cancel(&mut run, Utc::now()).unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
        assert!(run.duration_ms.is_some());
    }

    #[test]
    fn test_terminal_runs_reject_every_transition() {
        let now = Utc::now();
        let mut finished = pending_run();
        start(&mut finished, now).unwrap();
        complete(&mut finished, json!({}), now).unwrap();
        let snapshot = finished.clone();

        let mut run = snapshot.clone();
        assert!(start(&mut run, now).is_err());
        assert!(complete(&mut run, json!({"b": 2}), now).is_err());
        assert!(
            fail(
                &mut run,
                RunError {
                    message: "x".to_string(),
                    stack: None,
                    step_id: None
                },
                now
            )
            .is_err()
        );
        assert!(cancel(&mut run, now).is_err());
        assert!(time_out(&mut run, now).is_err());

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result, snapshot.result);
        assert_eq!(run.completed_at, snapshot.completed_at);
    }

    #[test]
    fn test_time_out_after_deadline() {
        let mut run = pending_run();
        let now = Utc::now();
        run.deadline_at = Some(now);
        start(&mut run, now).unwrap();

        assert!(!deadline_passed(&run, now - Duration::seconds(1)));
        assert!(deadline_passed(&run, now));

        time_out(&mut run, now).unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
        assert!(run.error.unwrap().message.contains("deadline"));
    }
}
