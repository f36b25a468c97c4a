//! Cron scheduling for workflows with a `schedule` trigger.
//!
//! Wraps `tokio-cron-scheduler` so each active scheduled workflow owns one
//! cron job. When a job fires, the registered callback receives the workflow
//! id and the fire time; the API layer turns that into a trigger ingestion
//! keyed on `schedule:{workflow_id}:{fire_time}`, so a fire that is delivered
//! twice (or caught up after a restart) creates at most one run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orbin_types::workflow::{TriggerSpec, WorkflowDefinition, WorkflowStatus};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Failed to create or manipulate a cron job.
    #[error("scheduler error: {0}")]
    JobError(String),

    /// Invalid cron expression or schedule string.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Workflow not registered with the scheduler.
    #[error("workflow {0} not registered in scheduler")]
    WorkflowNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression (with seconds).
///
/// Accepts standard 5-field cron (a `0` seconds field is prepended), 6-field
/// cron, and a few readable forms (case-insensitive):
/// `every N seconds|minutes|hours`, `every minute|hour|day`,
/// `every day at HH:MM`, `minutely`, `hourly`, `daily`.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let invalid = || SchedulerError::InvalidSchedule(input.to_string());

    let expr = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 => trimmed.to_string(),
        _ => readable_to_cron(&trimmed.to_lowercase()).ok_or_else(invalid)??,
    };

    expr.parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(format!("'{trimmed}': {e}")))?;
    Ok(expr)
}

/// Translate a readable schedule. `None` means the phrase is not recognized.
fn readable_to_cron(lower: &str) -> Option<Result<String, SchedulerError>> {
    let fixed = match lower {
        "every minute" | "minutely" => Some("0 * * * * *"),
        "every hour" | "hourly" => Some("0 0 * * * *"),
        "every day" | "daily" => Some("0 0 0 * * *"),
        _ => None,
    };
    if let Some(expr) = fixed {
        return Some(Ok(expr.to_string()));
    }

    let rest = lower.strip_prefix("every ")?;

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':')?;
        let hour: u32 = hour.trim().parse().ok()?;
        let minute: u32 = minute.trim().parse().ok()?;
        return (hour < 24 && minute < 60).then(|| Ok(format!("0 {minute} {hour} * * *")));
    }

    let (count, unit) = rest.split_once(' ')?;
    let n: u32 = count.parse().ok()?;
    if n == 0 {
        return Some(Err(SchedulerError::InvalidSchedule(
            "interval must be > 0".to_string(),
        )));
    }
    match unit.trim().trim_end_matches('s') {
        "second" => Some(Ok(format!("*/{n} * * * * *"))),
        "minute" => Some(Ok(format!("0 */{n} * * * *"))),
        "hour" => Some(Ok(format!("0 0 */{n} * * *"))),
        _ => None,
    }
}

/// Fire times of `schedule` strictly after `since` and strictly before `now`.
pub fn missed_fires(
    schedule: &str,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    let expr = normalize_schedule(schedule)?;
    let cron = expr
        .parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
    Ok(cron
        .iter_after(since)
        .take_while(|next| *next < now)
        .collect())
}

/// The schedule of a workflow, if it is active and schedule-triggered.
pub fn active_schedule(def: &WorkflowDefinition) -> Option<&str> {
    match (&def.status, &def.trigger) {
        (WorkflowStatus::Active, TriggerSpec::Schedule { cron, .. }) => Some(cron.as_str()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Callback invoked with `(workflow_id, fire_time)` when a cron job fires.
pub type CronCallback =
    Arc<dyn Fn(Uuid, DateTime<Utc>) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

struct Registration {
    job_id: Uuid,
    cron_expr: String,
    last_fired: Option<DateTime<Utc>>,
}

/// Owns one cron job per scheduled workflow.
pub struct CronScheduler {
    inner: Arc<RwLock<Option<JobScheduler>>>,
    registrations: Arc<RwLock<HashMap<Uuid, Registration>>>,
}

impl CronScheduler {
    /// Create a new cron scheduler (not yet started).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            registrations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the scheduler. Must be called before registering workflows.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron scheduler started");
        Ok(())
    }

    /// Stop the scheduler and forget every registration.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
            tracing::info!("cron scheduler stopped");
        }
        self.registrations.write().await.clear();
        Ok(())
    }

    /// Register a workflow's schedule. Re-registering replaces the old job.
    ///
    /// `last_fired` is the baseline for [`CronScheduler::check_missed_runs`].
    pub async fn schedule_workflow(
        &self,
        workflow_id: Uuid,
        schedule: &str,
        last_fired: Option<DateTime<Utc>>,
        callback: CronCallback,
    ) -> Result<(), SchedulerError> {
        let cron_expr = normalize_schedule(schedule)?;

        if self.registrations.read().await.contains_key(&workflow_id) {
            self.unschedule_workflow(workflow_id).await?;
        }

        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::JobError("scheduler not started".to_string()))?;

        let registrations = Arc::clone(&self.registrations);
        let job = Job::new_async(cron_expr.as_str(), move |_job_id, _lock| {
            let cb = Arc::clone(&callback);
            let registrations = Arc::clone(&registrations);
            Box::pin(async move {
                let fired_at = Utc::now();
                tracing::debug!(%workflow_id, %fired_at, "cron trigger fired");
                if let Some(entry) = registrations.write().await.get_mut(&workflow_id) {
                    entry.last_fired = Some(fired_at);
                }
                cb(workflow_id, fired_at).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        self.registrations.write().await.insert(
            workflow_id,
            Registration {
                job_id,
                cron_expr,
                last_fired,
            },
        );

        tracing::info!(%workflow_id, %job_id, "workflow scheduled");
        Ok(())
    }

    /// Remove a workflow's cron job.
    pub async fn unschedule_workflow(&self, workflow_id: Uuid) -> Result<(), SchedulerError> {
        let entry = self
            .registrations
            .write()
            .await
            .remove(&workflow_id)
            .ok_or(SchedulerError::WorkflowNotFound(workflow_id))?;

        if let Some(scheduler) = self.inner.read().await.as_ref() {
            scheduler
                .remove(&entry.job_id)
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        }

        tracing::info!(%workflow_id, "workflow unscheduled");
        Ok(())
    }

    /// Reconcile registrations with a set of definitions.
    ///
    /// Active schedule-triggered workflows are (re)registered when new or when
    /// their cron expression changed; registrations for everything else are
    /// dropped. `baseline` supplies the last known fire per workflow.
    pub async fn sync_workflows(
        &self,
        defs: &[WorkflowDefinition],
        baseline: &HashMap<Uuid, DateTime<Utc>>,
        callback: CronCallback,
    ) -> Result<(), SchedulerError> {
        let mut wanted = HashMap::new();
        for def in defs {
            if let Some(schedule) = active_schedule(def) {
                wanted.insert(def.id, normalize_schedule(schedule)?);
            }
        }

        let stale: Vec<Uuid> = {
            let registrations = self.registrations.read().await;
            registrations
                .iter()
                .filter(|(id, reg)| wanted.get(*id) != Some(&reg.cron_expr))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale {
            self.unschedule_workflow(id).await?;
        }

        for (id, expr) in wanted {
            if self.registrations.read().await.contains_key(&id) {
                continue;
            }
            self.schedule_workflow(id, &expr, baseline.get(&id).copied(), Arc::clone(&callback))
                .await?;
        }
        Ok(())
    }

    /// Fire times each registered workflow missed between its last known fire
    /// and `now`. Workflows without a baseline are skipped.
    pub async fn check_missed_runs(&self, now: DateTime<Utc>) -> Vec<(Uuid, Vec<DateTime<Utc>>)> {
        let registrations = self.registrations.read().await;
        let mut missed = Vec::new();

        for (workflow_id, reg) in registrations.iter() {
            let Some(since) = reg.last_fired else {
                continue;
            };
            match missed_fires(&reg.cron_expr, since, now) {
                Ok(times) if !times.is_empty() => {
                    tracing::warn!(%workflow_id, count = times.len(), "detected missed cron runs");
                    missed.push((*workflow_id, times));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(%workflow_id, error = %e, "cannot evaluate schedule"),
            }
        }

        missed
    }

    /// Number of registered workflows.
    pub async fn workflow_count(&self) -> usize {
        self.registrations.read().await.len()
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use orbin_types::workflow::{StepConfig, StepSpec};

    fn noop_callback() -> CronCallback {
        Arc::new(|_id, _time| Box::pin(async {}))
    }

    fn scheduled(cron: &str, status: WorkflowStatus) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            name: "nightly".to_string(),
            description: None,
            status,
            version: 1,
            trigger: TriggerSpec::Schedule {
                cron: cron.to_string(),
                timezone: None,
            },
            steps: vec![StepSpec {
                id: "a".to_string(),
                name: "a".to_string(),
                config: StepConfig::Delay { duration_ms: 1 },
                retry_policy: None,
                continue_on_failure: false,
                timeout_ms: None,
            }],
            retry_policy: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // -------------------------------------------------------------------
    // normalize_schedule
    // -------------------------------------------------------------------

    #[test]
    fn test_five_field_cron_gains_seconds() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn test_six_field_cron_passthrough() {
        assert_eq!(normalize_schedule("30 */5 * * * *").unwrap(), "30 */5 * * * *");
    }

    #[test]
    fn test_readable_intervals() {
        assert_eq!(normalize_schedule("every 5 minutes").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("every 10 seconds").unwrap(), "*/10 * * * * *");
        assert_eq!(normalize_schedule("every 2 hours").unwrap(), "0 0 */2 * * *");
        assert_eq!(normalize_schedule("every 1 minute").unwrap(), "0 */1 * * * *");
        assert_eq!(normalize_schedule("Every 5 Minutes").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn test_readable_keywords() {
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_schedule("daily").unwrap(), "0 0 0 * * *");
        assert_eq!(normalize_schedule("every minute").unwrap(), "0 * * * * *");
    }

    #[test]
    fn test_every_day_at_time() {
        assert_eq!(normalize_schedule("every day at 09:30").unwrap(), "0 30 9 * * *");
        assert!(normalize_schedule("every day at 25:00").is_err());
    }

    #[test]
    fn test_unrecognized_and_zero_interval_rejected() {
        assert!(normalize_schedule("run whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every 3 fortnights").is_err());
    }

    #[test]
    fn test_malformed_cron_fields_rejected() {
        assert!(normalize_schedule("99 * * * *").is_err());
    }

    // -------------------------------------------------------------------
    // missed_fires / active_schedule
    // -------------------------------------------------------------------

    #[test]
    fn test_missed_fires_between_bounds() {
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = since + Duration::minutes(5) + Duration::seconds(30);
        let fires = missed_fires("every minute", since, now).unwrap();
        assert_eq!(fires.len(), 5);
        assert_eq!(fires[0], since + Duration::minutes(1));
        assert_eq!(fires[4], since + Duration::minutes(5));
    }

    #[test]
    fn test_no_missed_fires_inside_interval() {
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let fires = missed_fires("hourly", since, since + Duration::minutes(10)).unwrap();
        assert!(fires.is_empty());
    }

    #[test]
    fn test_only_active_schedule_workflows_are_scheduled() {
        assert_eq!(
            active_schedule(&scheduled("daily", WorkflowStatus::Active)),
            Some("daily")
        );
        assert_eq!(active_schedule(&scheduled("daily", WorkflowStatus::Paused)), None);
    }

    // -------------------------------------------------------------------
    // CronScheduler lifecycle
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_stop() {
        let scheduler = CronScheduler::new();
        scheduler.start().await.unwrap();
        assert_eq!(scheduler.workflow_count().await, 0);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_and_unschedule() {
        let scheduler = CronScheduler::new();
        scheduler.start().await.unwrap();

        let wf_id = Uuid::now_v7();
        scheduler
            .schedule_workflow(wf_id, "every 5 minutes", None, noop_callback())
            .await
            .unwrap();
        assert_eq!(scheduler.workflow_count().await, 1);

        scheduler.unschedule_workflow(wf_id).await.unwrap();
        assert_eq!(scheduler.workflow_count().await, 0);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_before_start_fails() {
        let scheduler = CronScheduler::new();
        let result = scheduler
            .schedule_workflow(Uuid::now_v7(), "every minute", None, noop_callback())
            .await;
        assert!(matches!(result, Err(SchedulerError::JobError(_))));
    }

    #[tokio::test]
    async fn test_unschedule_unknown_fails() {
        let scheduler = CronScheduler::new();
        scheduler.start().await.unwrap();
        let result = scheduler.unschedule_workflow(Uuid::now_v7()).await;
        assert!(matches!(result, Err(SchedulerError::WorkflowNotFound(_))));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_registers_active_and_drops_paused() {
        let scheduler = CronScheduler::new();
        scheduler.start().await.unwrap();

        let mut active = scheduled("daily", WorkflowStatus::Active);
        let paused = scheduled("hourly", WorkflowStatus::Paused);
        scheduler
            .sync_workflows(&[active.clone(), paused.clone()], &HashMap::new(), noop_callback())
            .await
            .unwrap();
        assert_eq!(scheduler.workflow_count().await, 1);

        active.status = WorkflowStatus::Paused;
        scheduler
            .sync_workflows(&[active, paused], &HashMap::new(), noop_callback())
            .await
            .unwrap();
        assert_eq!(scheduler.workflow_count().await, 0);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missed_runs_use_registration_baseline() {
        let scheduler = CronScheduler::new();
        scheduler.start().await.unwrap();

        let with_baseline = Uuid::now_v7();
        let without = Uuid::now_v7();
        let now = Utc::now();
        scheduler
            .schedule_workflow(
                with_baseline,
                "every minute",
                Some(now - Duration::minutes(10)),
                noop_callback(),
            )
            .await
            .unwrap();
        scheduler
            .schedule_workflow(without, "every minute", None, noop_callback())
            .await
            .unwrap();

        let missed = scheduler.check_missed_runs(now).await;
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].0, with_baseline);
        let count = missed[0].1.len();
        assert!((9..=10).contains(&count), "expected 9-10 missed runs, got {count}");
        scheduler.stop().await.unwrap();
    }
}
