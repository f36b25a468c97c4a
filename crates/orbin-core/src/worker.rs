//! In-process step worker.
//!
//! Step handlers are the executor side of the engine: they receive a
//! [`StepWork`] for one attempt and return the step's output or an error.
//! `LocalWorker` subscribes to `StepDispatched` events, runs the matching
//! handler from a [`HandlerRegistry`], and reports the result back through
//! [`ExecutionEngine::report_step_result`].
//!
//! Broadcast delivery is lossy: a worker that falls behind the bus re-reads
//! every running step from storage ([`LocalWorker::redispatch_running`]) so
//! no dispatched attempt is stranded.
//!
//! `StepHandler` uses RPITIT and is not object safe. The registry stores
//! handlers behind the object-safe [`StepHandlerDyn`], which every
//! `StepHandler` implements through a blanket impl with boxed futures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use orbin_types::event::{ExecutionEvent, StepWork};
use orbin_types::run::{StepError, StepOutcome};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{EngineError, ExecutionEngine, ReportOutcome};
use crate::repository::organization::OrganizationRepository;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Error returned by a step handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure. The attempt is retried while the budget allows.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure. The step fails without further attempts.
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn into_outcome(self) -> StepOutcome {
        let retryable = matches!(self, Self::Retryable(_));
        let message = match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        };
        StepOutcome::Failure {
            error: StepError::new(message),
            retryable,
        }
    }
}

/// Executes one attempt of a step.
pub trait StepHandler: Send + Sync {
    /// Name steps reference in their `handler` field.
    fn name(&self) -> &str;

    fn execute(
        &self,
        work: &StepWork,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        work: &'a StepWork,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn name(&self) -> &str {
        StepHandler::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        work: &'a StepWork,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send + 'a>> {
        Box::pin(self.execute(work))
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Step handlers by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn StepHandlerDyn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register<T: StepHandler + 'static>(&self, handler: T) {
        let name = StepHandler::name(&handler).to_string();
        tracing::debug!(handler = %name, "registered step handler");
        self.handlers.insert(name, Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandlerDyn>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LocalWorker
// ---------------------------------------------------------------------------

/// Runs dispatched steps whose handler is registered in this process.
///
/// Steps naming an unknown handler are left for an external executor.
pub struct LocalWorker<R: WorkflowRepository, O: OrganizationRepository> {
    engine: Arc<ExecutionEngine<R, O>>,
    registry: Arc<HandlerRegistry>,
    in_flight: DashSet<AttemptKey>,
}

/// (run, step, attempt, loop iteration)
type AttemptKey = (Uuid, String, u32, u32);

fn attempt_key(work: &StepWork) -> AttemptKey {
    (work.run_id, work.step_id.clone(), work.attempt, work.iteration)
}

impl<R, O> LocalWorker<R, O>
where
    R: WorkflowRepository + 'static,
    O: OrganizationRepository + 'static,
{
    pub fn new(engine: Arc<ExecutionEngine<R, O>>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            engine,
            registry,
            in_flight: DashSet::new(),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Run one attempt and report its outcome. Returns `None` when no
    /// handler is registered for the work.
    pub async fn execute(&self, work: StepWork) -> Result<Option<ReportOutcome>, EngineError> {
        let Some(handler) = self.registry.get(&work.handler) else {
            tracing::debug!(
                run_id = %work.run_id,
                step_id = %work.step_id,
                handler = %work.handler,
                "no local handler, leaving step to external executor"
            );
            return Ok(None);
        };

        let started = std::time::Instant::now();
        let outcome = match handler.execute_boxed(&work).await {
            Ok(output) => StepOutcome::Success { output },
            Err(e) => e.into_outcome(),
        };
        tracing::debug!(
            run_id = %work.run_id,
            step_id = %work.step_id,
            attempt = work.attempt,
            handler = %work.handler,
            elapsed_ms = started.elapsed().as_millis() as u64,
            success = matches!(outcome, StepOutcome::Success { .. }),
            "handler finished"
        );

        let reported = self
            .engine
            .report_step_result(&work.run_id, &work.step_id, work.attempt, outcome)
            .await?;
        Ok(Some(reported))
    }

    /// Execute `work` in its own task unless its handler is unknown or the
    /// same attempt is already executing here. Returns whether a task was
    /// started.
    fn launch(self: &Arc<Self>, work: StepWork) -> bool {
        if !self.registry.contains(&work.handler) {
            tracing::debug!(handler = %work.handler, "ignoring step for unknown handler");
            return false;
        }
        let key = attempt_key(&work);
        if !self.in_flight.insert(key.clone()) {
            tracing::debug!(run_id = %work.run_id, step_id = %work.step_id, attempt = work.attempt, "attempt already executing");
            return false;
        }

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let run_id = work.run_id;
            let step_id = work.step_id.clone();
            if let Err(e) = worker.execute(work).await {
                tracing::warn!(%run_id, %step_id, error = %e, "failed to report step result");
            }
            worker.in_flight.remove(&key);
        });
        true
    }

    /// Launch every running step this worker has a handler for. Returns the
    /// number of attempts started.
    pub async fn redispatch_running(self: &Arc<Self>) -> Result<usize, EngineError> {
        let work = self.engine.running_work().await?;
        let launched = work.into_iter().filter_map(|w| self.launch(w).then_some(())).count();
        if launched > 0 {
            tracing::info!(launched, "re-dispatched running steps");
        }
        Ok(launched)
    }

    /// Consume `StepDispatched` events until `cancel` fires. Each attempt
    /// runs in its own task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.engine.event_bus().subscribe();
        tokio::spawn(async move {
            tracing::info!(handlers = ?self.registry.names(), "local worker started");
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(ExecutionEvent::StepDispatched(work)) => {
                        self.launch(work);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "local worker lagged behind the event bus, rescanning");
                        if let Err(e) = self.redispatch_running().await {
                            tracing::warn!(error = %e, "rescan of running steps failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::info!("local worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::repository::memory::{InMemoryOrganizationRepository, InMemoryWorkflowRepository};
    use orbin_types::config::EngineConfig;
    use orbin_types::run::{RunStatus, StepStatus};
    use orbin_types::workflow::{
        StepConfig, StepSpec, TriggerSpec, TriggerType, WorkflowDefinition, WorkflowStatus,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    use crate::engine::CreateRunRequest;
    use crate::usage::UsageAccountant;

    type TestEngine = ExecutionEngine<InMemoryWorkflowRepository, InMemoryOrganizationRepository>;

    struct Upper;

    impl StepHandler for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn execute(&self, work: &StepWork) -> Result<Value, HandlerError> {
            let text = work.input.as_str().unwrap_or_default();
            Ok(json!(text.to_uppercase()))
        }
    }

    /// Fails with a retryable error until it has been called `fail_times`.
    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
    }

    impl StepHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _work: &StepWork) -> Result<Value, HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                Err(HandlerError::Retryable(format!("call {call} failed")))
            } else {
                Ok(json!({"calls": call}))
            }
        }
    }

    struct Reject;

    impl StepHandler for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        async fn execute(&self, _work: &StepWork) -> Result<Value, HandlerError> {
            Err(HandlerError::Fatal("input rejected".to_string()))
        }
    }

    fn engine() -> Arc<TestEngine> {
        engine_with_bus(EventBus::new(64))
    }

    fn engine_with_bus(bus: EventBus) -> Arc<TestEngine> {
        Arc::new(ExecutionEngine::new(
            Arc::new(InMemoryWorkflowRepository::new()),
            Arc::new(InMemoryOrganizationRepository::new()),
            bus,
            EngineConfig::default(),
        ))
    }

    fn action(id: &str, handler: &str) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Action {
                handler: handler.to_string(),
                params: Value::Null,
            },
            retry_policy: None,
            continue_on_failure: false,
            timeout_ms: None,
        }
    }

    async fn run_of(engine: &TestEngine, steps: Vec<StepSpec>, data: Value) -> Uuid {
        let def = engine
            .save_workflow(WorkflowDefinition {
                id: Uuid::now_v7(),
                organization_id: Uuid::now_v7(),
                name: "worker".to_string(),
                description: None,
                status: WorkflowStatus::Active,
                version: 0,
                trigger: TriggerSpec::Manual {},
                steps,
                retry_policy: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        engine
            .create_run(CreateRunRequest::new(def.organization_id, def.id, TriggerType::Manual, data))
            .await
            .unwrap()
            .run_id()
    }

    async fn wait_for_status(engine: &TestEngine, run_id: Uuid, status: RunStatus) {
        for _ in 0..200 {
            if engine.get_run(&run_id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never reached {status}");
    }

    #[test]
    fn test_handler_error_maps_to_outcome() {
        assert_eq!(
            HandlerError::Fatal("bad".to_string()).into_outcome(),
            StepOutcome::Failure {
                error: StepError::new("bad"),
                retryable: false
            }
        );
        assert!(matches!(
            HandlerError::Retryable("again".to_string()).into_outcome(),
            StepOutcome::Failure { retryable: true, .. }
        ));
    }

    #[test]
    fn test_registry_replaces_by_name() {
        let registry = HandlerRegistry::new();
        registry.register(Upper);
        registry.register(Reject);
        registry.register(Upper);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["reject".to_string(), "upper".to_string()]);
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_execute_reports_handler_output() {
        let engine = engine();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Upper);
        let worker = LocalWorker::new(Arc::clone(&engine), registry);

        let mut rx = engine.event_bus().subscribe();
        let run_id = run_of(&engine, vec![action("shout", "upper")], json!("hello")).await;
        let work = loop {
            if let ExecutionEvent::StepDispatched(work) = rx.recv().await.unwrap() {
                break work;
            }
        };

        let reported = worker.execute(work).await.unwrap();
        assert_eq!(reported, Some(ReportOutcome::Applied));
        let run = engine.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result, Some(json!({"shout": "HELLO"})));
    }

    #[tokio::test]
    async fn test_unknown_handler_is_left_alone() {
        let engine = engine();
        let worker = LocalWorker::new(Arc::clone(&engine), Arc::new(HandlerRegistry::new()));
        let mut rx = engine.event_bus().subscribe();
        let run_id = run_of(&engine, vec![action("remote", "http.post")], json!({})).await;
        let work = loop {
            if let ExecutionEvent::StepDispatched(work) = rx.recv().await.unwrap() {
                break work;
            }
        };

        assert_eq!(worker.execute(work).await.unwrap(), None);
        let step = engine.workflows().get_step(&run_id, "remote").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_spawned_worker_drives_run_to_completion() {
        let engine = engine();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Upper);
        registry.register(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 1,
        });
        let cancel = CancellationToken::new();
        let handle = Arc::new(LocalWorker::new(Arc::clone(&engine), registry)).spawn(cancel.clone());

        let run_id = run_of(
            &engine,
            vec![action("shout", "upper"), action("retry", "flaky")],
            json!("go"),
        )
        .await;

        // The flaky step waits on its retry timer.
        for _ in 0..200 {
            let step = engine.workflows().get_step(&run_id, "retry").await.unwrap();
            if step.is_some_and(|s| s.status == StepStatus::Retrying) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.tick(chrono::Utc::now() + chrono::Duration::minutes(5)).await;
        wait_for_status(&engine, run_id, RunStatus::Completed).await;

        let run = engine.get_run(&run_id).await.unwrap();
        assert_eq!(run.step("retry").unwrap().attempt, 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_handler_error_fails_run() {
        let engine = engine();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Reject);
        let cancel = CancellationToken::new();
        let handle = Arc::new(LocalWorker::new(Arc::clone(&engine), registry)).spawn(cancel.clone());

        let run_id = run_of(&engine, vec![action("check", "reject")], json!({})).await;
        wait_for_status(&engine, run_id, RunStatus::Failed).await;

        let run = engine.get_run(&run_id).await.unwrap();
        assert_eq!(run.error.unwrap().message, "input rejected");
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_worker_still_completes_every_run() {
        let engine = engine_with_bus(EventBus::new(4));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Upper);
        let cancel = CancellationToken::new();
        let handle = Arc::new(LocalWorker::new(Arc::clone(&engine), registry)).spawn(cancel.clone());
        let accountant = Arc::new(UsageAccountant::new(
            Arc::clone(engine.workflows()),
            Arc::clone(engine.organizations()),
        ))
        .spawn(engine.event_bus(), cancel.clone());

        let def = engine
            .save_workflow(WorkflowDefinition {
                id: Uuid::now_v7(),
                organization_id: Uuid::now_v7(),
                name: "burst".to_string(),
                description: None,
                status: WorkflowStatus::Active,
                version: 0,
                trigger: TriggerSpec::Manual {},
                steps: vec![action("shout", "upper")],
                retry_policy: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        // Far more events than the bus holds, with no yield in between.
        let mut run_ids = Vec::new();
        for i in 0..20 {
            let req = CreateRunRequest::new(
                def.organization_id,
                def.id,
                TriggerType::Manual,
                json!(format!("run {i}")),
            );
            run_ids.push(engine.create_run(req).await.unwrap().run_id());
        }

        for run_id in &run_ids {
            wait_for_status(&engine, *run_id, RunStatus::Completed).await;
        }
        let mut counted = 0;
        for _ in 0..200 {
            counted = engine
                .organization_settings(&def.organization_id)
                .await
                .unwrap()
                .current_executions;
            if counted == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counted, 20);

        cancel.cancel();
        handle.await.unwrap();
        accountant.await.unwrap();
    }

    #[tokio::test]
    async fn test_redispatch_picks_up_missed_steps() {
        let engine = engine();
        // Dispatched before any worker subscribed, so the event is gone.
        let run_id = run_of(&engine, vec![action("shout", "upper"), action("remote", "http.post")], json!("late")).await;
        assert_eq!(
            engine.workflows().get_step(&run_id, "shout").await.unwrap().unwrap().status,
            StepStatus::Running
        );

        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Upper);
        let worker = Arc::new(LocalWorker::new(Arc::clone(&engine), registry));
        assert_eq!(worker.redispatch_running().await.unwrap(), 1);

        for _ in 0..200 {
            let step = engine.workflows().get_step(&run_id, "remote").await.unwrap();
            if step.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let run = engine.get_run(&run_id).await.unwrap();
        assert_eq!(run.step("shout").unwrap().output, Some(json!("LATE")));
        // The remote step has no local handler and is left running.
        assert_eq!(run.step("remote").unwrap().status, StepStatus::Running);
        assert_eq!(worker.redispatch_running().await.unwrap(), 0);
    }
}
