//! Usage accounting driven by `RunFinished` events.
//!
//! The engine never touches organization counters. This listener consumes
//! the event bus and increments the organization's execution counter once
//! per finished run. Each run is claimed in storage before it is counted, so
//! a run is never counted twice. When the listener lags behind the bus it
//! sweeps storage for terminal runs nobody has claimed yet.

use std::sync::Arc;

use orbin_types::error::RepositoryError;
use orbin_types::event::ExecutionEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::organization::OrganizationRepository;
use crate::repository::workflow::WorkflowRepository;

pub struct UsageAccountant<R: WorkflowRepository, O: OrganizationRepository> {
    workflows: Arc<R>,
    organizations: Arc<O>,
}

impl<R, O> UsageAccountant<R, O>
where
    R: WorkflowRepository + 'static,
    O: OrganizationRepository + 'static,
{
    pub fn new(workflows: Arc<R>, organizations: Arc<O>) -> Self {
        Self {
            workflows,
            organizations,
        }
    }

    /// Apply one event. Returns whether it was counted.
    pub async fn record(&self, event: &ExecutionEvent) -> Result<bool, RepositoryError> {
        let ExecutionEvent::RunFinished {
            run_id,
            organization_id,
            ..
        } = event
        else {
            return Ok(false);
        };
        self.count(run_id, organization_id).await
    }

    /// Count every terminal run that has not been counted yet.
    pub async fn reconcile(&self) -> Result<usize, RepositoryError> {
        let mut counted = 0;
        for run in self.workflows.list_uncounted_runs().await? {
            if self.count(&run.id, &run.organization_id).await? {
                counted += 1;
            }
        }
        if counted > 0 {
            tracing::info!(counted, "usage reconciled from storage");
        }
        Ok(counted)
    }

    async fn count(&self, run_id: &Uuid, organization_id: &Uuid) -> Result<bool, RepositoryError> {
        if !self.workflows.claim_usage(run_id).await? {
            tracing::trace!(%run_id, "run already counted");
            return Ok(false);
        }
        self.organizations.increment_usage(organization_id, 1).await?;
        tracing::debug!(%run_id, %organization_id, "run counted");
        Ok(true)
    }

    /// Consume the bus until `cancel` fires.
    pub fn spawn(self: Arc<Self>, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if let Err(e) = self.record(&event).await {
                            tracing::warn!(run_id = %event.run_id(), error = %e, "usage update failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "usage accounting lagged, reconciling from storage");
                        if let Err(e) = self.reconcile().await {
                            tracing::warn!(error = %e, "usage reconciliation failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CreateRunRequest, ExecutionEngine};
    use crate::repository::memory::{InMemoryOrganizationRepository, InMemoryWorkflowRepository};
    use chrono::Utc;
    use orbin_types::config::EngineConfig;
    use orbin_types::run::RunStatus;
    use orbin_types::workflow::{
        StepConfig, StepSpec, TriggerSpec, TriggerType, WorkflowDefinition, WorkflowStatus,
    };
    use serde_json::{Value, json};
    use std::time::Duration;

    type TestEngine = ExecutionEngine<InMemoryWorkflowRepository, InMemoryOrganizationRepository>;

    fn engine_with_bus(bus: EventBus) -> Arc<TestEngine> {
        Arc::new(ExecutionEngine::new(
            Arc::new(InMemoryWorkflowRepository::new()),
            Arc::new(InMemoryOrganizationRepository::new()),
            bus,
            EngineConfig::default(),
        ))
    }

    type TestAccountant = UsageAccountant<InMemoryWorkflowRepository, InMemoryOrganizationRepository>;

    fn accountant(engine: &TestEngine) -> Arc<TestAccountant> {
        Arc::new(UsageAccountant::new(
            Arc::clone(engine.workflows()),
            Arc::clone(engine.organizations()),
        ))
    }

    async fn save(engine: &TestEngine) -> WorkflowDefinition {
        engine
            .save_workflow(WorkflowDefinition {
                id: Uuid::now_v7(),
                organization_id: Uuid::now_v7(),
                name: "billing".to_string(),
                description: None,
                status: WorkflowStatus::Active,
                version: 0,
                trigger: TriggerSpec::Manual {},
                steps: vec![StepSpec {
                    id: "charge".to_string(),
                    name: "Charge".to_string(),
                    config: StepConfig::Action {
                        handler: "remote.charge".to_string(),
                        params: Value::Null,
                    },
                    retry_policy: None,
                    continue_on_failure: false,
                    timeout_ms: None,
                }],
                retry_policy: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    /// Create a run and cancel it so it finishes without a worker.
    async fn finished_run(engine: &TestEngine, def: &WorkflowDefinition) -> Uuid {
        let req = CreateRunRequest::new(def.organization_id, def.id, TriggerType::Manual, json!({}));
        let run_id = engine.create_run(req).await.unwrap().run_id();
        engine.cancel_run(&run_id).await.unwrap();
        run_id
    }

    async fn executions(engine: &TestEngine, org: &Uuid) -> u64 {
        engine
            .organization_settings(org)
            .await
            .unwrap()
            .current_executions
    }

    #[tokio::test]
    async fn test_counts_each_finished_run_once() {
        let engine = engine_with_bus(EventBus::new(64));
        let accountant = accountant(&engine);
        let def = save(&engine).await;
        let run_id = finished_run(&engine, &def).await;

        let event = ExecutionEvent::RunFinished {
            run_id,
            organization_id: def.organization_id,
            workflow_id: def.id,
            status: RunStatus::Canceled,
            duration_ms: Some(5),
        };
        assert!(accountant.record(&event).await.unwrap());
        assert!(!accountant.record(&event).await.unwrap());

        let skipped = ExecutionEvent::StepSkipped {
            run_id,
            step_id: "charge".to_string(),
        };
        assert!(!accountant.record(&skipped).await.unwrap());
        assert_eq!(executions(&engine, &def.organization_id).await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_counts_runs_missed_on_the_bus() {
        let engine = engine_with_bus(EventBus::new(64));
        let def = save(&engine).await;
        // Finished while no accountant was listening.
        for _ in 0..3 {
            finished_run(&engine, &def).await;
        }

        let accountant = accountant(&engine);
        assert_eq!(accountant.reconcile().await.unwrap(), 3);
        assert_eq!(accountant.reconcile().await.unwrap(), 0);
        assert_eq!(executions(&engine, &def.organization_id).await, 3);
    }

    #[tokio::test]
    async fn test_lagging_accountant_counts_every_run() {
        let engine = engine_with_bus(EventBus::new(4));
        let cancel = CancellationToken::new();
        let handle = accountant(&engine).spawn(engine.event_bus(), cancel.clone());

        let def = save(&engine).await;
        // Far more events than the bus holds, with no yield in between.
        for _ in 0..20 {
            finished_run(&engine, &def).await;
        }

        let mut counted = 0;
        for _ in 0..200 {
            counted = executions(&engine, &def.organization_id).await;
            if counted == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counted, 20);

        cancel.cancel();
        handle.await.unwrap();
    }
}
