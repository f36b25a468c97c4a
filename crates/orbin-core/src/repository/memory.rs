//! Process-local repositories backed by `tokio::sync::Mutex`.
//!
//! Every operation takes the state lock once, so each compare-and-set is
//! atomic with respect to every other call on the same repository.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use orbin_types::error::RepositoryError;
use orbin_types::event::EventRecord;
use orbin_types::organization::OrganizationSettings;
use orbin_types::run::{RunFilter, RunStatus, StepExecution, WorkflowRun};
use orbin_types::workflow::WorkflowDefinition;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::organization::OrganizationRepository;
use super::workflow::{RunInsert, WorkflowRepository};
use crate::workflow::step::StepVersion;

#[derive(Default)]
struct State {
    /// workflow id -> version -> definition
    definitions: HashMap<Uuid, BTreeMap<u32, WorkflowDefinition>>,
    runs: HashMap<Uuid, WorkflowRun>,
    /// run id -> step records in creation order
    steps: HashMap<Uuid, Vec<StepExecution>>,
    /// (workflow id, key) -> (run id, created at)
    idempotency: HashMap<(Uuid, String), (Uuid, DateTime<Utc>)>,
    events: Vec<EventRecord>,
    /// runs already counted toward usage
    counted: HashSet<Uuid>,
}

/// In-memory `WorkflowRepository`.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    state: Mutex<State>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let versions = state.definitions.entry(def.id).or_default();
        if versions.contains_key(&def.version) {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} version {} already exists",
                def.id, def.version
            )));
        }
        versions.insert(def.version, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .definitions
            .get(id)
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    async fn get_definition_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .definitions
            .get(id)
            .and_then(|versions| versions.get(&version).cloned()))
    }

    async fn list_definitions(
        &self,
        organization_id: Option<&Uuid>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        let mut defs: Vec<_> = state
            .definitions
            .values()
            .filter_map(|versions| versions.values().next_back())
            .filter(|def| organization_id.is_none_or(|org| def.organization_id == *org))
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn insert_run(
        &self,
        run: &WorkflowRun,
        dedupe_since: DateTime<Utc>,
    ) -> Result<RunInsert, RepositoryError> {
        let mut state = self.state.lock().await;

        if let Some(key) = &run.idempotency_key {
            let slot = (run.workflow_id, key.clone());
            match state.idempotency.get(&slot) {
                Some((existing, created_at)) if *created_at >= dedupe_since => {
                    return Ok(RunInsert::Existing(*existing));
                }
                _ => {}
            }
            state.idempotency.insert(slot, (run.id, run.created_at));
        }

        if state.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} already exists", run.id)));
        }
        let mut stored = run.clone();
        stored.steps.clear();
        state.runs.insert(run.id, stored);
        Ok(RunInsert::Created)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.state.lock().await.runs.get(run_id).cloned())
    }

    async fn list_runs(
        &self,
        organization_id: &Uuid,
        filter: &RunFilter,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|r| r.organization_id == *organization_id)
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| filter.workflow_id.is_none_or(|w| r.workflow_id == w))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            runs.truncate(limit as usize);
        }
        Ok(runs)
    }

    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn compare_and_set_run(
        &self,
        run: &WorkflowRun,
        expected: RunStatus,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .runs
            .get_mut(&run.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.status != expected {
            return Ok(false);
        }
        *stored = run.clone();
        stored.steps.clear();
        Ok(true)
    }

    async fn claim_usage(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let terminal = state
            .runs
            .get(run_id)
            .ok_or(RepositoryError::NotFound)?
            .status
            .is_terminal();
        Ok(terminal && state.counted.insert(*run_id))
    }

    async fn list_uncounted_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|r| r.status.is_terminal() && !state.counted.contains(&r.id))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn insert_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let steps = state.steps.entry(step.run_id).or_default();
        if steps.iter().any(|s| s.step_id == step.step_id) {
            return Err(RepositoryError::Conflict(format!(
                "run {} already has a record for step '{}'",
                step.run_id, step.step_id
            )));
        }
        steps.push(step.clone());
        Ok(())
    }

    async fn get_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .get(run_id)
            .and_then(|steps| steps.iter().find(|s| s.step_id == step_id).cloned()))
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepExecution>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.steps.get(run_id).cloned().unwrap_or_default())
    }

    async fn compare_and_set_step(
        &self,
        step: &StepExecution,
        expected: StepVersion,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .steps
            .get_mut(&step.run_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.step_id == step.step_id))
            .ok_or(RepositoryError::NotFound)?;
        if StepVersion::of(stored) != expected {
            return Ok(false);
        }
        *stored = step.clone();
        Ok(true)
    }

    async fn list_step_timers(&self) -> Result<Vec<StepExecution>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .values()
            .flatten()
            .filter(|s| !s.status.is_terminal())
            .filter(|s| s.next_retry_at.is_some() || s.resume_at.is_some() || s.timeout_at.is_some())
            .cloned()
            .collect())
    }

    async fn record_event(&self, event: &EventRecord) -> Result<(), RepositoryError> {
        self.state.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        organization_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| e.organization_id == *organization_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn latest_event(
        &self,
        workflow_id: &Uuid,
        event_type: &str,
    ) -> Result<Option<EventRecord>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .rev()
            .find(|e| e.workflow_id == Some(*workflow_id) && e.event_type == event_type)
            .cloned())
    }
}

/// In-memory `OrganizationRepository`.
#[derive(Default)]
pub struct InMemoryOrganizationRepository {
    settings: Mutex<HashMap<Uuid, OrganizationSettings>>,
}

impl InMemoryOrganizationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrganizationRepository for InMemoryOrganizationRepository {
    async fn get_settings(
        &self,
        organization_id: &Uuid,
    ) -> Result<Option<OrganizationSettings>, RepositoryError> {
        Ok(self.settings.lock().await.get(organization_id).cloned())
    }

    async fn save_settings(&self, settings: &OrganizationSettings) -> Result<(), RepositoryError> {
        let mut all = self.settings.lock().await;
        let current_executions = all
            .get(&settings.organization_id)
            .map_or(0, |s| s.current_executions);
        let mut stored = settings.clone();
        stored.current_executions = current_executions;
        all.insert(settings.organization_id, stored);
        Ok(())
    }

    async fn increment_usage(&self, organization_id: &Uuid, delta: u64) -> Result<(), RepositoryError> {
        let mut all = self.settings.lock().await;
        let entry = all
            .entry(*organization_id)
            .or_insert_with(|| OrganizationSettings::new(*organization_id));
        entry.current_executions += delta;
        entry.updated_at = Utc::now();
        Ok(())
    }
}
