//! `orbin serve`: the REST API plus the background services that keep runs
//! moving.
//!
//! Background services share one cancellation token:
//! - the local worker executing built-in step handlers (`worker_enabled`)
//! - the usage accountant counting finished runs per organization
//! - the cron scheduler for schedule-triggered workflows
//! - the timer loop firing retries, delays, step timeouts and run deadlines,
//!   which also re-syncs webhooks, schedules and persisted timers so
//!   definitions saved by other processes are picked up

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use orbin_core::usage::UsageAccountant;
use orbin_core::worker::LocalWorker;
use orbin_core::workflow::scheduler::{CronCallback, CronScheduler};

use crate::state::{AppState, Ingestor};

/// How often definitions and persisted timers are re-read.
const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let recovered = state.engine.recover().await.context("Failed to recover runs")?;
    let webhooks = state.sync_webhooks().await?;
    tracing::info!(recovered, webhooks, "engine state restored");

    let services = BackgroundServices::start(&state).await?;

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!(
        "  {} Orbin API listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!(
        "  {} webhook path(s), {} scheduled workflow(s), {} pending timer(s)",
        webhooks,
        services.scheduler.workflow_count().await,
        state.engine.pending_timers().await
    );
    println!("  Data: {}", console::style(state.data_dir.display()).dim());
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let db_pool = state.db_pool.clone();
    let router = crate::http::router::build_router(state);
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await;

    services.stop().await;
    db_pool.writer.close().await;
    db_pool.reader.close().await;
    println!("\n  Server stopped.");
    served.map_err(Into::into)
}

struct BackgroundServices {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    scheduler: Arc<CronScheduler>,
}

impl BackgroundServices {
    async fn start(state: &AppState) -> Result<Self> {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let accountant = Arc::new(UsageAccountant::new(
            Arc::clone(state.engine.workflows()),
            Arc::clone(state.engine.organizations()),
        ));
        handles.push(Arc::clone(&accountant).spawn(state.engine.event_bus(), cancel.clone()));
        // Runs finished while no accountant was listening.
        accountant.reconcile().await.context("Failed to reconcile usage")?;

        if state.engine.config().worker_enabled {
            let worker = Arc::new(LocalWorker::new(
                Arc::clone(&state.engine),
                Arc::clone(&state.handlers),
            ));
            handles.push(Arc::clone(&worker).spawn(cancel.clone()));
            // Steps left running by a previous process have no live event.
            worker
                .redispatch_running()
                .await
                .context("Failed to re-dispatch running steps")?;
        } else {
            tracing::info!("local worker disabled, steps wait for external workers");
        }

        let scheduler = Arc::new(CronScheduler::new());
        scheduler.start().await.context("Failed to start cron scheduler")?;
        let callback = schedule_callback(state.ingestor.clone());
        sync_schedules(state, &scheduler, &callback).await?;
        catch_up_missed(state, &scheduler).await;

        handles.push(spawn_timer_loop(
            state.clone(),
            Arc::clone(&scheduler),
            callback,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            handles,
            scheduler,
        })
    }

    async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task failed");
            }
        }
        if let Err(e) = self.scheduler.stop().await {
            tracing::warn!(error = %e, "cron scheduler shutdown failed");
        }
    }
}

fn schedule_callback(ingestor: Ingestor) -> CronCallback {
    Arc::new(move |workflow_id, fired_at| {
        let ingestor = ingestor.clone();
        Box::pin(async move {
            match ingestor.fire_schedule(&workflow_id, fired_at).await {
                Ok(outcome) => {
                    tracing::debug!(%workflow_id, run_id = %outcome.run_id(), "scheduled run started")
                }
                Err(e) => tracing::warn!(%workflow_id, error = %e, "scheduled run failed to start"),
            }
        })
    })
}

async fn sync_schedules(state: &AppState, scheduler: &CronScheduler, callback: &CronCallback) -> Result<usize> {
    let defs = state.engine.list_workflows(None).await?;
    let baseline = state.ingestor.schedule_baseline(&defs).await?;
    scheduler
        .sync_workflows(&defs, &baseline, Arc::clone(callback))
        .await
        .context("Failed to sync schedules")?;
    Ok(scheduler.workflow_count().await)
}

/// Fire the most recent missed slot per workflow. Older misses are dropped
/// rather than replayed as a burst.
async fn catch_up_missed(state: &AppState, scheduler: &CronScheduler) {
    for (workflow_id, times) in scheduler.check_missed_runs(Utc::now()).await {
        let Some(latest) = times.last().copied() else {
            continue;
        };
        tracing::info!(%workflow_id, missed = times.len(), %latest, "catching up missed schedule");
        if let Err(e) = state.ingestor.fire_schedule(&workflow_id, latest).await {
            tracing::warn!(%workflow_id, error = %e, "missed schedule catch-up failed");
        }
    }
}

fn spawn_timer_loop(
    state: AppState,
    scheduler: Arc<CronScheduler>,
    callback: CronCallback,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let poll = Duration::from_millis(state.engine.config().poll_interval_ms.max(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut resync = tokio::time::interval(RESYNC_INTERVAL);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first resync tick completes immediately; startup already synced.
        resync.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let fired = state.engine.tick(Utc::now()).await;
                    if fired > 0 {
                        tracing::debug!(fired, "timers fired");
                    }
                }
                _ = resync.tick() => resync_once(&state, &scheduler, &callback).await,
            }
        }
        tracing::info!("timer loop stopped");
    })
}

async fn resync_once(state: &AppState, scheduler: &CronScheduler, callback: &CronCallback) {
    match state.engine.refresh_timers().await {
        Ok(loaded) => tracing::trace!(loaded, "timers refreshed"),
        Err(e) => tracing::warn!(error = %e, "timer refresh failed"),
    }
    if let Err(e) = state.sync_webhooks().await {
        tracing::warn!(error = %e, "webhook sync failed");
    }
    if let Err(e) = sync_schedules(state, scheduler, callback).await {
        tracing::warn!(error = %e, "schedule sync failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use orbin_core::workflow::definition::parse_workflow_yaml;
    use orbin_types::run::RunFilter;
    use orbin_types::workflow::TriggerType;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_schedule_callback_starts_run_once_per_slot() {
        let state = test_state().await;
        let org = Uuid::now_v7();
        let mut def = parse_workflow_yaml(
            r#"
name: hourly
status: active
trigger: { type: schedule, cron: "0 0 * * * *" }
steps:
  - id: ping
    name: Ping
    config: { type: action, handler: echo }
"#,
        )
        .unwrap();
        def.organization_id = org;
        let def = state.engine.save_workflow(def).await.unwrap();

        let callback = schedule_callback(state.ingestor.clone());
        let slot = Utc::now();
        callback(def.id, slot).await;
        callback(def.id, slot).await;

        let runs = state.engine.list_runs(&org, &RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger_type, TriggerType::Schedule);
    }

    #[tokio::test]
    async fn test_sync_schedules_registers_active_schedules() {
        let state = test_state().await;
        let org = Uuid::now_v7();
        let mut def = parse_workflow_yaml(
            r#"
name: daily
status: active
trigger: { type: schedule, cron: "0 0 9 * * *" }
steps:
  - id: ping
    name: Ping
    config: { type: action, handler: echo }
"#,
        )
        .unwrap();
        def.organization_id = org;
        let def = state.engine.save_workflow(def).await.unwrap();

        let scheduler = CronScheduler::new();
        scheduler.start().await.unwrap();
        let callback = schedule_callback(state.ingestor.clone());
        assert_eq!(sync_schedules(&state, &scheduler, &callback).await.unwrap(), 1);

        state
            .engine
            .set_workflow_status(&org, &def.id, orbin_types::workflow::WorkflowStatus::Paused)
            .await
            .unwrap();
        assert_eq!(sync_schedules(&state, &scheduler, &callback).await.unwrap(), 0);
        scheduler.stop().await.unwrap();
    }
}
