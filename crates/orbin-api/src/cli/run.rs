//! CLI run subcommands: trigger, list, show, cancel, replay.
//!
//! `trigger` and `replay` drive the run in-process: a local worker executes
//! built-in handlers while this process fires timers, until the run finishes
//! or Ctrl+C detaches. Steps whose handler is not built in wait for an
//! external worker to report through the REST API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbin_core::engine::CreateRunOutcome;
use orbin_core::trigger::TriggerEvent;
use orbin_core::usage::UsageAccountant;
use orbin_core::worker::LocalWorker;
use orbin_types::run::{RunFilter, RunStatus, WorkflowRun};
use orbin_types::workflow::TriggerType;

use crate::cli::{parse_json_arg, run_status_cell, short_id, step_status_cell};
use crate::state::AppState;

/// Run subcommands.
#[derive(Subcommand)]
pub enum RunCommand {
    /// List runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, running, completed, failed, canceled, timed_out).
        #[arg(long)]
        status: Option<String>,

        /// Filter by workflow UUID.
        #[arg(long)]
        workflow: Option<Uuid>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a run and its step executions.
    Show {
        /// Run UUID.
        id: Uuid,
    },

    /// Cancel a pending or running run.
    Cancel {
        /// Run UUID.
        id: Uuid,
    },

    /// Start a new run of the same workflow version with the same trigger data.
    Replay {
        /// Run UUID to replay.
        id: Uuid,

        /// Return immediately and leave the run to other workers.
        #[arg(long)]
        detach: bool,
    },
}

/// Arguments of `orbin trigger`.
pub struct TriggerArgs {
    pub workflow_id: Uuid,
    pub data: Option<String>,
    pub key: Option<String>,
    pub timeout_secs: Option<u64>,
    pub detach: bool,
}

/// Handle a run subcommand.
pub async fn handle_run_command(cmd: RunCommand, state: &AppState, org: Uuid, json: bool) -> Result<()> {
    match cmd {
        RunCommand::List {
            status,
            workflow,
            limit,
        } => handle_list(status.as_deref(), workflow, limit, state, org, json).await,
        RunCommand::Show { id } => {
            let run = owned_run(state, org, &id).await?;
            display_run(&run, json)
        }
        RunCommand::Cancel { id } => handle_cancel(&id, state, org, json).await,
        RunCommand::Replay { id, detach } => handle_replay(&id, detach, state, org, json).await,
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

pub async fn handle_trigger(args: TriggerArgs, state: &AppState, org: Uuid, json: bool) -> Result<()> {
    let payload = parse_json_arg(args.data.as_deref())?;
    let mut event = TriggerEvent::new(org, args.workflow_id, TriggerType::Manual, "cli", payload);
    event.event_id = args.key;
    event.timeout = args.timeout_secs.map(Duration::from_secs);

    // The worker subscribes before the run exists so the first dispatch is seen.
    let worker = (!args.detach).then(|| start_local_worker(state));

    let outcome = state.ingestor.ingest(event).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            stop_local_worker(worker).await;
            return Err(anyhow::Error::new(e).context("Failed to trigger workflow"));
        }
    };

    if let CreateRunOutcome::Duplicate(run_id) = outcome {
        stop_local_worker(worker).await;
        let run = state.engine.get_run(&run_id).await?;
        if !json {
            println!();
            println!(
                "  {} Idempotency key matched run '{}'",
                style("=").yellow().bold(),
                style(short_id(&run_id)).cyan()
            );
        }
        return display_run(&run, json);
    }

    let run_id = outcome.run_id();
    finish(state, run_id, worker, json).await
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    status: Option<&str>,
    workflow_id: Option<Uuid>,
    limit: u32,
    state: &AppState,
    org: Uuid,
    json: bool,
) -> Result<()> {
    let status = status
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;
    let filter = RunFilter {
        status,
        workflow_id,
        limit: Some(limit),
    };
    let runs = state
        .engine
        .list_runs(&org, &filter)
        .await
        .context("Failed to list runs")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Created"),
            Cell::new("Duration"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(short_id(&r.workflow_id)),
            Cell::new(r.workflow_version),
            run_status_cell(r.status),
            Cell::new(r.trigger_type.as_str()),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(format_duration(r.duration_ms)),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

fn display_run(run: &WorkflowRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Run:").bold(),
        style(run.id).cyan()
    );
    println!(
        "  Workflow: {} (version {})",
        run.workflow_id, run.workflow_version
    );
    println!("  Status: {}", run_status_label(run.status));
    println!("  Trigger: {}", run.trigger_type);
    if let Some(source) = run.replay_of {
        println!("  Replay of: {source}");
    }
    if let Some(started) = run.started_at {
        println!("  Started: {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(deadline) = run.deadline_at {
        println!("  Deadline: {}", deadline.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = run.error {
        let at = err
            .step_id
            .as_deref()
            .map(|s| format!(" (step {s})"))
            .unwrap_or_default();
        println!("  Error: {}{at}", style(&err.message).red());
    }
    println!();

    if !run.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Attempt"),
                Cell::new("Iteration"),
                Cell::new("Duration"),
                Cell::new("Error"),
            ]);

        for s in &run.steps {
            let error = s
                .error
                .as_ref()
                .map(|e| e.message.chars().take(48).collect::<String>())
                .unwrap_or_else(|| "-".to_string());
            table.add_row(vec![
                Cell::new(&s.step_id),
                step_status_cell(s.status),
                Cell::new(format!("{}/{}", s.attempt, s.max_attempts())),
                Cell::new(s.iteration),
                Cell::new(format_duration(s.duration_ms)),
                Cell::new(error),
            ]);
        }

        println!("{table}");
        println!();
    }

    if let Some(ref result) = run.result {
        println!("  {}", style("Result:").bold());
        for line in serde_json::to_string_pretty(result)?.lines() {
            println!("    {line}");
        }
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel / Replay
// ---------------------------------------------------------------------------

async fn handle_cancel(id: &Uuid, state: &AppState, org: Uuid, json: bool) -> Result<()> {
    let run = owned_run(state, org, id).await?;
    if run.status.is_terminal() {
        bail!("Run has already finished (status: {}). Cannot cancel.", run.status);
    }

    state
        .engine
        .cancel_run(id)
        .await
        .context("Failed to cancel run")?;

    if json {
        println!(
            "{}",
            serde_json::json!({"canceled": id.to_string(), "status": "canceled"})
        );
    } else {
        println!();
        println!(
            "  {} Canceled run '{}'",
            style("*").green().bold(),
            style(short_id(id)).cyan()
        );
        println!();
    }

    Ok(())
}

async fn handle_replay(id: &Uuid, detach: bool, state: &AppState, org: Uuid, json: bool) -> Result<()> {
    owned_run(state, org, id).await?;

    let worker = (!detach).then(|| start_local_worker(state));
    let run_id = match state.engine.replay_run(id).await {
        Ok(run_id) => run_id,
        Err(e) => {
            stop_local_worker(worker).await;
            return Err(anyhow::Error::new(e).context("Failed to replay run"));
        }
    };

    if !json {
        println!();
        println!(
            "  {} Replaying run '{}' as '{}'",
            style("*").green().bold(),
            style(short_id(id)).cyan(),
            style(short_id(&run_id)).cyan()
        );
    }
    finish(state, run_id, worker, json).await
}

// ---------------------------------------------------------------------------
// In-process driving
// ---------------------------------------------------------------------------

/// Local worker executing built-in handlers while the CLI follows a run.
struct RunningWorker {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

fn start_local_worker(state: &AppState) -> RunningWorker {
    let cancel = CancellationToken::new();
    let worker = Arc::new(LocalWorker::new(
        Arc::clone(&state.engine),
        Arc::clone(&state.handlers),
    ));
    let handle = worker.spawn(cancel.clone());
    RunningWorker { cancel, handle }
}

/// Count runs finished by this process. Anything left over is picked up by
/// `orbin serve` at startup.
async fn count_usage(state: &AppState) {
    let accountant = UsageAccountant::new(
        Arc::clone(state.engine.workflows()),
        Arc::clone(state.engine.organizations()),
    );
    if let Err(e) = accountant.reconcile().await {
        tracing::warn!(error = %e, "usage reconciliation failed");
    }
}

async fn stop_local_worker(worker: Option<RunningWorker>) {
    let Some(worker) = worker else {
        return;
    };
    // Let in-flight bus events drain before cancellation.
    tokio::task::yield_now().await;
    worker.cancel.cancel();
    if let Err(e) = worker.handle.await {
        tracing::warn!(error = %e, "local worker task failed");
    }
}

/// Follow a freshly created run (unless detached) and print it.
async fn finish(state: &AppState, run_id: Uuid, worker: Option<RunningWorker>, json: bool) -> Result<()> {
    let run = if worker.is_some() {
        let run = follow_run(state, run_id).await;
        stop_local_worker(worker).await;
        count_usage(state).await;
        run?
    } else {
        if !json {
            println!();
            println!(
                "  Run '{}' created. Check progress: {}",
                style(short_id(&run_id)).cyan(),
                style(format!("orbin runs show {run_id}")).dim()
            );
        }
        state.engine.get_run(&run_id).await?
    };
    display_run(&run, json)
}

/// Fire due timers until the run is terminal or Ctrl+C is pressed.
async fn follow_run(state: &AppState, run_id: Uuid) -> Result<WorkflowRun> {
    let poll = Duration::from_millis(state.engine.config().poll_interval_ms.max(50));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        state.engine.tick(chrono::Utc::now()).await;
        let run = state.engine.get_run(&run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = &mut ctrl_c => {
                eprintln!(
                    "\n  Detached from run '{}' ({}). It resumes under `orbin serve`.",
                    short_id(&run_id),
                    run.status
                );
                return Ok(run);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn owned_run(state: &AppState, org: Uuid, id: &Uuid) -> Result<WorkflowRun> {
    let run = state
        .engine
        .get_run(id)
        .await
        .with_context(|| format!("Run '{id}' not found"))?;
    if run.organization_id != org {
        bail!("Run '{id}' not found");
    }
    Ok(run)
}

fn run_status_label(status: RunStatus) -> String {
    let label = status.as_str();
    match status {
        RunStatus::Completed => style(label).green().to_string(),
        RunStatus::Failed | RunStatus::TimedOut => style(label).red().to_string(),
        RunStatus::Canceled => style(label).yellow().to_string(),
        RunStatus::Pending | RunStatus::Running => style(label).blue().to_string(),
    }
}

fn format_duration(ms: Option<i64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) if ms < 1_000 => format!("{ms}ms"),
        Some(ms) if ms < 60_000 => format!("{:.1}s", ms as f64 / 1_000.0),
        Some(ms) => format!("{}m{}s", ms / 60_000, (ms % 60_000) / 1_000),
    }
}
