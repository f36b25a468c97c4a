//! CLI workflow definition subcommands.
//!
//! Provides apply, list, show, and status changes (activate, pause, archive).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use orbin_core::workflow::definition::{WorkflowError, load_workflow_file};
use orbin_types::workflow::{TriggerSpec, WorkflowDefinition, WorkflowStatus};

use crate::cli::short_id;
use crate::state::AppState;

/// Workflow management subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Save a workflow from a YAML file. A workflow with the same name in the
    /// organization gets a new version.
    Apply {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// List workflows of the organization.
    #[command(alias = "ls")]
    List,

    /// Show a workflow's latest version.
    Show {
        /// Workflow UUID.
        id: Uuid,
    },

    /// Accept triggers for a workflow.
    Activate {
        /// Workflow UUID.
        id: Uuid,
    },

    /// Stop accepting triggers. Running runs continue.
    Pause {
        /// Workflow UUID.
        id: Uuid,
    },

    /// Retire a workflow.
    Archive {
        /// Workflow UUID.
        id: Uuid,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    org: Uuid,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Apply { file } => handle_apply(&file, state, org, json).await,
        WorkflowCommand::List => handle_list(state, org, json).await,
        WorkflowCommand::Show { id } => handle_show(&id, state, org, json).await,
        WorkflowCommand::Activate { id } => {
            handle_set_status(&id, WorkflowStatus::Active, state, org, json).await
        }
        WorkflowCommand::Pause { id } => {
            handle_set_status(&id, WorkflowStatus::Paused, state, org, json).await
        }
        WorkflowCommand::Archive { id } => {
            handle_set_status(&id, WorkflowStatus::Archived, state, org, json).await
        }
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Load a definition file and bind it to `org`, reusing the id of an
/// existing workflow with the same name.
pub(crate) async fn prepare_definition(
    file: &Path,
    state: &AppState,
    org: Uuid,
) -> Result<WorkflowDefinition> {
    let mut def = load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load workflow: {other}"),
    })?;
    def.organization_id = org;

    let existing = state
        .engine
        .list_workflows(Some(&org))
        .await
        .context("Failed to list workflows")?;
    if let Some(previous) = existing.iter().find(|d| d.name == def.name) {
        def.id = previous.id;
    }
    Ok(def)
}

async fn handle_apply(file: &Path, state: &AppState, org: Uuid, json: bool) -> Result<()> {
    let def = prepare_definition(file, state, org).await?;
    let saved = state
        .engine
        .save_workflow(def)
        .await
        .context("Failed to save workflow")?;

    if json {
        let out = serde_json::json!({
            "id": saved.id.to_string(),
            "name": saved.name,
            "version": saved.version,
            "status": saved.status.as_str(),
            "steps": saved.steps.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Saved workflow '{}' (version {})",
            style("*").green().bold(),
            style(&saved.name).cyan(),
            saved.version
        );
        println!("  ID: {}", saved.id);
        println!("  Status: {}", saved.status);
        println!("  Trigger: {}", describe_trigger(&saved.trigger));
        println!("  Steps: {}", saved.steps.len());
        if saved.status != WorkflowStatus::Active {
            println!(
                "  Activate with: {}",
                style(format!("orbin workflow activate {}", saved.id)).dim()
            );
        }
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// List / Show
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, org: Uuid, json: bool) -> Result<()> {
    let defs = state
        .engine
        .list_workflows(Some(&org))
        .await
        .context("Failed to list workflows")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&defs)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows saved.");
        println!(
            "  Create one with: {}",
            style("orbin workflow apply <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Steps"),
        ]);

    for d in &defs {
        table.add_row(vec![
            Cell::new(d.id),
            Cell::new(&d.name),
            Cell::new(d.version),
            workflow_status_cell(d.status),
            Cell::new(describe_trigger(&d.trigger)),
            Cell::new(d.steps.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

async fn handle_show(id: &Uuid, state: &AppState, org: Uuid, json: bool) -> Result<()> {
    let def = state
        .engine
        .get_workflow(&org, id)
        .await
        .with_context(|| format!("Workflow '{id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} (version {})",
        style("Workflow:").bold(),
        style(&def.name).cyan(),
        def.version
    );
    println!("  ID: {}", def.id);
    if let Some(ref description) = def.description {
        println!("  {}", style(description).dim());
    }
    println!("  Status: {}", def.status);
    println!("  Trigger: {}", describe_trigger(&def.trigger));
    if let Some(policy) = def.retry_policy {
        println!(
            "  Retry: {} attempts, x{} from {}ms (max {}ms)",
            policy.max_attempts,
            policy.backoff_coefficient,
            policy.initial_interval_ms,
            policy.max_interval_ms
        );
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Type"),
            Cell::new("Handler"),
            Cell::new("Options"),
        ]);

    for step in &def.steps {
        let mut options = Vec::new();
        if step.continue_on_failure {
            options.push("continue_on_failure".to_string());
        }
        if let Some(ms) = step.timeout_ms {
            options.push(format!("timeout={ms}ms"));
        }
        if let Some(policy) = step.retry_policy {
            options.push(format!("attempts={}", policy.max_attempts));
        }
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(&step.name),
            Cell::new(step.step_type().as_str()),
            Cell::new(step.config.handler().unwrap_or("-")),
            Cell::new(if options.is_empty() { "-".to_string() } else { options.join(", ") }),
        ]);
    }

    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Status changes
// ---------------------------------------------------------------------------

async fn handle_set_status(
    id: &Uuid,
    status: WorkflowStatus,
    state: &AppState,
    org: Uuid,
    json: bool,
) -> Result<()> {
    let def = state
        .engine
        .set_workflow_status(&org, id, status)
        .await
        .with_context(|| format!("Failed to set workflow '{}' to {status}", short_id(id)))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "id": def.id.to_string(),
                "status": def.status.as_str(),
                "version": def.version,
            })
        );
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is now {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.status
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn describe_trigger(trigger: &TriggerSpec) -> String {
    match trigger {
        TriggerSpec::Manual {} => "manual".to_string(),
        TriggerSpec::Webhook { path } => format!("webhook {path}"),
        TriggerSpec::Schedule { cron, .. } => format!("schedule '{cron}'"),
        TriggerSpec::Event { event_type } => format!("event {event_type}"),
    }
}

fn workflow_status_cell(status: WorkflowStatus) -> Cell {
    match status {
        WorkflowStatus::Draft => Cell::new("draft").fg(Color::Yellow),
        WorkflowStatus::Active => Cell::new("active").fg(Color::Green),
        WorkflowStatus::Paused => Cell::new("paused").fg(Color::Magenta),
        WorkflowStatus::Archived => Cell::new("archived").fg(Color::DarkGrey),
    }
}
