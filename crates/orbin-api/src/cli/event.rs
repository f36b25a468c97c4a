//! CLI event subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use orbin_types::event::EventStatus;

use crate::cli::{parse_json_arg, short_id};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum EventCommand {
    /// Start every active workflow listening for an event type.
    Publish {
        /// Event type, e.g. `user.signed_up`.
        event_type: String,

        /// JSON payload.
        #[arg(long)]
        data: Option<String>,

        /// Event id; redelivery with the same id is ignored.
        #[arg(long)]
        id: Option<String>,
    },

    /// Show the trigger delivery log, newest first.
    #[command(alias = "ls")]
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

pub async fn handle_event_command(cmd: EventCommand, state: &AppState, org: Uuid, json: bool) -> Result<()> {
    match cmd {
        EventCommand::Publish { event_type, data, id } => {
            let payload = parse_json_arg(data.as_deref())?;
            let run_ids = state
                .ingestor
                .route_event(&org, &event_type, "cli", id.as_deref(), payload)
                .await
                .context("Failed to publish event")?;

            if json {
                let out = serde_json::json!({
                    "event_type": event_type,
                    "run_ids": run_ids,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if run_ids.is_empty() {
                println!();
                println!("  No active workflow listens for '{}'.", style(&event_type).cyan());
                println!();
            } else {
                println!();
                println!(
                    "  {} '{}' started {} run(s)",
                    style("*").green().bold(),
                    style(&event_type).cyan(),
                    run_ids.len()
                );
                for run_id in &run_ids {
                    println!("    {run_id}");
                }
                println!();
            }
            Ok(())
        }
        EventCommand::List { limit } => {
            let events = state
                .ingestor
                .list_events(&org, limit)
                .await
                .context("Failed to list events")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
                return Ok(());
            }
            if events.is_empty() {
                println!();
                println!("  No events recorded.");
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Received").fg(Color::Cyan),
                    Cell::new("Type"),
                    Cell::new("Source"),
                    Cell::new("Status"),
                    Cell::new("Run"),
                    Cell::new("Error"),
                ]);

            for e in &events {
                let status = match e.status {
                    EventStatus::Processed => Cell::new("processed").fg(Color::Green),
                    EventStatus::Failed => Cell::new("failed").fg(Color::Red),
                    EventStatus::Pending => Cell::new("pending").fg(Color::Yellow),
                };
                table.add_row(vec![
                    Cell::new(e.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                    Cell::new(&e.event_type),
                    Cell::new(&e.source),
                    status,
                    Cell::new(e.run_id.as_ref().map(short_id).unwrap_or_else(|| "-".to_string())),
                    Cell::new(e.error.as_deref().unwrap_or("-")),
                ]);
            }

            println!();
            println!("{table}");
            println!();
            Ok(())
        }
    }
}
