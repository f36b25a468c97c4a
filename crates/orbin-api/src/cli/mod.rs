//! CLI command definitions for the `orbin` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! resource (`orbin workflow apply`, `orbin runs list`, `orbin org show`).

pub mod event;
pub mod org;
pub mod run;
pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use uuid::Uuid;

use orbin_types::run::{RunStatus, StepStatus};

/// Run and inspect durable workflows.
#[derive(Parser)]
#[command(name = "orbin", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Organization to act for.
    #[arg(long, global = true, env = "ORBIN_ORG", default_value_t = Uuid::nil())]
    pub org: Uuid,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server with the scheduler, timers, and local worker.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Export spans to stdout through OpenTelemetry.
        #[arg(long)]
        otel: bool,
    },

    /// Manage workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Start a run of a workflow and follow it to completion.
    Trigger {
        /// Workflow UUID.
        workflow_id: Uuid,

        /// JSON trigger data handed to the first step.
        #[arg(long)]
        data: Option<String>,

        /// Idempotency key; a repeat within the retention window returns the
        /// existing run.
        #[arg(long)]
        key: Option<String>,

        /// Fail the run with `timed_out` after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Return immediately and leave the run to other workers.
        #[arg(long)]
        detach: bool,
    },

    /// Inspect and control runs.
    #[command(alias = "run")]
    Runs {
        #[command(subcommand)]
        action: run::RunCommand,
    },

    /// Organization settings.
    Org {
        #[command(subcommand)]
        action: org::OrgCommand,
    },

    /// Publish internal events and browse the delivery log.
    #[command(alias = "events")]
    Event {
        #[command(subcommand)]
        action: event::EventCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared formatting helpers
// ---------------------------------------------------------------------------

pub(crate) fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub(crate) fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Pending => Color::Yellow,
        RunStatus::Running => Color::Blue,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed | RunStatus::TimedOut => Color::Red,
        RunStatus::Canceled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub(crate) fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending => Color::Yellow,
        StepStatus::Running => Color::Blue,
        StepStatus::Retrying => Color::Magenta,
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

/// Parse an optional `--data` argument as JSON. Absent means `null`.
pub(crate) fn parse_json_arg(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid JSON data: {e}")),
        None => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger_command() {
        let cli = Cli::try_parse_from([
            "orbin",
            "trigger",
            "0190a5e4-8f00-7000-8000-000000000001",
            "--data",
            r#"{"order": 1}"#,
            "--timeout",
            "30",
            "--detach",
            "--json",
        ])
        .unwrap();

        assert!(cli.json);
        assert_eq!(cli.org, Uuid::nil());
        match cli.command {
            Commands::Trigger {
                data,
                timeout,
                detach,
                key,
                ..
            } => {
                assert_eq!(data.as_deref(), Some(r#"{"order": 1}"#));
                assert_eq!(timeout, Some(30));
                assert!(detach);
                assert!(key.is_none());
            }
            _ => panic!("expected trigger"),
        }
    }

    #[test]
    fn test_parse_global_org_and_verbosity() {
        let org = Uuid::now_v7();
        let cli = Cli::try_parse_from(["orbin", "-vv", "--org", &org.to_string(), "runs", "list"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.org, org);
        assert!(matches!(cli.command, Commands::Runs { .. }));
    }

    #[test]
    fn test_trigger_requires_uuid() {
        assert!(Cli::try_parse_from(["orbin", "trigger", "order-sync"]).is_err());
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg(None).unwrap(), serde_json::Value::Null);
        assert_eq!(parse_json_arg(Some("[1,2]")).unwrap(), serde_json::json!([1, 2]));
        assert!(parse_json_arg(Some("{oops")).is_err());
    }
}
