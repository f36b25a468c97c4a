//! Orbin CLI and REST API entry point.
//!
//! Binary name: `orbin`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the command handler or starts the API server.

mod cli;
mod http;
mod serve;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::run::TriggerArgs;
use cli::{Cli, Commands};
use orbin_observe::tracing_setup::{TracingOptions, default_filter, init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "orbin", &mut std::io::stdout());
        return Ok(());
    }

    let options = TracingOptions {
        default_filter: default_filter(cli.verbose, cli.quiet).to_string(),
        json: cli.log_json,
        otel: matches!(cli.command, Commands::Serve { otel: true, .. }),
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;
    let org = cli.org;
    let json = cli.json;

    match cli.command {
        Commands::Serve { port, host, .. } => serve::serve(state, &host, port).await,

        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, org, json).await
        }

        Commands::Trigger {
            workflow_id,
            data,
            key,
            timeout,
            detach,
        } => {
            let args = TriggerArgs {
                workflow_id,
                data,
                key,
                timeout_secs: timeout,
                detach,
            };
            cli::run::handle_trigger(args, &state, org, json).await
        }

        Commands::Runs { action } => cli::run::handle_run_command(action, &state, org, json).await,

        Commands::Org { action } => cli::org::handle_org_command(action, &state, org, json).await,

        Commands::Event { action } => cli::event::handle_event_command(action, &state, org, json).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
