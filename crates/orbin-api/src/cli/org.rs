//! CLI organization settings subcommands.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use console::style;
use uuid::Uuid;

use orbin_types::organization::OrganizationSettings;
use orbin_types::workflow::RetryPolicy;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum OrgCommand {
    /// Show the organization's settings and usage.
    Show,

    /// Change the default retry policy for runs created from now on. Omitted
    /// fields keep their current value.
    SetRetry {
        /// Total attempts per step, including the first.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Multiplier applied per retry.
        #[arg(long)]
        backoff: Option<f64>,

        /// Delay before the first retry, in milliseconds.
        #[arg(long)]
        initial_interval_ms: Option<u64>,

        /// Upper bound on any retry delay, in milliseconds.
        #[arg(long)]
        max_interval_ms: Option<u64>,
    },

    /// Require HMAC-signed webhook deliveries.
    SetWebhookSecret {
        /// Shared secret. Omit together with --clear to accept unsigned deliveries.
        secret: Option<String>,

        /// Remove the secret.
        #[arg(long, conflicts_with = "secret")]
        clear: bool,
    },
}

pub async fn handle_org_command(cmd: OrgCommand, state: &AppState, org: Uuid, json: bool) -> Result<()> {
    match cmd {
        OrgCommand::Show => {
            let settings = state
                .engine
                .organization_settings(&org)
                .await
                .context("Failed to load organization settings")?;
            display_settings(&settings, json)
        }
        OrgCommand::SetRetry {
            max_attempts,
            backoff,
            initial_interval_ms,
            max_interval_ms,
        } => {
            let current = state.engine.organization_settings(&org).await?;
            let policy = merge_policy(
                current.default_retry_policy,
                max_attempts,
                backoff,
                initial_interval_ms,
                max_interval_ms,
            );
            let settings = state
                .engine
                .set_default_retry_policy(&org, policy)
                .await
                .context("Failed to set retry policy")?;
            if !json {
                println!();
                println!("  {} Default retry policy updated", style("*").green().bold());
            }
            display_settings(&settings, json)
        }
        OrgCommand::SetWebhookSecret { secret, clear } => {
            if secret.is_none() && !clear {
                bail!("Provide a secret or pass --clear");
            }
            let secret = secret.filter(|s| !s.is_empty());
            let settings = state
                .engine
                .set_webhook_secret(&org, secret)
                .await
                .context("Failed to set webhook secret")?;
            if !json {
                println!();
                let verb = if settings.webhook_secret.is_some() { "set" } else { "cleared" };
                println!("  {} Webhook secret {verb}", style("*").green().bold());
            }
            display_settings(&settings, json)
        }
    }
}

fn merge_policy(
    mut policy: RetryPolicy,
    max_attempts: Option<u32>,
    backoff: Option<f64>,
    initial_interval_ms: Option<u64>,
    max_interval_ms: Option<u64>,
) -> RetryPolicy {
    if let Some(v) = max_attempts {
        policy.max_attempts = v;
    }
    if let Some(v) = backoff {
        policy.backoff_coefficient = v;
    }
    if let Some(v) = initial_interval_ms {
        policy.initial_interval_ms = v;
    }
    if let Some(v) = max_interval_ms {
        policy.max_interval_ms = v;
    }
    policy
}

fn display_settings(settings: &OrganizationSettings, json: bool) -> Result<()> {
    let policy = &settings.default_retry_policy;

    if json {
        let out = serde_json::json!({
            "organization_id": settings.organization_id.to_string(),
            "default_retry_policy": policy,
            "webhook_secret_set": settings.webhook_secret.is_some(),
            "current_executions": settings.current_executions,
            "updated_at": settings.updated_at.to_rfc3339(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Organization:").bold(),
        style(settings.organization_id).cyan()
    );
    println!(
        "  Retry: {} attempts, x{} from {}ms (max {}ms)",
        policy.max_attempts, policy.backoff_coefficient, policy.initial_interval_ms, policy.max_interval_ms
    );
    println!(
        "  Webhook secret: {}",
        if settings.webhook_secret.is_some() {
            style("set").green()
        } else {
            style("not set").dim()
        }
    );
    println!("  Finished runs: {}", settings.current_executions);
    println!();
    Ok(())
}
