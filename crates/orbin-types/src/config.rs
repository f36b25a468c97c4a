//! Engine configuration for Orbin.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes the
//! dispatcher loop, loop guards, and trigger deduplication.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level configuration for the execution engine.
///
/// Loaded from `~/.orbin/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the dispatcher fires due timers, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Loop guard applied when a loop step sets no `max_iterations`.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// How long an idempotency key suppresses duplicate deliveries.
    #[serde(default = "default_idempotency_retention_secs")]
    pub idempotency_retention_secs: u64,

    /// Fallback retry policy for organizations with no stored settings.
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,

    /// Run the in-process worker for built-in step handlers.
    #[serde(default = "default_worker_enabled")]
    pub worker_enabled: bool,

    /// Capacity of the execution event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_loop_iterations() -> u32 {
    100
}

fn default_idempotency_retention_secs() -> u64 {
    86_400
}

fn default_worker_enabled() -> bool {
    true
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_loop_iterations: default_max_loop_iterations(),
            idempotency_retention_secs: default_idempotency_retention_secs(),
            default_retry_policy: RetryPolicy::default(),
            worker_enabled: default_worker_enabled(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.max_loop_iterations, 100);
        assert_eq!(config.idempotency_retention_secs, 86_400);
        assert_eq!(config.default_retry_policy.max_attempts, 3);
        assert!(config.worker_enabled);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.event_bus_capacity, 1024);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
poll_interval_ms = 250
max_loop_iterations = 10
worker_enabled = false

[default_retry_policy]
max_attempts = 5
backoff_coefficient = 3.0
initial_interval_ms = 200
max_interval_ms = 5000
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.max_loop_iterations, 10);
        assert!(!config.worker_enabled);
        assert_eq!(config.default_retry_policy.max_attempts, 5);
        assert_eq!(config.default_retry_policy.max_interval_ms, 5_000);
        assert_eq!(config.idempotency_retention_secs, 86_400);
    }
}
