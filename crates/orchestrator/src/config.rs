//! Kernel configuration.
//!
//! Every knob has a default suitable for local development and an
//! environment override under the `TASKGRID_` prefix.

use std::time::Duration;

/// Configuration for the orchestration kernel.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Broker connection string.
    pub broker_url: String,
    /// Result backend connection string.
    pub result_backend_url: String,
    /// Postgres connection string for the task store.
    pub database_url: String,
    /// Queue jobs are routed to when no per-type override applies.
    pub dispatch_queue: String,
    /// Applied when a create request carries no timeout.
    pub default_timeout_seconds: u64,
    /// Applied when a create request carries no retry budget.
    pub default_max_retries: u32,
    /// Period of the background reconciliation sweep.
    pub reconcile_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            broker_url: "redis://localhost:6379/0".to_string(),
            result_backend_url: "redis://localhost:6379/0".to_string(),
            database_url: "postgres://localhost:5432/taskgrid".to_string(),
            dispatch_queue: "gpu".to_string(),
            default_timeout_seconds: 300,
            default_max_retries: 3,
            reconcile_interval: Duration::from_secs(15),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl OrchestratorConfig {
    /// Load from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            broker_url: env_string("TASKGRID_BROKER_URL", &defaults.broker_url),
            result_backend_url: env_string(
                "TASKGRID_RESULT_BACKEND_URL",
                &defaults.result_backend_url,
            ),
            database_url: env_string("TASKGRID_DATABASE_URL", &defaults.database_url),
            dispatch_queue: env_string("TASKGRID_DISPATCH_QUEUE", &defaults.dispatch_queue),
            default_timeout_seconds: env_parse(
                "TASKGRID_DEFAULT_TIMEOUT_SECONDS",
                defaults.default_timeout_seconds,
            ),
            default_max_retries: env_parse(
                "TASKGRID_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            ),
            reconcile_interval: Duration::from_secs(env_parse(
                "TASKGRID_RECONCILE_INTERVAL_SECONDS",
                defaults.reconcile_interval.as_secs(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_friendly() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.dispatch_queue, "gpu");
        assert_eq!(config.default_timeout_seconds, 300);
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.reconcile_interval, Duration::from_secs(15));
    }
}
