//! Centralized server configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating nested sections (`WORKER__BATCH_SIZE`, `NATS__URL`).

use dealflow_scheduler::WorkerConfig;
use dealflow_workflow::RetryPolicy;
use dealflow_workflow::nats::NatsConfig;
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Address the HTTP listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Upper bound on pooled database connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Background worker settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Retry policy for transient step failures.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Event stream mirroring; disabled when absent.
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_database_url_is_required() {
        let config: ServerConfig =
            serde_json::from_value(json!({ "database_url": "postgres://localhost/dealflow" }))
                .expect("config");

        assert_eq!(config.listen_addr, "0.0.0.0:3000");
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.worker, WorkerConfig::default());
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.nats.is_none());
    }

    #[test]
    fn nested_sections_override_defaults() {
        let config: ServerConfig = serde_json::from_value(json!({
            "database_url": "postgres://localhost/dealflow",
            "worker": { "batch_size": 4 },
            "nats": { "url": "nats://localhost:4222" }
        }))
        .expect("config");

        assert_eq!(config.worker.batch_size, 4);
        assert_eq!(config.worker.poll_interval_ms, 1000);
        assert_eq!(
            config.nats.map(|n| n.url).as_deref(),
            Some("nats://localhost:4222")
        );
    }

    #[test]
    fn missing_database_url_is_rejected() {
        let result = serde_json::from_value::<ServerConfig>(json!({}));
        assert!(result.is_err());
    }
}
