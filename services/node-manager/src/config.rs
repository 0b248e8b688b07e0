//! Configuration for the node manager.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::provider::ResourceSpec;
use crate::resilience::CircuitBreakerConfig;

/// Per-node supervision settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerNodeConfig {
    /// Interval between health checks.
    pub health_check_interval: Duration,

    /// Breaker guarding provider calls.
    pub breaker: CircuitBreakerConfig,

    /// How long provisioning keeps waiting out an open circuit before the
    /// node gives up.
    pub provision_patience: Duration,

    /// Fail the node if the worker has not reported ready by then.
    pub ready_timeout: Option<Duration>,

    /// Retries allowed for one destroy call chain.
    pub destroy_max_retries: u32,

    /// Upper bound on the whole teardown.
    pub teardown_timeout: Duration,

    /// Consecutive failed health checks that fail the node.
    pub unhealthy_threshold: u32,

    /// Mailbox capacity.
    pub mailbox_size: usize,
}

impl Default for WorkerNodeConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            breaker: CircuitBreakerConfig::default(),
            provision_patience: Duration::from_secs(300),
            ready_timeout: Some(Duration::from_secs(600)),
            destroy_max_retries: 5,
            teardown_timeout: Duration::from_secs(60),
            unhealthy_threshold: 3,
            mailbox_size: 256,
        }
    }
}

/// Node manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker nodes to run.
    pub node_count: usize,

    /// What each node provisions.
    pub spec: ResourceSpec,

    /// Per-node supervision settings.
    pub worker: WorkerNodeConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = WorkerNodeConfig::default();

        let node_count = env_or("FLEET_NODE_COUNT", 1usize)?;

        let image_id =
            std::env::var("FLEET_IMAGE_ID").unwrap_or_else(|_| "ami-00000000".to_string());
        let instance_type =
            std::env::var("FLEET_INSTANCE_TYPE").unwrap_or_else(|_| "m1.small".to_string());

        let breaker = CircuitBreakerConfig {
            failure_threshold: env_or(
                "FLEET_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker.failure_threshold,
            )?,
            window: env_secs("FLEET_BREAKER_WINDOW_SECS", defaults.breaker.window)?,
            cooldown: env_secs("FLEET_BREAKER_COOLDOWN_SECS", defaults.breaker.cooldown)?,
        };

        let ready_timeout_secs = env_or(
            "FLEET_READY_TIMEOUT_SECS",
            defaults.ready_timeout.map_or(0, |d| d.as_secs()),
        )?;

        let worker = WorkerNodeConfig {
            health_check_interval: env_secs(
                "FLEET_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval,
            )?,
            breaker,
            provision_patience: env_secs(
                "FLEET_PROVISION_PATIENCE_SECS",
                defaults.provision_patience,
            )?,
            ready_timeout: (ready_timeout_secs > 0).then(|| Duration::from_secs(ready_timeout_secs)),
            destroy_max_retries: env_or("FLEET_DESTROY_MAX_RETRIES", defaults.destroy_max_retries)?,
            teardown_timeout: env_secs("FLEET_TEARDOWN_TIMEOUT_SECS", defaults.teardown_timeout)?,
            unhealthy_threshold: env_or("FLEET_UNHEALTHY_THRESHOLD", defaults.unhealthy_threshold)?,
            mailbox_size: env_or("FLEET_MAILBOX_SIZE", defaults.mailbox_size)?,
        };

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_count,
            spec: ResourceSpec::new(image_id).with_instance_type(instance_type),
            worker,
            log_level,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_or(key, std::env::var(key).ok().as_deref(), default)
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn parse_or<T>(key: &str, raw: Option<&str>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid value for {key}: {value:?}")),
    }
}
