//! Configuration for the hatchery.
//!
//! Everything comes from `HATCHERY_*` environment variables with defaults
//! suitable for a local setup. Driver-specific options are read by the
//! driver itself.

use std::str::FromStr;
use std::time::Duration;

use hatchery_sdk::{GroupId, ModelType};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A ceiling that must allow at least one worker is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Provisioning limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// Ceiling on active workers (pending, registering and registered).
    pub max_worker: usize,

    /// Starter pool size and ceiling on concurrent spawns.
    pub max_concurrent_provisioning: usize,

    /// Jobs younger than this are left to other hatcheries.
    pub grace_time_queued: Duration,

    /// Interval between registration scans.
    pub register_frequency: Duration,

    /// Jobs with more spawn attempts than this are given up.
    pub max_attempts_before_failure: u32,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            max_worker: 10,
            max_concurrent_provisioning: 10,
            grace_time_queued: Duration::ZERO,
            register_frequency: Duration::from_secs(60),
            max_attempts_before_failure: 5,
        }
    }
}

impl ProvisionConfig {
    /// Ceiling on models registering at the same time.
    pub fn max_registering(&self) -> usize {
        (self.max_worker / 4).max(1)
    }
}

/// Hatchery configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Service name, used as worker token issuer.
    pub name: String,

    /// Hostname matched against `hostname` requirements.
    pub hostname: String,

    /// Group owning this hatchery.
    pub group_id: GroupId,

    /// Backend family served by this hatchery.
    pub model_type: ModelType,

    /// Whether the hatchery serves every group.
    pub shared_infra: bool,

    /// Job server API URL.
    pub api_url: String,

    /// Bearer token for the job server API.
    pub api_token: String,

    pub provision: ProvisionConfig,

    /// Interval of the heartbeat loop.
    pub heartbeat_interval: Duration,

    /// Consecutive heartbeat failures tolerated before exiting.
    pub max_heartbeat_failures: u32,

    /// Timeout applied to every job server request.
    pub request_timeout: Duration,

    /// Interval between two polls of the job queue.
    pub queue_poll_interval: Duration,

    /// Lifetime of issued worker tokens.
    pub worker_token_ttl: Duration,

    /// Base64 ed25519 seed used to sign worker tokens.
    pub signing_key: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "hatchery".to_string(),
            hostname: "localhost".to_string(),
            group_id: GroupId::new(1),
            model_type: ModelType::Host,
            shared_infra: false,
            api_url: "http://127.0.0.1:8081".to_string(),
            api_token: String::new(),
            provision: ProvisionConfig::default(),
            heartbeat_interval: Duration::from_secs(10),
            max_heartbeat_failures: 10,
            request_timeout: Duration::from_secs(10),
            queue_poll_interval: Duration::from_secs(2),
            worker_token_ttl: Duration::from_secs(3600),
            signing_key: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let hostname = std::env::var("HATCHERY_HOSTNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or(defaults.hostname);

        let provision = ProvisionConfig {
            max_worker: parse_env("HATCHERY_MAX_WORKER", defaults.provision.max_worker)?,
            max_concurrent_provisioning: parse_env(
                "HATCHERY_MAX_CONCURRENT_PROVISIONING",
                defaults.provision.max_concurrent_provisioning,
            )?,
            grace_time_queued: secs_env(
                "HATCHERY_GRACE_TIME_QUEUED",
                defaults.provision.grace_time_queued,
            )?,
            register_frequency: secs_env(
                "HATCHERY_REGISTER_FREQUENCY",
                defaults.provision.register_frequency,
            )?,
            max_attempts_before_failure: parse_env(
                "HATCHERY_MAX_ATTEMPTS_BEFORE_FAILURE",
                defaults.provision.max_attempts_before_failure,
            )?,
        };

        let config = Self {
            name: std::env::var("HATCHERY_NAME").unwrap_or(defaults.name),
            hostname,
            group_id: GroupId::new(parse_env("HATCHERY_GROUP_ID", defaults.group_id.get())?),
            model_type: parse_env("HATCHERY_MODEL_TYPE", defaults.model_type)?,
            shared_infra: bool_env("HATCHERY_SHARED_INFRA"),
            api_url: std::env::var("HATCHERY_API_URL").unwrap_or(defaults.api_url),
            api_token: std::env::var("HATCHERY_API_TOKEN").unwrap_or_default(),
            provision,
            heartbeat_interval: secs_env("HATCHERY_HEARTBEAT_INTERVAL", defaults.heartbeat_interval)?,
            max_heartbeat_failures: parse_env(
                "HATCHERY_MAX_HEARTBEAT_FAILURES",
                defaults.max_heartbeat_failures,
            )?,
            request_timeout: secs_env("HATCHERY_REQUEST_TIMEOUT", defaults.request_timeout)?,
            queue_poll_interval: secs_env(
                "HATCHERY_QUEUE_POLL_INTERVAL",
                defaults.queue_poll_interval,
            )?,
            worker_token_ttl: secs_env("HATCHERY_WORKER_TOKEN_TTL", defaults.worker_token_ttl)?,
            signing_key: std::env::var("HATCHERY_SIGNING_KEY").ok(),
            log_level: std::env::var("HATCHERY_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject ceilings that would never let a worker start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provision.max_worker == 0 {
            return Err(ConfigError::Zero("max_worker"));
        }
        if self.provision.max_concurrent_provisioning == 0 {
            return Err(ConfigError::Zero("max_concurrent_provisioning"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.provision.register_frequency.is_zero() {
            return Err(ConfigError::Zero("register_frequency"));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(ConfigError::Zero("queue_poll_interval"));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        },
        Err(_) => Ok(default),
    }
}

fn secs_env(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

fn bool_env(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}
