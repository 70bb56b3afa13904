//!
//! Client configuration supplied once at construction.
//!
use crate::error::ClientError;
use crate::naming::Naming;
use std::time::Duration;

pub const DEFAULT_ENV_SUFFIX: &str = "stage";
pub const DEFAULT_NAME_PREFIX: &str = "service-name";

/// Long-poll wait used when none, or a non-positive one, is configured.
pub const DEFAULT_WAIT_TIME_SECONDS: i64 = 5;

pub const ENV_SUFFIX_VAR: &str = "TOPICQ_ENV_SUFFIX";
pub const NAME_PREFIX_VAR: &str = "TOPICQ_NAME_PREFIX";
pub const WAIT_TIME_VAR: &str = "TOPICQ_WAIT_TIME_SECONDS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Environment suffix, e.g. development, test, stage, production.
    pub env_suffix: String,

    /// Prefix applied to queue names, usually the owning service.
    pub name_prefix: String,

    /// Long-poll wait of a receive call and pause between subscriber cycles.
    pub wait_time_seconds: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            env_suffix: DEFAULT_ENV_SUFFIX.to_owned(),
            name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
            wait_time_seconds: DEFAULT_WAIT_TIME_SECONDS,
        }
    }
}

impl ClientConfig {
    pub fn new(env_suffix: &str, name_prefix: &str, wait_time_seconds: i64) -> Result<Self, ClientError> {
        let config = Self {
            env_suffix: env_suffix.to_owned(),
            name_prefix: name_prefix.to_owned(),
            wait_time_seconds,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from `TOPICQ_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let wait_time_seconds = match lookup(WAIT_TIME_VAR) {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_e| ClientError::InvalidConfig(format!("{}={}", WAIT_TIME_VAR, raw)))?,
            None => defaults.wait_time_seconds,
        };
        Self::new(
            &lookup(ENV_SUFFIX_VAR).unwrap_or(defaults.env_suffix),
            &lookup(NAME_PREFIX_VAR).unwrap_or(defaults.name_prefix),
            wait_time_seconds,
        )
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.env_suffix.trim().is_empty() {
            return Err(ClientError::InvalidConfig("env_suffix is empty".to_owned()));
        }
        if self.name_prefix.trim().is_empty() {
            return Err(ClientError::InvalidConfig("name_prefix is empty".to_owned()));
        }
        Ok(())
    }

    pub fn naming(&self) -> Naming {
        Naming::new(&self.name_prefix, &self.env_suffix)
    }

    pub fn wait_time(&self) -> Duration {
        if self.wait_time_seconds > 0 {
            return Duration::from_secs(self.wait_time_seconds as u64);
        }
        Duration::from_secs(DEFAULT_WAIT_TIME_SECONDS as u64)
    }
}
