//! Coordinator configuration loading and validation.
//!
//! Defaults mirror the production job: one hour cooldown after success, five
//! minutes backoff after failure, recurring record under a fixed sort key.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobgate_core::{BackoffStrategy, DomainError, KeySchema, MAX_ERROR_LEN, RateLimiter};

use crate::jobs::LockPolicy;

pub const DEFAULT_COOLDOWN_SECS: u64 = 3600;
pub const DEFAULT_BACKOFF_SECS: u64 = 300;

/// How a missing record is treated on acquisition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// The record must be seeded out-of-band; absence is a misconfiguration.
    #[default]
    PreExisting,
    /// The first acquisition creates the record (idempotency guard).
    CreateIfAbsent,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub cooldown_secs: u64,
    pub backoff_secs: u64,
    pub backoff_strategy: BackoffStrategy,
    pub recurring: bool,
    pub acquire_mode: AcquireMode,
    pub key_schema: KeySchema,
    pub stale_lock_timeout_secs: Option<u64>,
    pub max_error_len: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            backoff_secs: DEFAULT_BACKOFF_SECS,
            backoff_strategy: BackoffStrategy::Fixed,
            recurring: true,
            acquire_mode: AcquireMode::PreExisting,
            key_schema: KeySchema::SingleJob,
            stale_lock_timeout_secs: None,
            max_error_len: MAX_ERROR_LEN,
        }
    }
}

impl CoordinatorConfig {
    /// Cooldown-gated recurring job over a pre-seeded record.
    pub fn cooldown_gated() -> Self {
        Self::default()
    }

    /// One terminal record per execution key, created on first acquisition.
    pub fn idempotent_daily() -> Self {
        Self {
            recurring: false,
            acquire_mode: AcquireMode::CreateIfAbsent,
            key_schema: KeySchema::PartitionOnly,
            ..Self::default()
        }
    }

    pub fn with_windows(mut self, cooldown_secs: u64, backoff_secs: u64) -> Self {
        self.cooldown_secs = cooldown_secs;
        self.backoff_secs = backoff_secs;
        self
    }

    pub fn with_stale_lock_timeout(mut self, secs: u64) -> Self {
        self.stale_lock_timeout_secs = Some(secs);
        self
    }

    /// Load from `JOBGATE_*` environment variables on top of defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, test maps).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("JOBGATE_COOLDOWN_SECS") {
            config.cooldown_secs = parse_number("JOBGATE_COOLDOWN_SECS", &v)?;
        }
        if let Some(v) = lookup("JOBGATE_BACKOFF_SECS") {
            config.backoff_secs = parse_number("JOBGATE_BACKOFF_SECS", &v)?;
        }
        if let Some(v) = lookup("JOBGATE_BACKOFF_STRATEGY") {
            config.backoff_strategy = parse_enum("JOBGATE_BACKOFF_STRATEGY", &v)?;
        }
        if let Some(v) = lookup("JOBGATE_RECURRING") {
            config.recurring = parse_bool("JOBGATE_RECURRING", &v)?;
        }
        if let Some(v) = lookup("JOBGATE_ACQUIRE_MODE") {
            config.acquire_mode = parse_enum("JOBGATE_ACQUIRE_MODE", &v)?;
        }
        if let Some(v) = lookup("JOBGATE_KEY_SCHEMA") {
            config.key_schema = parse_enum("JOBGATE_KEY_SCHEMA", &v)?;
        }
        if let Some(v) = lookup("JOBGATE_STALE_LOCK_TIMEOUT_SECS") {
            let v = v.trim();
            config.stale_lock_timeout_secs = if v.is_empty() {
                None
            } else {
                Some(parse_number("JOBGATE_STALE_LOCK_TIMEOUT_SECS", v)?)
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limiter()?;
        if self.max_error_len == 0 || self.max_error_len > MAX_ERROR_LEN {
            return Err(ConfigError::Invalid {
                key: "max_error_len".to_string(),
                value: self.max_error_len.to_string(),
                reason: format!("must be between 1 and {MAX_ERROR_LEN}"),
            });
        }
        if self.stale_lock_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid {
                key: "stale_lock_timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "must be positive when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn rate_limiter(&self) -> Result<RateLimiter, ConfigError> {
        Ok(RateLimiter::new(
            self.cooldown_secs,
            self.backoff_secs,
            self.backoff_strategy,
        )?)
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            acquire_mode: self.acquire_mode,
            key_schema: self.key_schema,
            recurring: self.recurring,
            stale_lock_timeout_secs: self.stale_lock_timeout_secs,
            max_error_len: self.max_error_len,
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: format!("{e}"),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

/// Parse a unit enum variant by its serde name (e.g. `create_if_absent`).
fn parse_enum<T: DeserializeOwned>(key: &str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_ascii_lowercase())).map_err(
        |e| ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_production_constants() {
        let config = CoordinatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.cooldown_secs, 3600);
        assert_eq!(config.backoff_secs, 300);
        assert!(config.recurring);
    }

    #[test]
    fn env_overrides_are_parsed() {
        let config = CoordinatorConfig::from_lookup(lookup(&[
            ("JOBGATE_COOLDOWN_SECS", "86400"),
            ("JOBGATE_BACKOFF_SECS", "600"),
            ("JOBGATE_BACKOFF_STRATEGY", "exponential"),
            ("JOBGATE_RECURRING", "false"),
            ("JOBGATE_ACQUIRE_MODE", "create_if_absent"),
            ("JOBGATE_KEY_SCHEMA", "partition_only"),
            ("JOBGATE_STALE_LOCK_TIMEOUT_SECS", "7200"),
        ]))
        .unwrap();

        assert_eq!(config.cooldown_secs, 86400);
        assert_eq!(config.backoff_secs, 600);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert!(!config.recurring);
        assert_eq!(config.acquire_mode, AcquireMode::CreateIfAbsent);
        assert_eq!(config.key_schema, KeySchema::PartitionOnly);
        assert_eq!(config.stale_lock_timeout_secs, Some(7200));
    }

    #[test]
    fn backoff_not_shorter_than_cooldown_is_rejected() {
        let err = CoordinatorConfig::from_lookup(lookup(&[
            ("JOBGATE_COOLDOWN_SECS", "300"),
            ("JOBGATE_BACKOFF_SECS", "300"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = CoordinatorConfig::from_lookup(lookup(&[("JOBGATE_ACQUIRE_MODE", "sometimes")]))
            .unwrap_err();
        match err {
            ConfigError::Invalid { key, .. } => assert_eq!(key, "JOBGATE_ACQUIRE_MODE"),
            other => panic!("unexpected error: {other}"),
        }

        assert!(CoordinatorConfig::from_lookup(lookup(&[("JOBGATE_RECURRING", "maybe")])).is_err());
        assert!(CoordinatorConfig::from_lookup(lookup(&[("JOBGATE_COOLDOWN_SECS", "-1")])).is_err());
    }

    #[test]
    fn presets_describe_both_variants() {
        let daily = CoordinatorConfig::idempotent_daily();
        assert!(!daily.recurring);
        assert_eq!(daily.acquire_mode, AcquireMode::CreateIfAbsent);
        assert_eq!(daily.key_schema, KeySchema::PartitionOnly);
        daily.validate().unwrap();

        let gated = CoordinatorConfig::cooldown_gated();
        assert_eq!(gated.lock_policy(), LockPolicy::default());
    }
}
