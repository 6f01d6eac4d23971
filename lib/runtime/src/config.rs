// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stack configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file named by `FEDEXEC_CONFIG_PATH`
//! 3. `FEDEXEC_*` environment variables, e.g. `FEDEXEC_FAN_OUT_THRESHOLD=50`
//!
//! Programmatic overrides merge on top via [`StackConfig::figment_with`].

use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// ENV naming the TOML configuration file
pub const CONFIG_PATH_ENV: &str = "FEDEXEC_CONFIG_PATH";

const ENV_PREFIX: &str = "FEDEXEC_";

/// Default maximum number of children per composition node
pub const DEFAULT_FAN_OUT_THRESHOLD: usize = 100;

/// Default hard limit on the participants of a single stack
pub const DEFAULT_MAX_PARTICIPANTS: usize = 100_000;

/// Default bound on in-flight operations per delegating layer
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// What happens to a branch failure inside a fan-out operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// The first failure aborts every other branch.
    #[default]
    AbortAll,
    /// Healthy branches run to completion before the failure is reported.
    BestEffort,
}

/// When an unreferenced stack is torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// As soon as the last handle is released.
    #[default]
    OnRelease,
    /// Only on `evict_idle` or factory shutdown.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StackConfig {
    /// Participant count above which stacks are composed, and the maximum
    /// number of children of any composition node.
    #[validate(range(min = 2))]
    pub fan_out_threshold: usize,

    pub partial_failure_policy: PartialFailurePolicy,

    /// Upper bound on draining in-flight work at teardown. None waits forever.
    pub shutdown_drain_timeout_ms: Option<u64>,

    /// Requests above this many participants fail with `CapacityExceeded`.
    #[validate(range(min = 1))]
    pub max_participants: usize,

    pub eviction_policy: EvictionPolicy,

    /// Wrap leaves in the lazy sequence layer.
    pub support_sequence_ops: bool,

    /// Dedicated worker runtime size. None runs work on the caller's runtime.
    #[validate(range(min = 1))]
    pub worker_threads: Option<usize>,

    /// Operations admitted concurrently per delegating layer.
    #[validate(range(min = 1))]
    pub max_in_flight: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            fan_out_threshold: DEFAULT_FAN_OUT_THRESHOLD,
            partial_failure_policy: PartialFailurePolicy::default(),
            shutdown_drain_timeout_ms: None,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            eviction_policy: EvictionPolicy::default(),
            support_sequence_ops: true,
            worker_threads: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl StackConfig {
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(StackConfig::default()))
            .merge(Toml::file(&config_path))
            // logging and path variables share the prefix
            .merge(Env::prefixed(ENV_PREFIX).ignore(&[
                "config_path",
                "log",
                "logging_config_path",
                "logging_jsonl",
            ]))
    }

    /// Load from the layered sources. A configured TOML path must be readable.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.is_empty()) {
            std::fs::metadata(&path)
                .with_context(|| format!("{CONFIG_PATH_ENV} names an unreadable file: {path}"))?;
        }
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    ///
    /// ```rust,ignore
    /// let config = StackConfig::extract_from(
    ///     StackConfig::figment().merge(("fan_out_threshold", 10usize)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    pub fn shutdown_drain_timeout(&self) -> Option<Duration> {
        self.shutdown_drain_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 5] = [
        "FEDEXEC_CONFIG_PATH",
        "FEDEXEC_FAN_OUT_THRESHOLD",
        "FEDEXEC_PARTIAL_FAILURE_POLICY",
        "FEDEXEC_SHUTDOWN_DRAIN_TIMEOUT_MS",
        "FEDEXEC_MAX_PARTICIPANTS",
    ];

    #[test]
    fn test_default_config() {
        let config = StackConfig::default();
        assert_eq!(config.fan_out_threshold, 100);
        assert_eq!(config.partial_failure_policy, PartialFailurePolicy::AbortAll);
        assert_eq!(config.eviction_policy, EvictionPolicy::OnRelease);
        assert!(config.shutdown_drain_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(VARS.to_vec(), || {
            let config = StackConfig::from_env().unwrap();
            assert_eq!(config.fan_out_threshold, DEFAULT_FAN_OUT_THRESHOLD);
            assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        });
    }

    #[test]
    fn test_env_override() {
        temp_env::with_vars(
            vec![
                ("FEDEXEC_FAN_OUT_THRESHOLD", Some("10")),
                ("FEDEXEC_PARTIAL_FAILURE_POLICY", Some("best_effort")),
                ("FEDEXEC_SHUTDOWN_DRAIN_TIMEOUT_MS", Some("250")),
                ("FEDEXEC_LOG", Some("debug")),
            ],
            || {
                let config = StackConfig::from_env().unwrap();
                assert_eq!(config.fan_out_threshold, 10);
                assert_eq!(
                    config.partial_failure_policy,
                    PartialFailurePolicy::BestEffort
                );
                assert_eq!(
                    config.shutdown_drain_timeout(),
                    Some(Duration::from_millis(250))
                );
            },
        );
    }

    #[test]
    fn test_tuple_override_and_validation() {
        temp_env::with_vars_unset(VARS.to_vec(), || {
            let config =
                StackConfig::extract_from(StackConfig::figment_with(("max_participants", 50usize)))
                    .unwrap();
            assert_eq!(config.max_participants, 50);

            let err =
                StackConfig::extract_from(StackConfig::figment_with(("fan_out_threshold", 1usize)))
                    .unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
        });
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let missing = std::env::temp_dir().join(format!("fedexec-missing-{}.toml", uuid::Uuid::new_v4()));
        temp_env::with_var("FEDEXEC_CONFIG_PATH", Some(missing.to_str().unwrap()), || {
            let err = StackConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Other(_)));
            assert!(err.to_string().contains("FEDEXEC_CONFIG_PATH"));
        });
    }

    #[test]
    fn test_toml_file() {
        let dir = std::env::temp_dir().join(format!("fedexec-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stack.toml");
        std::fs::write(
            &path,
            "fan_out_threshold = 4\neviction_policy = \"manual\"\n",
        )
        .unwrap();

        temp_env::with_vars(
            vec![
                ("FEDEXEC_CONFIG_PATH", Some(path.to_str().unwrap())),
                ("FEDEXEC_FAN_OUT_THRESHOLD", None),
            ],
            || {
                let config = StackConfig::from_env().unwrap();
                assert_eq!(config.fan_out_threshold, 4);
                assert_eq!(config.eviction_policy, EvictionPolicy::Manual);
            },
        );
        std::fs::remove_dir_all(&dir).ok();
    }
}
