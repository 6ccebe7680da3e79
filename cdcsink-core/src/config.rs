// Copyright 2025 cdcsink Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Connector configuration.
//!
//! A [`ConnectorConfig`] is built in code with [`ConnectorConfig::builder`] or
//! loaded from YAML. Every field has a default, so a file only lists what it
//! changes:
//!
//! ```yaml
//! batch:
//!   max_size: 500
//!   linger_ms: 250
//! retry:
//!   limit: 5
//! workers: 4
//! poison_policy: skip
//! ```
//!
//! Durations are given in milliseconds.

use crate::stream::CheckpointMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors, reported before anything starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for this schema
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_yaml::Error,
    },

    /// A value is out of range
    #[error("Invalid value for {field}: {message}")]
    Invalid {
        /// Dotted option name
        field: &'static str,
        /// What is wrong with it
        message: String,
    },

    /// A required component was not supplied
    #[error("Missing required component: {0}")]
    Missing(&'static str),
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// What happens to an event whose writes cannot succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoisonPolicy {
    /// Keep the event unacknowledged and hold its partition watermark until an
    /// operator resolves it
    #[default]
    Block,
    /// Log the event, acknowledge it and let the watermark move past it
    Skip,
}

/// Flush triggers of open batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Actions per batch before a size-triggered flush
    pub max_size: usize,
    /// Summed action bytes before a byte-triggered flush
    pub max_bytes: usize,
    /// Maximum age of an open batch, in milliseconds
    pub linger_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 2048,
            max_bytes: 10 * 1024 * 1024,
            linger_ms: 10_000,
        }
    }
}

impl BatchConfig {
    /// Linger timeout as a [`Duration`].
    #[must_use]
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

/// Retry behavior for failed actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries per event before it is poisoned
    pub limit: u32,
    /// First backoff, doubled per attempt
    pub initial_delay_ms: u64,
    /// Backoff cap
    pub max_delay_ms: u64,
    /// Jitter factor in `[0.0, 1.0]`
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based).
    ///
    /// Exponential with a cap; jitter spreads the result over
    /// `[base * (1 - jitter/2), base * (1 + jitter/2)]`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let base_ms = self
            .initial_delay_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_delay_ms);

        if self.jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            Duration::from_millis(((base_ms as f64) + jitter).max(0.0) as u64)
        } else {
            Duration::from_millis(base_ms)
        }
    }
}

/// Bounds on accepted but unconfirmed work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackpressureConfig {
    /// Un-flushed actions held before intake blocks
    pub high_water_mark: usize,
    /// Intake queue depth per worker
    pub channel_capacity: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 8192,
            channel_capacity: 1024,
        }
    }
}

/// Checkpoint commit schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Periodic commit interval, in milliseconds
    pub interval_ms: u64,
    /// Also commit after this many watermark advances (0 disables)
    pub commit_every: usize,
    /// Must be [`CheckpointMode::Manual`]
    pub mode: CheckpointMode,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            commit_every: 0,
            mode: CheckpointMode::Manual,
        }
    }
}

impl CheckpointConfig {
    /// Commit interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Complete connector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Flush triggers
    pub batch: BatchConfig,
    /// Retry behavior
    pub retry: RetryConfig,
    /// Intake bounds
    pub backpressure: BackpressureConfig,
    /// Number of flush workers
    pub workers: usize,
    /// Commit schedule
    pub checkpoint: CheckpointConfig,
    /// Handling of events that cannot be written
    pub poison_policy: PoisonPolicy,
    /// Collection used when a record carries none
    pub default_collection: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            backpressure: BackpressureConfig::default(),
            workers: 1,
            checkpoint: CheckpointConfig::default(),
            poison_policy: PoisonPolicy::default(),
            default_collection: "_default".to_string(),
        }
    }
}

impl ConnectorConfig {
    /// Creates a new builder for `ConnectorConfig`.
    #[must_use]
    pub fn builder() -> ConnectorConfigBuilder {
        ConnectorConfigBuilder::default()
    }

    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed YAML or unknown options.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Loads a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first value out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_size == 0 {
            return Err(ConfigError::invalid("batch.max_size", "must be greater than 0"));
        }
        if self.batch.max_bytes == 0 {
            return Err(ConfigError::invalid("batch.max_bytes", "must be greater than 0"));
        }
        if self.batch.linger_ms == 0 {
            return Err(ConfigError::invalid("batch.linger_ms", "must be greater than 0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.initial_delay_ms",
                format!(
                    "{} exceeds retry.max_delay_ms ({})",
                    self.retry.initial_delay_ms, self.retry.max_delay_ms
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must be within [0.0, 1.0]"));
        }
        if self.backpressure.high_water_mark == 0 {
            return Err(ConfigError::invalid(
                "backpressure.high_water_mark",
                "must be greater than 0",
            ));
        }
        if u32::try_from(self.backpressure.high_water_mark).is_err() {
            return Err(ConfigError::invalid(
                "backpressure.high_water_mark",
                format!("must not exceed {}", u32::MAX),
            ));
        }
        if self.backpressure.channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "backpressure.channel_capacity",
                "must be greater than 0",
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be greater than 0"));
        }
        if self.checkpoint.interval_ms == 0 {
            return Err(ConfigError::invalid(
                "checkpoint.interval_ms",
                "must be greater than 0",
            ));
        }
        if self.checkpoint.mode != CheckpointMode::Manual {
            return Err(ConfigError::invalid(
                "checkpoint.mode",
                "only manual checkpointing is supported",
            ));
        }
        if self.default_collection.is_empty() {
            return Err(ConfigError::invalid("default_collection", "must not be empty"));
        }
        Ok(())
    }
}

/// Builder for `ConnectorConfig`.
///
/// ```rust
/// use cdcsink_core::config::{ConnectorConfig, PoisonPolicy};
/// use std::time::Duration;
///
/// let config = ConnectorConfig::builder()
///     .batch_max_size(500)
///     .batch_linger(Duration::from_millis(250))
///     .workers(4)
///     .poison_policy(PoisonPolicy::Skip)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.batch.max_size, 500);
/// assert_eq!(config.retry.limit, 3);
/// ```
#[derive(Debug, Default)]
pub struct ConnectorConfigBuilder {
    config: ConnectorConfig,
}

#[allow(clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

impl ConnectorConfigBuilder {
    /// Sets the maximum number of actions per batch.
    #[must_use]
    pub fn batch_max_size(mut self, size: usize) -> Self {
        self.config.batch.max_size = size;
        self
    }

    /// Sets the maximum summed action bytes per batch.
    #[must_use]
    pub fn batch_max_bytes(mut self, bytes: usize) -> Self {
        self.config.batch.max_bytes = bytes;
        self
    }

    /// Sets the linger timeout of open batches.
    #[must_use]
    pub fn batch_linger(mut self, linger: Duration) -> Self {
        self.config.batch.linger_ms = millis(linger);
        self
    }

    /// Sets the number of retries before an event is poisoned.
    #[must_use]
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.retry.limit = limit;
        self
    }

    /// Sets the first retry delay.
    #[must_use]
    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.config.retry.initial_delay_ms = millis(delay);
        self
    }

    /// Sets the retry delay cap.
    #[must_use]
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay_ms = millis(delay);
        self
    }

    /// Sets the retry jitter factor.
    #[must_use]
    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    /// Sets the backpressure high-water mark, in actions.
    #[must_use]
    pub fn high_water_mark(mut self, actions: usize) -> Self {
        self.config.backpressure.high_water_mark = actions;
        self
    }

    /// Sets the intake queue depth per worker.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.backpressure.channel_capacity = capacity;
        self
    }

    /// Sets the number of flush workers.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Sets the periodic commit interval.
    #[must_use]
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint.interval_ms = millis(interval);
        self
    }

    /// Commits after `advances` watermark advances.
    #[must_use]
    pub fn commit_every(mut self, advances: usize) -> Self {
        self.config.checkpoint.commit_every = advances;
        self
    }

    /// Sets the poison policy.
    #[must_use]
    pub fn poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.config.poison_policy = policy;
        self
    }

    /// Sets the collection used for records without one.
    #[must_use]
    pub fn default_collection(mut self, collection: impl Into<String>) -> Self {
        self.config.default_collection = collection.into();
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a value is out of range.
    pub fn build(self) -> Result<ConnectorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Where the connector configuration comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A configuration value
    Inline(ConnectorConfig),
    /// Path of a YAML file
    File(PathBuf),
}

impl ConfigSource {
    /// Resolves and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be loaded or a value is invalid.
    pub fn load(self) -> Result<ConnectorConfig, ConfigError> {
        let config = match self {
            Self::Inline(config) => config,
            Self::File(path) => ConnectorConfig::from_file(path)?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<ConnectorConfig> for ConfigSource {
    fn from(config: ConnectorConfig) -> Self {
        Self::Inline(config)
    }
}

impl From<PathBuf> for ConfigSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for ConfigSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl From<&str> for ConfigSource {
    fn from(path: &str) -> Self {
        Self::File(PathBuf::from(path))
    }
}

impl From<String> for ConfigSource {
    fn from(path: String) -> Self {
        Self::File(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::default();
        assert_eq!(config.batch.max_size, 2048);
        assert_eq!(config.batch.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.batch.linger(), Duration::from_secs(10));
        assert_eq!(config.retry.limit, 3);
        assert_eq!(config.backpressure.high_water_mark, 8192);
        assert_eq!(config.workers, 1);
        assert_eq!(config.checkpoint.interval(), Duration::from_secs(10));
        assert_eq!(config.poison_policy, PoisonPolicy::Block);
        assert_eq!(config.default_collection, "_default");
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ConnectorConfig::from_yaml_str(
            "batch:\n  max_size: 10\nworkers: 3\npoison_policy: skip\n",
        )
        .unwrap();

        assert_eq!(config.batch.max_size, 10);
        assert_eq!(config.batch.linger_ms, 10_000);
        assert_eq!(config.workers, 3);
        assert_eq!(config.poison_policy, PoisonPolicy::Skip);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = ConnectorConfig::from_yaml_str("batch:\n  max_items: 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_auto_checkpoint_rejected() {
        let config = ConnectorConfig::from_yaml_str("checkpoint:\n  mode: auto\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "checkpoint.mode",
                ..
            }
        ));
    }

    #[test]
    fn test_builder_validates() {
        let err = ConnectorConfig::builder().workers(0).build().unwrap_err();
        assert!(err.to_string().contains("workers"));

        let err = ConnectorConfig::builder()
            .retry_initial_delay(Duration::from_secs(60))
            .retry_max_delay(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "retry.initial_delay_ms",
                ..
            }
        ));

        assert!(ConnectorConfig::builder().retry_jitter(1.5).build().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            limit: 5,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
        };

        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(10), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let retry = RetryConfig {
            jitter: 0.2,
            ..RetryConfig::default()
        };

        for _ in 0..100 {
            let delay = retry.backoff(1).as_millis();
            assert!((90..=110).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_config_source_conversions() {
        assert!(matches!(
            ConfigSource::from(ConnectorConfig::default()),
            ConfigSource::Inline(_)
        ));
        assert!(matches!(ConfigSource::from("cdcsink.yml"), ConfigSource::File(_)));
        assert!(matches!(
            ConfigSource::from(Path::new("cdcsink.yml")),
            ConfigSource::File(_)
        ));
    }
}
