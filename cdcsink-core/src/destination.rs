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

//! Destination Trait and Error Types
//!
//! This module defines the [`Destination`] trait implemented by every target-store
//! write client. Destinations are the final stage of the connector: the flush
//! engine hands them one batch of [`WriteAction`]s at a time and expects a
//! success or failure for every action in return.
//!
//! # Per-Action Results
//!
//! [`Destination::write_batch`] returns one `Result` per action, in input order.
//! The flush engine only confirms the actions that succeeded and retries the
//! events that own the failed ones, so a destination should report partial
//! failures precisely instead of failing the whole call. An `Err` from the call
//! itself means *no* action was applied.
//!
//! # Implementing a Custom Destination
//!
//! ```rust
//! use cdcsink_core::action::{ActionKind, WriteAction};
//! use cdcsink_core::destination::{ActionResult, Destination, DestinationError};
//! use async_trait::async_trait;
//! use std::collections::HashMap;
//!
//! /// Keeps the latest document per key.
//! #[derive(Default)]
//! pub struct KeyValueDestination {
//!     documents: HashMap<Vec<u8>, Vec<u8>>,
//! }
//!
//! #[async_trait]
//! impl Destination for KeyValueDestination {
//!     async fn write_batch(
//!         &mut self,
//!         actions: &[WriteAction],
//!     ) -> Result<Vec<ActionResult>, DestinationError> {
//!         Ok(actions
//!             .iter()
//!             .map(|action| match &action.kind {
//!                 ActionKind::Upsert => {
//!                     let body = action.payload.clone().unwrap_or_default();
//!                     self.documents.insert(action.target_key.to_vec(), body.to_vec());
//!                     Ok(())
//!                 }
//!                 ActionKind::Delete => {
//!                     self.documents.remove(action.target_key.as_ref());
//!                     Ok(())
//!                 }
//!                 other => Err(DestinationError::unsupported(other.label())),
//!             })
//!             .collect())
//!     }
//!
//!     async fn flush(&mut self) -> Result<(), DestinationError> {
//!         Ok(())
//!     }
//! }
//! ```
//!
//! # Error Handling
//!
//! The [`DestinationError`] type classifies failures:
//! - [`DestinationError::ConnectionError`]: Network/connection failures (retryable)
//! - [`DestinationError::WriteError`]: Write operation failures (may be retryable)
//! - [`DestinationError::RejectedError`]: The store refused the action (non-retryable)
//! - [`DestinationError::CapacityError`]: Resource limits exceeded (backpressure signal)
//!
//! Non-retryable failures poison the owning event immediately; retryable ones are
//! retried with exponential backoff up to the configured limit.

use crate::action::{ActionKind, WriteAction};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Result of a single action within a batch.
pub type ActionResult = Result<(), DestinationError>;

/// Errors that can occur when writing to a destination.
#[derive(Error, Debug, Clone)]
pub enum DestinationError {
    /// Connection to the destination failed.
    ///
    /// Retryable after a backoff period: timeouts, refused connections, DNS
    /// failures.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Human-readable error message
        message: String,
    },

    /// Failed to write an action.
    ///
    /// Retryability depends on the cause (temporary unavailability vs. a
    /// permission problem).
    #[error("Write error: {message}")]
    WriteError {
        /// Human-readable error message
        message: String,
        /// Whether this specific write error is retryable
        retryable: bool,
    },

    /// The destination refused the action (invalid document, unsupported operation).
    ///
    /// Never retryable.
    #[error("Rejected: {message}")]
    RejectedError {
        /// Human-readable error message
        message: String,
    },

    /// Invalid destination configuration. Never retryable.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Human-readable error message
        message: String,
        /// Configuration parameter name if applicable
        parameter: Option<String>,
    },

    /// Destination capacity exceeded; the caller should back off.
    #[error("Capacity error: {message}")]
    CapacityError {
        /// Human-readable error message
        message: String,
        /// Suggested wait time before retry
        retry_after: Option<Duration>,
    },
}

impl DestinationError {
    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a write error with retryability information.
    #[must_use]
    pub fn write(message: impl Into<String>, retryable: bool) -> Self {
        Self::WriteError {
            message: message.into(),
            retryable,
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::RejectedError {
            message: message.into(),
        }
    }

    /// Creates a rejection for an operation the destination does not support.
    #[must_use]
    pub fn unsupported(operation: &str) -> Self {
        Self::RejectedError {
            message: format!("unsupported operation: {operation}"),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>, parameter: Option<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            parameter,
        }
    }

    /// Creates a capacity error.
    #[must_use]
    pub fn capacity(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::CapacityError {
            message: message.into(),
            retry_after,
        }
    }

    /// Returns whether this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError { .. } | Self::CapacityError { .. } => true,
            Self::RejectedError { .. } | Self::ConfigurationError { .. } => false,
            Self::WriteError { retryable, .. } => *retryable,
        }
    }

    /// Returns suggested wait time before retry, if applicable.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CapacityError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns a low-cardinality category for metric labels.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ConnectionError { .. } => "connection_error",
            Self::WriteError { .. } => "write_error",
            Self::RejectedError { .. } => "rejected_error",
            Self::ConfigurationError { .. } => "configuration_error",
            Self::CapacityError { .. } => "capacity_error",
        }
    }
}

/// Metadata about a destination's capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationMetadata {
    /// Human-readable destination name
    pub name: String,

    /// Destination type identifier, used as a metric label
    pub destination_type: String,

    /// Maximum batch size hint (None = no limit)
    pub max_batch_size: Option<usize>,

    /// Additional destination-specific metadata
    pub properties: HashMap<String, String>,
}

impl DestinationMetadata {
    /// Creates new metadata with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, destination_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination_type: destination_type.into(),
            max_batch_size: None,
            properties: HashMap::new(),
        }
    }

    /// Sets maximum batch size.
    #[must_use]
    pub const fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    /// Adds a custom property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// The target-store write client.
///
/// Implementations must be `Send + Sync`; the connector holds the destination
/// behind an async mutex and calls it from its flush workers.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Executes a batch of write actions.
    ///
    /// Returns one result per action, in the same order as `actions`. A result
    /// vector of any other length is treated as a retryable failure of the whole
    /// batch. Returning `Err` means no action in the batch was applied.
    ///
    /// Empty batches should succeed with an empty vector.
    async fn write_batch(
        &mut self,
        actions: &[WriteAction],
    ) -> Result<Vec<ActionResult>, DestinationError>;

    /// Flushes any buffered data to ensure durability.
    ///
    /// After `flush()` returns successfully, every action previously reported as
    /// successful must be durable. Should be idempotent.
    async fn flush(&mut self) -> Result<(), DestinationError>;

    /// Closes the destination and releases resources.
    ///
    /// The default implementation just calls `flush()`.
    async fn close(&mut self) -> Result<(), DestinationError> {
        self.flush().await
    }

    /// Returns metadata about this destination's capabilities.
    fn metadata(&self) -> DestinationMetadata {
        DestinationMetadata::new("Unknown", "unknown")
    }
}

/// In-memory destination that applies actions to a key-value map.
///
/// Supports failure injection per key, which the tests use to exercise the
/// partial-failure and poison paths.
///
/// ```rust
/// use cdcsink_core::action::WriteAction;
/// use cdcsink_core::destination::{Destination, MemoryDestination};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut dest = MemoryDestination::new().with_failing_key("bad", 1);
///
/// let results = dest
///     .write_batch(&[WriteAction::upsert("good", "1"), WriteAction::upsert("bad", "2")])
///     .await?;
///
/// assert!(results[0].is_ok());
/// assert!(results[1].is_err());
/// assert_eq!(dest.get("good").as_deref(), Some(&b"1"[..]));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryDestination {
    /// Current document per key
    documents: HashMap<Bytes, Bytes>,
    /// Every successfully applied action, in order
    applied: Vec<WriteAction>,
    /// Sizes of every `write_batch` call
    batch_sizes: Vec<usize>,
    /// Remaining injected failures per key
    failing_keys: HashMap<Bytes, usize>,
    /// Keys the destination always rejects
    rejected_keys: HashSet<Bytes>,
    /// Whether every call fails as a whole
    unavailable: bool,
    /// Simulated latency per call
    latency: Option<Duration>,
    /// Number of times flush was called
    flush_count: usize,
    /// Number of times close was called
    close_count: usize,
}

impl MemoryDestination {
    /// Creates a new empty destination.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `times` writes of `key` with a retryable error.
    #[must_use]
    pub fn with_failing_key(mut self, key: impl Into<Bytes>, times: usize) -> Self {
        self.failing_keys.insert(key.into(), times);
        self
    }

    /// Rejects every write of `key` with a non-retryable error.
    #[must_use]
    pub fn with_rejected_key(mut self, key: impl Into<Bytes>) -> Self {
        self.rejected_keys.insert(key.into());
        self
    }

    /// Fails every call as a whole with a connection error.
    #[must_use]
    pub const fn with_unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Sleeps for `latency` on every `write_batch` call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Toggles whole-call unavailability.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    /// Returns the current document stored under `key`.
    #[must_use]
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<Bytes> {
        self.documents.get(key.as_ref()).cloned()
    }

    /// Returns the number of documents currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if no documents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Returns every successfully applied action, in order.
    #[must_use]
    pub fn applied(&self) -> &[WriteAction] {
        &self.applied
    }

    /// Returns the size of every `write_batch` call received.
    #[must_use]
    pub fn batch_sizes(&self) -> &[usize] {
        &self.batch_sizes
    }

    /// Returns the number of times flush was called.
    #[must_use]
    pub const fn flush_count(&self) -> usize {
        self.flush_count
    }

    /// Returns the number of times close was called.
    #[must_use]
    pub const fn close_count(&self) -> usize {
        self.close_count
    }

    fn apply(&mut self, action: &WriteAction) -> ActionResult {
        if self.rejected_keys.contains(&action.target_key) {
            return Err(DestinationError::rejected("Simulated rejection"));
        }

        if let Some(remaining) = self.failing_keys.get_mut(&action.target_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DestinationError::write("Simulated write failure", true));
            }
        }

        match &action.kind {
            ActionKind::Upsert => {
                let body = action.payload.clone().unwrap_or_default();
                self.documents.insert(action.target_key.clone(), body);
            }
            ActionKind::Delete | ActionKind::Expire { .. } => {
                self.documents.remove(&action.target_key);
            }
            ActionKind::Custom(_) => {}
        }

        self.applied.push(action.clone());
        Ok(())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn write_batch(
        &mut self,
        actions: &[WriteAction],
    ) -> Result<Vec<ActionResult>, DestinationError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.unavailable {
            return Err(DestinationError::connection("Simulated outage"));
        }

        self.batch_sizes.push(actions.len());
        Ok(actions.iter().map(|action| self.apply(action)).collect())
    }

    async fn flush(&mut self) -> Result<(), DestinationError> {
        self.flush_count += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DestinationError> {
        self.close_count += 1;
        self.flush().await
    }

    fn metadata(&self) -> DestinationMetadata {
        DestinationMetadata::new("MemoryDestination", "memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_destination_applies_actions() {
        let mut dest = MemoryDestination::new();

        let results = dest
            .write_batch(&[
                WriteAction::upsert("a", "1"),
                WriteAction::upsert("b", "2"),
                WriteAction::delete("a"),
            ])
            .await
            .unwrap();

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(dest.get("a"), None);
        assert_eq!(dest.get("b"), Some(Bytes::from_static(b"2")));
        assert_eq!(dest.applied().len(), 3);
        assert_eq!(dest.batch_sizes(), &[3]);
    }

    #[tokio::test]
    async fn test_memory_destination_empty_batch() {
        let mut dest = MemoryDestination::new();

        let results = dest.write_batch(&[]).await.unwrap();
        assert!(results.is_empty());
        assert!(dest.is_empty());
    }

    #[tokio::test]
    async fn test_failing_key_recovers() {
        let mut dest = MemoryDestination::new().with_failing_key("k", 1);

        let first = dest.write_batch(&[WriteAction::upsert("k", "v")]).await.unwrap();
        let err = first[0].as_ref().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, DestinationError::WriteError { .. }));

        let second = dest.write_batch(&[WriteAction::upsert("k", "v")]).await.unwrap();
        assert!(second[0].is_ok());
        assert_eq!(dest.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_key_never_succeeds() {
        let mut dest = MemoryDestination::new().with_rejected_key("k");

        for _ in 0..3 {
            let results = dest.write_batch(&[WriteAction::upsert("k", "v")]).await.unwrap();
            assert!(!results[0].as_ref().unwrap_err().is_retryable());
        }
        assert!(dest.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_fails_whole_call() {
        let mut dest = MemoryDestination::new().with_unavailable();

        let err = dest
            .write_batch(&[WriteAction::upsert("k", "v")])
            .await
            .unwrap_err();
        assert!(matches!(err, DestinationError::ConnectionError { .. }));
        assert!(dest.batch_sizes().is_empty());

        dest.set_unavailable(false);
        assert!(dest.write_batch(&[WriteAction::upsert("k", "v")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_flushes() {
        let mut dest = MemoryDestination::new();

        dest.close().await.unwrap();
        assert_eq!(dest.close_count(), 1);
        assert_eq!(dest.flush_count(), 1);
    }

    #[test]
    fn test_destination_error_retryable() {
        assert!(DestinationError::connection("test").is_retryable());
        assert!(DestinationError::write("test", true).is_retryable());
        assert!(!DestinationError::write("test", false).is_retryable());
        assert!(!DestinationError::rejected("test").is_retryable());
        assert!(!DestinationError::configuration("test", None).is_retryable());
        assert!(DestinationError::capacity("test", None).is_retryable());
    }

    #[test]
    fn test_destination_error_retry_after() {
        let duration = Duration::from_secs(5);
        let err = DestinationError::capacity("test", Some(duration));

        assert_eq!(err.retry_after(), Some(duration));
        assert_eq!(err.category(), "capacity_error");
    }

    #[test]
    fn test_destination_metadata_builder() {
        let meta = DestinationMetadata::new("Couchbase", "couchbase")
            .with_max_batch_size(2048)
            .with_property("bucket", "target");

        assert_eq!(meta.name, "Couchbase");
        assert_eq!(meta.max_batch_size, Some(2048));
        assert_eq!(meta.properties.get("bucket"), Some(&"target".to_string()));
    }
}
