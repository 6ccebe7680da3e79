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

//! Metrics instrumentation for connector observability.
//!
//! Built on the `metrics` facade: nothing is exported until the application
//! installs a recorder (Prometheus, StatsD, ...). Without one every call is a
//! no-op.
//!
//! # Naming Conventions
//!
//! - Prefixed with `cdcsink_`
//! - Unit suffix (\_seconds, \_bytes) where it applies
//! - Counters end with \_total
//!
//! # Labels
//!
//! Labels are kept low-cardinality:
//! - **collection**: collection name of the event
//! - **kind**: event kind (mutation, expiration, deletion)
//! - **destination\_type**: destination type such as "memory"
//! - **error\_type**: error category from [`DestinationError::category`](crate::destination::DestinationError::category)
//! - **reason**: flush or drop reason
//!
//! Never label with keys, sequence numbers or partition ids.
//!
//! # Examples
//!
//! ```rust
//! use cdcsink_core::metrics;
//!
//! metrics::init_metrics();
//! metrics::increment_events_received("users", "mutation");
//! metrics::record_batch_size(150);
//! metrics::set_pending_actions(12);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all connector metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "cdcsink";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Events delivered by the change stream.
///
/// Type: Counter
/// Labels: collection, kind
#[doc(hidden)]
pub const EVENTS_RECEIVED_TOTAL: &str = "cdcsink_events_received_total";

/// Events acknowledged and resolved without being written.
///
/// Type: Counter
/// Labels: reason (no_actions, malformed, unknown_kind, stale_sequence)
const EVENTS_DROPPED_TOTAL: &str = "cdcsink_events_dropped_total";

/// Acknowledgements sent to the change stream.
///
/// Type: Counter
const EVENTS_ACKED_TOTAL: &str = "cdcsink_events_acked_total";

/// Events whose writes were all confirmed.
///
/// Type: Counter
/// Labels: collection
#[doc(hidden)]
pub const EVENTS_FLUSHED_TOTAL: &str = "cdcsink_events_flushed_total";

/// Events parked after exhausting retries or hitting a permanent error.
///
/// Type: Counter
/// Labels: collection
const EVENTS_POISONED_TOTAL: &str = "cdcsink_events_poisoned_total";

/// Actions confirmed by the destination.
///
/// Type: Counter
/// Labels: destination_type
const ACTIONS_WRITTEN_TOTAL: &str = "cdcsink_actions_written_total";

/// Actions reported as failed by the destination.
///
/// Type: Counter
/// Labels: destination_type, error_type
const ACTION_FAILURES_TOTAL: &str = "cdcsink_action_failures_total";

/// Retry rounds of failed actions.
///
/// Type: Counter
/// Labels: error_type
const RETRIES_TOTAL: &str = "cdcsink_retries_total";

/// Batches handed to the destination.
///
/// Type: Counter
/// Labels: reason (size, bytes, linger, drain, shutdown)
const BATCHES_FLUSHED_TOTAL: &str = "cdcsink_batches_flushed_total";

/// Distribution of batch sizes.
///
/// Type: Histogram
/// Unit: actions
const BATCH_SIZE: &str = "cdcsink_batch_size";

/// Distribution of batch payload sizes.
///
/// Type: Histogram
/// Unit: bytes
const BATCH_BYTES: &str = "cdcsink_batch_bytes";

/// Time spent in `Destination::write_batch`.
///
/// Type: Histogram
/// Labels: destination_type
/// Unit: seconds
#[doc(hidden)]
pub const DESTINATION_WRITE_DURATION_SECONDS: &str = "cdcsink_destination_write_duration_seconds";

/// Time from the upstream event to confirmation of its last write.
///
/// Type: Histogram
/// Labels: collection
/// Unit: seconds
const END_TO_END_LAG_SECONDS: &str = "cdcsink_end_to_end_lag_seconds";

/// Successful checkpoint commits.
///
/// Type: Counter
const CHECKPOINT_COMMITS_TOTAL: &str = "cdcsink_checkpoint_commits_total";

/// Failed checkpoint commits.
///
/// Type: Counter
const CHECKPOINT_COMMIT_FAILURES_TOTAL: &str = "cdcsink_checkpoint_commit_failures_total";

/// Actions accepted but not yet confirmed.
///
/// Type: Gauge
/// Unit: actions
const PENDING_ACTIONS: &str = "cdcsink_pending_actions";

/// Events currently parked as poisoned.
///
/// Type: Gauge
/// Unit: events
const POISONED_EVENTS: &str = "cdcsink_poisoned_events";

/// Current connector status (0=stopped, 1=running, 2=error).
///
/// Type: Gauge
/// Unit: status code
const CONNECTOR_STATUS: &str = "cdcsink_connector_status";

// ============================================================================
// Initialization
// ============================================================================

/// Registers metric descriptions with the installed recorder.
///
/// Call once at startup, after installing a recorder.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_RECEIVED_TOTAL,
        "Total number of change events delivered by the change stream"
    );
    describe_counter!(
        EVENTS_DROPPED_TOTAL,
        "Total number of events acknowledged without any write"
    );
    describe_counter!(
        EVENTS_ACKED_TOTAL,
        "Total number of acknowledgements sent to the change stream"
    );
    describe_counter!(
        EVENTS_FLUSHED_TOTAL,
        "Total number of events whose writes were all confirmed"
    );
    describe_counter!(
        EVENTS_POISONED_TOTAL,
        "Total number of events poisoned after failed writes"
    );
    describe_counter!(
        ACTIONS_WRITTEN_TOTAL,
        "Total number of write actions confirmed by the destination"
    );
    describe_counter!(
        ACTION_FAILURES_TOTAL,
        "Total number of write actions the destination reported as failed"
    );
    describe_counter!(RETRIES_TOTAL, "Total number of retry rounds for failed actions");
    describe_counter!(
        BATCHES_FLUSHED_TOTAL,
        "Total number of batches handed to the destination"
    );
    describe_counter!(
        CHECKPOINT_COMMITS_TOTAL,
        "Total number of successful checkpoint commits"
    );
    describe_counter!(
        CHECKPOINT_COMMIT_FAILURES_TOTAL,
        "Total number of failed checkpoint commits"
    );

    describe_histogram!(
        BATCH_SIZE,
        metrics::Unit::Count,
        "Distribution of batch sizes (number of actions per batch)"
    );
    describe_histogram!(
        BATCH_BYTES,
        metrics::Unit::Bytes,
        "Distribution of batch payload sizes"
    );
    describe_histogram!(
        DESTINATION_WRITE_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken by a single destination batch write"
    );
    describe_histogram!(
        END_TO_END_LAG_SECONDS,
        metrics::Unit::Seconds,
        "Time between the upstream change and confirmation of its last write"
    );

    describe_gauge!(
        PENDING_ACTIONS,
        metrics::Unit::Count,
        "Number of accepted actions awaiting confirmation"
    );
    describe_gauge!(
        POISONED_EVENTS,
        metrics::Unit::Count,
        "Number of events parked as poisoned"
    );
    describe_gauge!(
        CONNECTOR_STATUS,
        "Current connector status: 0=stopped, 1=running, 2=error"
    );
}

// ============================================================================
// Counter Metrics
// ============================================================================

/// Increments the count of delivered events.
pub fn increment_events_received(collection: &str, kind: &str) {
    counter!(EVENTS_RECEIVED_TOTAL, "collection" => collection.to_string(), "kind" => kind.to_string())
        .increment(1);
}

/// Increments the count of events resolved without a write.
pub fn increment_events_dropped(reason: DropReason) {
    counter!(EVENTS_DROPPED_TOTAL, "reason" => reason.as_str()).increment(1);
}

/// Increments the count of acknowledgements.
pub fn increment_events_acked() {
    counter!(EVENTS_ACKED_TOTAL).increment(1);
}

/// Increments the count of fully written events.
pub fn increment_events_flushed(collection: &str) {
    counter!(EVENTS_FLUSHED_TOTAL, "collection" => collection.to_string()).increment(1);
}

/// Increments the count of poisoned events.
pub fn increment_events_poisoned(collection: &str) {
    counter!(EVENTS_POISONED_TOTAL, "collection" => collection.to_string()).increment(1);
}

/// Increments the count of confirmed actions by `count`.
pub fn increment_actions_written(count: u64, destination_type: &str) {
    counter!(ACTIONS_WRITTEN_TOTAL, "destination_type" => destination_type.to_string())
        .increment(count);
}

/// Increments the count of failed actions.
pub fn increment_action_failures(destination_type: &str, error_type: &'static str) {
    counter!(
        ACTION_FAILURES_TOTAL,
        "destination_type" => destination_type.to_string(),
        "error_type" => error_type
    )
    .increment(1);
}

/// Increments the count of retry rounds.
pub fn increment_retries(error_type: &'static str) {
    counter!(RETRIES_TOTAL, "error_type" => error_type).increment(1);
}

/// Increments the count of flushed batches.
pub fn increment_batches_flushed(reason: &'static str) {
    counter!(BATCHES_FLUSHED_TOTAL, "reason" => reason).increment(1);
}

/// Increments the count of successful checkpoint commits.
pub fn increment_checkpoint_commits() {
    counter!(CHECKPOINT_COMMITS_TOTAL).increment(1);
}

/// Increments the count of failed checkpoint commits.
pub fn increment_checkpoint_commit_failures() {
    counter!(CHECKPOINT_COMMIT_FAILURES_TOTAL).increment(1);
}

// ============================================================================
// Histogram Metrics
// ============================================================================

/// Records the number of actions in a flushed batch.
#[allow(clippy::cast_precision_loss)]
pub fn record_batch_size(size: usize) {
    histogram!(BATCH_SIZE).record(size as f64);
}

/// Records the payload size of a flushed batch.
#[allow(clippy::cast_precision_loss)]
pub fn record_batch_bytes(bytes: usize) {
    histogram!(BATCH_BYTES).record(bytes as f64);
}

/// Records the duration of one destination write.
pub fn record_destination_write_duration(duration: Duration, destination_type: &str) {
    histogram!(DESTINATION_WRITE_DURATION_SECONDS, "destination_type" => destination_type.to_string())
        .record(duration.as_secs_f64());
}

/// Records end-to-end lag of a fully written event.
pub fn record_end_to_end_lag(lag_seconds: f64, collection: &str) {
    histogram!(END_TO_END_LAG_SECONDS, "collection" => collection.to_string()).record(lag_seconds);
}

// ============================================================================
// Gauge Metrics
// ============================================================================

/// Sets the number of accepted actions awaiting confirmation.
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_actions(count: usize) {
    gauge!(PENDING_ACTIONS).set(count as f64);
}

/// Sets the number of parked poisoned events.
#[allow(clippy::cast_precision_loss)]
pub fn set_poisoned_events(count: usize) {
    gauge!(POISONED_EVENTS).set(count as f64);
}

/// Sets the connector status gauge.
pub fn set_connector_status(status: ConnectorStatus) {
    gauge!(CONNECTOR_STATUS).set(f64::from(status as u8));
}

// ============================================================================
// Label Types
// ============================================================================

/// Why an event was resolved without a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The mapper produced no actions
    NoActions,
    /// The record failed validation
    Malformed,
    /// The record kind is not handled
    UnknownKind,
    /// The sequence was at or below the watermark
    StaleSequence,
    /// The sequence was redelivered while its first delivery was unsettled
    DuplicateInFlight,
}

impl DropReason {
    /// Returns the reason as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoActions => "no_actions",
            Self::Malformed => "malformed",
            Self::UnknownKind => "unknown_kind",
            Self::StaleSequence => "stale_sequence",
            Self::DuplicateInFlight => "duplicate_in_flight",
        }
    }
}

/// Connector status for the `connector_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorStatus {
    /// Connector is stopped.
    Stopped = 0,
    /// Connector is running normally.
    Running = 1,
    /// Connector encountered an error.
    Error = 2,
}

// ============================================================================
// Metric Helper Utilities
// ============================================================================

/// Times an operation and records the duration when dropped.
///
/// ```rust
/// use cdcsink_core::metrics::{self, Timer};
///
/// {
///     let _timer = Timer::new("memory", metrics::record_destination_write_duration);
///     // ... operation to time ...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Creates a timer that records the elapsed time when dropped.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_reason_labels() {
        assert_eq!(DropReason::NoActions.as_str(), "no_actions");
        assert_eq!(DropReason::StaleSequence.as_str(), "stale_sequence");
    }

    #[test]
    fn test_timer_records_on_drop() {
        let recorded = std::cell::Cell::new(None);
        {
            let _timer = Timer::new("memory", |duration: Duration, label: &str| {
                recorded.set(Some((duration, label.to_string())));
            });
        }
        let (_, label) = recorded.take().unwrap();
        assert_eq!(label, "memory");
    }

    #[test]
    fn test_helpers_without_recorder() {
        // No recorder installed: every helper is a no-op.
        init_metrics();
        increment_events_received("users", "mutation");
        increment_events_dropped(DropReason::Malformed);
        record_batch_size(10);
        set_connector_status(ConnectorStatus::Running);
    }
}
