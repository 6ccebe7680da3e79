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

//! Open batches and per-event bookkeeping.
//!
//! A [`Batch`] collects the actions of one partition in arrival order. Each
//! entry remembers the sequence of the event it came from, so confirmed writes
//! can be credited back to their event's [`EventTracker`].

use crate::ack::AckToken;
use crate::action::WriteAction;
use crate::config::BatchConfig;
use crate::destination::DestinationError;
use crate::event::{Event, PartitionId, SequenceNumber};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

/// Why a batch was handed to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    /// Reached `batch.max_size`
    Size,
    /// Reached `batch.max_bytes`
    Bytes,
    /// Open longer than `batch.linger_ms`
    Linger,
    /// Explicit drain (rebalance)
    Drain,
    /// Connector shutdown
    Shutdown,
}

impl FlushReason {
    /// Returns the reason as a static string for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Bytes => "bytes",
            Self::Linger => "linger",
            Self::Drain => "drain",
            Self::Shutdown => "shutdown",
        }
    }
}

/// One action together with the sequence of its event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Sequence of the originating event
    pub sequence: SequenceNumber,
    /// The write
    pub action: WriteAction,
}

/// Ordered actions of one partition awaiting a write.
#[derive(Debug)]
pub struct Batch {
    partition: PartitionId,
    entries: Vec<BatchEntry>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            entries: Vec::new(),
            bytes: 0,
            opened_at: None,
        }
    }

    /// Rebuilds a batch from entries, e.g. the failed remainder of a write.
    #[must_use]
    pub fn from_entries(partition: PartitionId, entries: Vec<BatchEntry>) -> Self {
        let bytes = entries.iter().map(|e| e.action.size_bytes()).sum();
        Self {
            partition,
            entries,
            bytes,
            opened_at: Some(Instant::now()),
        }
    }

    /// Appends an action; the first append starts the linger clock.
    pub fn push(&mut self, sequence: SequenceNumber, action: WriteAction) {
        if self.entries.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.bytes += action.size_bytes();
        self.entries.push(BatchEntry { sequence, action });
    }

    /// Partition of the batch.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Number of actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch holds no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summed size of the actions.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    /// Entries in arrival order.
    #[must_use]
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Sequences represented in the batch, ascending.
    #[must_use]
    pub fn sequences(&self) -> BTreeSet<SequenceNumber> {
        self.entries.iter().map(|e| e.sequence).collect()
    }

    /// Returns the size or byte trigger the batch has reached, if any.
    #[must_use]
    pub fn full_reason(&self, limits: &BatchConfig) -> Option<FlushReason> {
        if self.entries.len() >= limits.max_size {
            Some(FlushReason::Size)
        } else if self.bytes >= limits.max_bytes {
            Some(FlushReason::Bytes)
        } else {
            None
        }
    }

    /// When the linger timer of this batch fires; `None` while empty.
    #[must_use]
    pub fn deadline(&self, linger: std::time::Duration) -> Option<Instant> {
        if self.entries.is_empty() {
            return None;
        }
        self.opened_at.map(|opened| opened + linger)
    }

    /// Takes the contents, leaving an empty batch behind.
    #[must_use]
    pub fn take(&mut self) -> Self {
        let taken = Self {
            partition: self.partition,
            entries: std::mem::take(&mut self.entries),
            bytes: self.bytes,
            opened_at: self.opened_at,
        };
        self.bytes = 0;
        self.opened_at = None;
        taken
    }

    /// Consumes the batch into its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }

    /// Clones the actions for a destination call.
    #[must_use]
    pub fn actions(&self) -> Vec<WriteAction> {
        self.entries.iter().map(|e| e.action.clone()).collect()
    }
}

/// An event accepted by the flush engine.
///
/// Holds what is needed once the event's writes are resolved: its ack token,
/// its share of the backpressure budget and a little context for logs and
/// metrics.
#[derive(Debug)]
pub struct PendingEvent {
    /// Partition of the event
    pub partition: PartitionId,
    /// Sequence of the event
    pub sequence: SequenceNumber,
    /// Collection of the event
    pub collection: String,
    /// Upstream event time
    pub event_time: DateTime<Utc>,
    /// Acknowledgement owed to the change stream
    pub ack: AckToken,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl PendingEvent {
    /// Creates the pending form of `event`.
    #[must_use]
    pub fn new(event: &Event, ack: AckToken) -> Self {
        Self {
            partition: event.partition,
            sequence: event.sequence,
            collection: event.collection.clone(),
            event_time: event.event_time,
            ack,
            permit: None,
        }
    }
}

/// Write progress of one event.
#[derive(Debug)]
pub(crate) struct EventTracker {
    pub(crate) event: PendingEvent,
    /// Actions not yet confirmed, including ones not yet appended to a batch
    pub(crate) outstanding: usize,
    /// Actions held back while a batch holding earlier ones is written
    pub(crate) unsent: Vec<WriteAction>,
    /// Flush attempts in which one of the event's actions failed
    pub(crate) attempts: u32,
    pub(crate) last_error: Option<DestinationError>,
}

impl EventTracker {
    pub(crate) fn new(event: PendingEvent, actions: usize) -> Self {
        Self {
            event,
            outstanding: actions,
            unsent: Vec::new(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Credits one confirmed action.
    pub(crate) fn confirm(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Returns true once every action is confirmed.
    pub(crate) fn is_settled(&self) -> bool {
        self.outstanding == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(max_size: usize, max_bytes: usize) -> BatchConfig {
        BatchConfig {
            max_size,
            max_bytes,
            linger_ms: 1_000,
        }
    }

    #[test]
    fn test_size_trigger() {
        let mut batch = Batch::new(0);
        batch.push(1, WriteAction::upsert("a", "1"));
        assert_eq!(batch.full_reason(&limits(2, 1024)), None);

        batch.push(1, WriteAction::upsert("b", "2"));
        assert_eq!(batch.full_reason(&limits(2, 1024)), Some(FlushReason::Size));
    }

    #[test]
    fn test_byte_trigger() {
        let mut batch = Batch::new(0);
        batch.push(1, WriteAction::upsert("key", "0123456789"));
        assert_eq!(batch.size_bytes(), 13);
        assert_eq!(batch.full_reason(&limits(100, 10)), Some(FlushReason::Bytes));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_starts_at_first_push() {
        let mut batch = Batch::new(3);
        assert_eq!(batch.deadline(Duration::from_millis(50)), None);

        let opened = Instant::now();
        batch.push(7, WriteAction::delete("k"));
        tokio::time::advance(Duration::from_millis(20)).await;
        batch.push(8, WriteAction::delete("k"));

        assert_eq!(
            batch.deadline(Duration::from_millis(50)),
            Some(opened + Duration::from_millis(50))
        );
    }

    #[test]
    fn test_take_resets() {
        let mut batch = Batch::new(2);
        batch.push(10, WriteAction::upsert("a", "x"));
        batch.push(11, WriteAction::delete("b"));

        let taken = batch.take();
        assert_eq!(taken.partition(), 2);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken.sequences().into_iter().collect::<Vec<_>>(), vec![10, 11]);
        assert!(batch.is_empty());
        assert_eq!(batch.size_bytes(), 0);
        assert_eq!(batch.deadline(Duration::from_secs(1)), None);
    }

    #[test]
    fn test_from_entries_counts_bytes() {
        let entries = vec![
            BatchEntry {
                sequence: 1,
                action: WriteAction::upsert("ab", "cd"),
            },
            BatchEntry {
                sequence: 2,
                action: WriteAction::delete("e"),
            },
        ];
        let batch = Batch::from_entries(1, entries);
        assert_eq!(batch.size_bytes(), 5);
        assert_eq!(batch.actions().len(), 2);
    }
}
