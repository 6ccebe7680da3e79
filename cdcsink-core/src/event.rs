//! Change Event Representation
//!
//! This module defines the normalized event type that flows through the cdcsink
//! connector. A change-stream client hands the connector raw [`ChangeRecord`]s;
//! the listener normalizes each one into an immutable [`Event`] before the
//! mapper sees it.
//!
//! # Examples
//!
//! ```rust
//! use cdcsink_core::event::{Event, EventKind};
//! use chrono::Utc;
//!
//! let event = Event::mutation(
//!     Some(b"user::42".to_vec().into()),
//!     Some(br#"{"name":"Alice"}"#.to_vec().into()),
//!     "users",
//!     Utc::now(),
//!     7,
//!     1_024,
//! )
//! .unwrap();
//!
//! assert!(event.is_mutation());
//! assert_eq!(event.kind, EventKind::Mutation);
//! assert_eq!(event.collection_name(), "users");
//! assert_eq!(event.partition, 7);
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of an independently ordered sub-stream (a data shard).
pub type PartitionId = u16;

/// Per-partition monotonic ordering token supplied by the change-stream client.
pub type SequenceNumber = u64;

/// Errors raised while normalizing a raw change record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// A required identity field was missing from the raw record.
    #[error("Malformed event at partition {partition} sequence {sequence}: missing {field}")]
    MalformedEvent {
        /// Partition the record was delivered on
        partition: PartitionId,
        /// Sequence of the record
        sequence: SequenceNumber,
        /// Name of the missing field
        field: &'static str,
    },
}

/// Kind of change captured by an [`Event`].
///
/// This is a closed set: the listener matches on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A document was created or modified
    Mutation,

    /// A document expired because its TTL elapsed
    Expiration,

    /// A document was deleted
    Deletion,
}

impl EventKind {
    /// Returns the kind as a static string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mutation => "mutation",
            Self::Expiration => "expiration",
            Self::Deletion => "deletion",
        }
    }

    /// Returns true if this kind removes the document (expiration or deletion).
    #[inline]
    #[must_use]
    pub const fn is_removal(&self) -> bool {
        matches!(self, Self::Expiration | Self::Deletion)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind tag of a raw record as delivered by the change-stream client.
///
/// `Unknown` carries the client's own name for a change kind this connector
/// does not handle, so it can be reported instead of silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Document mutation
    Mutation,
    /// Document expiration
    Expiration,
    /// Document deletion
    Deletion,
    /// A change kind the connector does not recognize
    #[serde(untagged)]
    Unknown(String),
}

/// A raw change as handed over by the change-stream client.
///
/// Only `partition` and `sequence` are guaranteed; everything else is validated
/// when the record is normalized into an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Kind of change
    pub kind: ChangeKind,

    /// Document key
    pub key: Option<Bytes>,

    /// Document body (mutations only)
    pub value: Option<Bytes>,

    /// Collection the document belongs to
    pub collection: Option<String>,

    /// Time the change happened at the source
    pub event_time: DateTime<Utc>,

    /// Partition the change was delivered on
    pub partition: PartitionId,

    /// Ordering token within the partition
    pub sequence: SequenceNumber,
}

impl ChangeRecord {
    /// Creates a mutation record.
    pub fn mutation(
        partition: PartitionId,
        sequence: SequenceNumber,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind: ChangeKind::Mutation,
            key: Some(key.into()),
            value: Some(value.into()),
            collection: None,
            event_time: Utc::now(),
            partition,
            sequence,
        }
    }

    /// Creates an expiration record.
    pub fn expiration(partition: PartitionId, sequence: SequenceNumber, key: impl Into<Bytes>) -> Self {
        Self {
            kind: ChangeKind::Expiration,
            key: Some(key.into()),
            value: None,
            collection: None,
            event_time: Utc::now(),
            partition,
            sequence,
        }
    }

    /// Creates a deletion record.
    pub fn deletion(partition: PartitionId, sequence: SequenceNumber, key: impl Into<Bytes>) -> Self {
        Self {
            kind: ChangeKind::Deletion,
            key: Some(key.into()),
            value: None,
            collection: None,
            event_time: Utc::now(),
            partition,
            sequence,
        }
    }

    /// Sets the collection name.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Sets the event time.
    #[must_use]
    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }
}

/// A normalized, immutable change event.
///
/// Values are never mutated after construction; the mapper receives a shared
/// reference and the flush engine only keeps the identity fields it needs for
/// acknowledgment and checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Kind of change
    pub kind: EventKind,

    /// Document key
    pub key: Bytes,

    /// Document body, absent for expirations and deletions
    pub value: Option<Bytes>,

    /// Collection the document belongs to
    pub collection: String,

    /// Time the change happened at the source
    pub event_time: DateTime<Utc>,

    /// Partition the event was delivered on
    pub partition: PartitionId,

    /// Ordering token within the partition
    pub sequence: SequenceNumber,
}

impl Event {
    /// Creates a mutation event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MalformedEvent`] if `key` is absent.
    pub fn mutation(
        key: Option<Bytes>,
        value: Option<Bytes>,
        collection: impl Into<String>,
        event_time: DateTime<Utc>,
        partition: PartitionId,
        sequence: SequenceNumber,
    ) -> Result<Self, EventError> {
        Self::build(EventKind::Mutation, key, value, collection, event_time, partition, sequence)
    }

    /// Creates an expiration event. Any value is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MalformedEvent`] if `key` is absent.
    pub fn expiration(
        key: Option<Bytes>,
        collection: impl Into<String>,
        event_time: DateTime<Utc>,
        partition: PartitionId,
        sequence: SequenceNumber,
    ) -> Result<Self, EventError> {
        Self::build(EventKind::Expiration, key, None, collection, event_time, partition, sequence)
    }

    /// Creates a deletion event. Any value is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MalformedEvent`] if `key` is absent.
    pub fn deletion(
        key: Option<Bytes>,
        collection: impl Into<String>,
        event_time: DateTime<Utc>,
        partition: PartitionId,
        sequence: SequenceNumber,
    ) -> Result<Self, EventError> {
        Self::build(EventKind::Deletion, key, None, collection, event_time, partition, sequence)
    }

    fn build(
        kind: EventKind,
        key: Option<Bytes>,
        value: Option<Bytes>,
        collection: impl Into<String>,
        event_time: DateTime<Utc>,
        partition: PartitionId,
        sequence: SequenceNumber,
    ) -> Result<Self, EventError> {
        let key = key.ok_or(EventError::MalformedEvent {
            partition,
            sequence,
            field: "key",
        })?;

        Ok(Self {
            kind,
            key,
            value,
            collection: collection.into(),
            event_time,
            partition,
            sequence,
        })
    }

    /// Returns true if this is a mutation.
    #[inline]
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        self.kind == EventKind::Mutation
    }

    /// Returns true if this is an expiration.
    #[inline]
    #[must_use]
    pub fn is_expiration(&self) -> bool {
        self.kind == EventKind::Expiration
    }

    /// Returns true if this is a deletion.
    #[inline]
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.kind == EventKind::Deletion
    }

    /// Returns the collection name.
    #[inline]
    #[must_use]
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Returns the key as UTF-8 if it is valid UTF-8.
    #[must_use]
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.key).ok()
    }

    /// Returns the approximate in-memory size of this event in bytes.
    #[must_use]
    pub fn estimated_size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.len()
            + self.value.as_ref().map_or(0, Bytes::len)
            + self.collection.len()
    }
}

/// Outcome of normalizing a raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// A well-formed event ready for mapping
    Event(Event),
    /// A record of a kind this connector does not handle
    Unsupported {
        /// The client's name for the kind
        kind: String,
    },
}

impl ChangeRecord {
    /// Normalizes this record into an [`Event`].
    ///
    /// A missing collection falls back to `default_collection`. Unknown kinds are
    /// returned as [`Normalized::Unsupported`] so the caller can report them.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MalformedEvent`] if the key is missing.
    pub fn normalize(self, default_collection: &str) -> Result<Normalized, EventError> {
        let collection = self
            .collection
            .unwrap_or_else(|| default_collection.to_string());

        let event = match self.kind {
            ChangeKind::Mutation => Event::mutation(
                self.key,
                self.value,
                collection,
                self.event_time,
                self.partition,
                self.sequence,
            )?,
            ChangeKind::Expiration => Event::expiration(
                self.key,
                collection,
                self.event_time,
                self.partition,
                self.sequence,
            )?,
            ChangeKind::Deletion => Event::deletion(
                self.key,
                collection,
                self.event_time,
                self.partition,
                self.sequence,
            )?,
            ChangeKind::Unknown(kind) => return Ok(Normalized::Unsupported { kind }),
        };

        Ok(Normalized::Event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_malformed() {
        let err = Event::deletion(None, "users", Utc::now(), 3, 99).unwrap_err();
        assert_eq!(
            err,
            EventError::MalformedEvent {
                partition: 3,
                sequence: 99,
                field: "key"
            }
        );
        assert!(err.to_string().contains("missing key"));
    }

    #[test]
    fn test_removals_drop_value() {
        let record = ChangeRecord {
            kind: ChangeKind::Expiration,
            key: Some(Bytes::from_static(b"k")),
            value: Some(Bytes::from_static(b"stale")),
            collection: None,
            event_time: Utc::now(),
            partition: 0,
            sequence: 1,
        };

        match record.normalize("_default").unwrap() {
            Normalized::Event(event) => {
                assert!(event.is_expiration());
                assert!(event.value.is_none());
                assert_eq!(event.collection_name(), "_default");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_reported() {
        let mut record = ChangeRecord::mutation(1, 5, "k", "v");
        record.kind = ChangeKind::Unknown("seqno_advanced".to_string());

        assert_eq!(
            record.normalize("_default").unwrap(),
            Normalized::Unsupported {
                kind: "seqno_advanced".to_string()
            }
        );
    }

    #[test]
    fn test_kind_helpers() {
        assert!(EventKind::Deletion.is_removal());
        assert!(EventKind::Expiration.is_removal());
        assert!(!EventKind::Mutation.is_removal());
        assert_eq!(EventKind::Expiration.to_string(), "expiration");
    }
}
