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

//! Flow-control acknowledgements.
//!
//! Every delivered event is acknowledged exactly once: immediately when it maps
//! to no actions, otherwise when its last action is confirmed. Acking frees the
//! event's flow-control slot on the change-stream client; it does not move the
//! checkpoint.
//!
//! The exactly-once rule is carried by the type system: an [`AckToken`] is
//! consumed by [`AckToken::ack`], so it cannot be acked twice.

use crate::event::{PartitionId, SequenceNumber};
use crate::stream::ChangeStreamClient;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hands out ack tokens bound to a change-stream client.
#[derive(Clone)]
pub struct AckRelay {
    client: Arc<dyn ChangeStreamClient>,
}

impl std::fmt::Debug for AckRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckRelay").finish_non_exhaustive()
    }
}

impl AckRelay {
    /// Creates a relay forwarding acks to `client`.
    pub fn new(client: Arc<dyn ChangeStreamClient>) -> Self {
        Self { client }
    }

    /// Creates the ack token of one delivered event.
    #[must_use]
    pub fn token(&self, partition: PartitionId, sequence: SequenceNumber) -> AckToken {
        AckToken {
            partition,
            sequence,
            client: Some(Arc::clone(&self.client)),
        }
    }
}

/// Pending acknowledgement of one delivered event.
///
/// Dropping a token without calling [`ack`](Self::ack) or
/// [`abandon`](Self::abandon) logs a warning: the upstream keeps the event's
/// flow-control slot until it redelivers.
#[must_use = "an event must be acknowledged exactly once"]
pub struct AckToken {
    partition: PartitionId,
    sequence: SequenceNumber,
    client: Option<Arc<dyn ChangeStreamClient>>,
}

impl std::fmt::Debug for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckToken")
            .field("partition", &self.partition)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl AckToken {
    /// Partition of the event.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Sequence number of the event.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// Acknowledges the event.
    pub fn ack(mut self) {
        if let Some(client) = self.client.take() {
            client.ack(self.partition, self.sequence);
            crate::metrics::increment_events_acked();
            debug!(
                partition = self.partition,
                sequence = self.sequence,
                "Event acknowledged"
            );
        }
    }

    /// Gives the token up without acknowledging.
    ///
    /// Used when the connector shuts down before the event was accepted; the
    /// upstream redelivers it after restart.
    pub fn abandon(mut self) {
        self.client = None;
        debug!(
            partition = self.partition,
            sequence = self.sequence,
            "Ack abandoned"
        );
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        if self.client.is_some() {
            warn!(
                partition = self.partition,
                sequence = self.sequence,
                "Ack token dropped without acknowledging"
            );
        }
    }
}
