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

//! Per-partition checkpoint watermarks.
//!
//! Every delivered sequence is registered as outstanding. Once all writes of an
//! event are confirmed it is marked flushed, and the partition's watermark moves
//! forward over the contiguous run of flushed sequences:
//!
//! ```text
//! partition 0:  [7 ✓] [8 ✓] [9 …] [10 ✓] [11 …]
//!                       ▲
//!                       watermark = 8 (9 still outstanding)
//! ```
//!
//! The watermark never passes a sequence that is outstanding or poisoned, so a
//! committed checkpoint only covers events whose effects are at the destination.

use crate::event::{PartitionId, SequenceNumber};
use crate::stream::ChangeStreamClient;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Outstanding,
    Flushed,
    Poisoned,
}

#[derive(Debug, Default)]
struct PartitionLedger {
    /// Sequences above the watermark that are not yet resolved
    pending: BTreeMap<SequenceNumber, SlotState>,
    watermark: Option<SequenceNumber>,
    highest_delivered: Option<SequenceNumber>,
    committed: Option<SequenceNumber>,
}

impl PartitionLedger {
    /// Moves the watermark over the flushed prefix. Returns true if it moved.
    fn advance(&mut self) -> bool {
        let before = self.watermark;
        while let Some(entry) = self.pending.first_entry() {
            if *entry.get() != SlotState::Flushed {
                break;
            }
            self.watermark = Some(*entry.key());
            entry.remove();
        }
        self.watermark != before
    }
}

/// Outcome of [`CheckpointCoordinator::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First delivery of the sequence; it is now outstanding
    Accepted,
    /// Redelivery of a sequence at or below the watermark
    Settled,
    /// Redelivery of a sequence above the watermark; an earlier delivery
    /// still owns its acknowledgement
    Unsettled,
}

impl Registration {
    /// Returns true for a first delivery.
    #[must_use]
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

/// Outcome of one commit round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Partitions committed successfully
    pub committed: usize,
    /// Partitions whose commit failed; retried next round
    pub failed: usize,
}

/// Tracks delivered sequences and computes watermarks for every partition.
#[derive(Debug)]
pub struct CheckpointCoordinator {
    ledgers: Mutex<HashMap<PartitionId, PartitionLedger>>,
    commit_every: usize,
    advances: AtomicUsize,
    commit_requested: Notify,
}

impl CheckpointCoordinator {
    /// Creates a coordinator.
    ///
    /// With `commit_every > 0` a commit is requested after that many watermark
    /// advances; see [`commit_requested`](Self::commit_requested).
    #[must_use]
    pub fn new(commit_every: usize) -> Self {
        Self {
            ledgers: Mutex::new(HashMap::new()),
            commit_every,
            advances: AtomicUsize::new(0),
            commit_requested: Notify::new(),
        }
    }

    /// Registers a delivered sequence as outstanding.
    ///
    /// A sequence not above the highest one already delivered on `partition`
    /// leaves the ledger untouched and is classified against the watermark.
    pub async fn register(&self, partition: PartitionId, sequence: SequenceNumber) -> Registration {
        let mut ledgers = self.ledgers.lock().await;
        let ledger = ledgers.entry(partition).or_default();

        if ledger.highest_delivered.is_some_and(|highest| sequence <= highest) {
            let registration = if ledger.watermark.is_some_and(|watermark| sequence <= watermark) {
                Registration::Settled
            } else {
                Registration::Unsettled
            };
            warn!(
                partition,
                sequence,
                highest = ledger.highest_delivered,
                watermark = ledger.watermark,
                ?registration,
                "Sequence not above highest delivered"
            );
            return registration;
        }

        ledger.highest_delivered = Some(sequence);
        ledger.pending.insert(sequence, SlotState::Outstanding);
        Registration::Accepted
    }

    /// Marks a sequence as flushed and advances the watermark.
    ///
    /// Returns the new watermark if it moved. Unknown sequences are ignored.
    pub async fn mark_flushed(
        &self,
        partition: PartitionId,
        sequence: SequenceNumber,
    ) -> Option<SequenceNumber> {
        let watermark = {
            let mut ledgers = self.ledgers.lock().await;
            let ledger = ledgers.get_mut(&partition)?;
            let slot = ledger.pending.get_mut(&sequence)?;
            *slot = SlotState::Flushed;

            if !ledger.advance() {
                return None;
            }
            ledger.watermark
        };

        debug!(partition, watermark, "Watermark advanced");

        let advances = self.advances.fetch_add(1, Ordering::AcqRel) + 1;
        if self.commit_every > 0 && advances >= self.commit_every {
            self.advances.store(0, Ordering::Release);
            self.commit_requested.notify_one();
        }

        watermark
    }

    /// Marks a sequence as poisoned; the watermark stops below it.
    pub async fn mark_poisoned(&self, partition: PartitionId, sequence: SequenceNumber) {
        self.set_slot(partition, sequence, SlotState::Poisoned).await;
    }

    /// Marks a poisoned sequence as outstanding again.
    pub async fn mark_outstanding(&self, partition: PartitionId, sequence: SequenceNumber) {
        self.set_slot(partition, sequence, SlotState::Outstanding).await;
    }

    async fn set_slot(&self, partition: PartitionId, sequence: SequenceNumber, state: SlotState) {
        let mut ledgers = self.ledgers.lock().await;
        if let Some(slot) = ledgers
            .get_mut(&partition)
            .and_then(|ledger| ledger.pending.get_mut(&sequence))
        {
            *slot = state;
        }
    }

    /// Returns the watermark of `partition`.
    pub async fn watermark(&self, partition: PartitionId) -> Option<SequenceNumber> {
        self.ledgers
            .lock()
            .await
            .get(&partition)
            .and_then(|ledger| ledger.watermark)
    }

    /// Returns the watermark of every partition that has one.
    pub async fn watermarks(&self) -> HashMap<PartitionId, SequenceNumber> {
        self.ledgers
            .lock()
            .await
            .iter()
            .filter_map(|(partition, ledger)| ledger.watermark.map(|w| (*partition, w)))
            .collect()
    }

    /// Returns the last committed sequence of `partition`.
    pub async fn committed(&self, partition: PartitionId) -> Option<SequenceNumber> {
        self.ledgers
            .lock()
            .await
            .get(&partition)
            .and_then(|ledger| ledger.committed)
    }

    /// Returns the number of unresolved sequences on `partition`.
    pub async fn pending(&self, partition: PartitionId) -> usize {
        self.ledgers
            .lock()
            .await
            .get(&partition)
            .map_or(0, |ledger| ledger.pending.len())
    }

    /// Returns the partitions whose watermark is above their last commit.
    pub async fn uncommitted(&self) -> Vec<(PartitionId, SequenceNumber)> {
        let ledgers = self.ledgers.lock().await;
        let mut candidates: Vec<_> = ledgers
            .iter()
            .filter_map(|(partition, ledger)| match (ledger.watermark, ledger.committed) {
                (Some(watermark), Some(committed)) if watermark <= committed => None,
                (Some(watermark), _) => Some((*partition, watermark)),
                (None, _) => None,
            })
            .collect();
        candidates.sort_unstable();
        candidates
    }

    /// Commits `candidates` through `client`.
    ///
    /// Failures are logged and left for the next round; a commit never moves
    /// the recorded checkpoint backwards.
    pub async fn commit_to(
        &self,
        client: &dyn ChangeStreamClient,
        candidates: Vec<(PartitionId, SequenceNumber)>,
    ) -> CommitSummary {
        let mut summary = CommitSummary::default();

        for (partition, sequence) in candidates {
            match client.commit(partition, sequence).await {
                Ok(()) => {
                    let mut ledgers = self.ledgers.lock().await;
                    if let Some(ledger) = ledgers.get_mut(&partition) {
                        ledger.committed = ledger.committed.max(Some(sequence));
                    }
                    summary.committed += 1;
                    crate::metrics::increment_checkpoint_commits();
                    debug!(partition, sequence, "Checkpoint committed");
                }
                Err(e) => {
                    summary.failed += 1;
                    crate::metrics::increment_checkpoint_commit_failures();
                    warn!(partition, sequence, error = %e, "Checkpoint commit failed, will retry");
                }
            }
        }

        summary
    }

    /// Commits every uncommitted watermark.
    pub async fn commit(&self, client: &dyn ChangeStreamClient) -> CommitSummary {
        let candidates = self.uncommitted().await;
        self.commit_to(client, candidates).await
    }

    /// Signalled after `commit_every` watermark advances.
    pub fn commit_requested(&self) -> &Notify {
        &self.commit_requested
    }
}
