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

//! Change-stream client boundary.
//!
//! The connector never talks to the change stream's transport directly. It only
//! sees the narrow [`ChangeStreamClient`] interface:
//!
//! ```text
//! ┌─────────────────────┐  on_change(record)   ┌────────────────┐
//! │ ChangeStreamClient  │ ───────────────────► │ EventListener  │
//! │  (one task per      │                      │  (connector)   │
//! │   partition)        │ ◄─── ack(p, seq) ─── │                │
//! │                     │ ◄─ commit(p, seq) ── │                │
//! └─────────────────────┘                      └────────────────┘
//! ```
//!
//! Partition assignment, rollback handling and reconnection stay inside the
//! client. The client must deliver records of one partition sequentially, waiting
//! for `on_change` to return before delivering the next record of that partition.
//!
//! [`MemoryChangeStream`] is an in-process client for tests and demos.

use crate::event::{ChangeRecord, PartitionId, SequenceNumber};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors reported by a change-stream client.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The upstream is temporarily unavailable. The caller may retry later; the
    /// connector does not retry the connection itself.
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// Committing a checkpoint failed.
    #[error("Checkpoint commit failed for partition {partition} at {sequence}: {message}")]
    Commit {
        /// Partition being committed
        partition: PartitionId,
        /// Sequence being committed
        sequence: SequenceNumber,
        /// Human-readable error message
        message: String,
    },

    /// The client cannot run with the requested configuration.
    #[error("Stream configuration error: {0}")]
    Configuration(String),

    /// The client was closed.
    #[error("Change stream is closed")]
    Closed,
}

impl StreamError {
    /// Returns true if retrying the operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Commit { .. })
    }
}

/// How checkpoints advance on the change-stream client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// Checkpoints only move when the consumer calls `commit`
    #[default]
    Manual,
    /// The client advances checkpoints on its own
    Auto,
}

/// Receiver of change records, implemented by the connector.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Handles one record. Returns once the record is accepted into the
    /// pipeline, which may take a while under backpressure.
    async fn on_change(&self, record: ChangeRecord);
}

/// The change-stream client as seen by the connector.
#[async_trait]
pub trait ChangeStreamClient: Send + Sync + 'static {
    /// Switches the client to manual checkpointing.
    ///
    /// Called once while the connector is built.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot checkpoint manually.
    fn enable_manual_checkpoint(&self) -> Result<(), StreamError>;

    /// Starts delivering records to `listener`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be started.
    async fn start(&self, listener: Arc<dyn EventListener>) -> Result<(), StreamError>;

    /// Resolves once stream positions are established.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Unavailable`] if the upstream cannot be reached.
    async fn wait_until_ready(&self) -> Result<(), StreamError>;

    /// Persists the checkpoint of `partition` at `sequence`.
    ///
    /// Must be idempotent: committing the same or a lower sequence again is safe.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Commit`] if the checkpoint was not persisted.
    async fn commit(&self, partition: PartitionId, sequence: SequenceNumber)
        -> Result<(), StreamError>;

    /// Frees the flow-control slot of one delivered record.
    fn ack(&self, partition: PartitionId, sequence: SequenceNumber);

    /// Stops delivery. Resolves once no `on_change` call is in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the client did not shut down cleanly.
    async fn close(&self) -> Result<(), StreamError>;
}

#[derive(Default)]
struct MemoryStreamState {
    /// Per-partition record queues
    senders: HashMap<PartitionId, mpsc::UnboundedSender<ChangeRecord>>,
    /// Receivers waiting for `start`
    receivers: HashMap<PartitionId, mpsc::UnboundedReceiver<ChangeRecord>>,
    /// Listener, set by `start`
    listener: Option<Arc<dyn EventListener>>,
    /// One delivery task per partition
    tasks: Vec<JoinHandle<()>>,
    checkpoint_mode: CheckpointMode,
    commits: Vec<(PartitionId, SequenceNumber)>,
    acks: Vec<(PartitionId, SequenceNumber)>,
    failing_commits: usize,
    readiness_error: Option<String>,
}

struct MemoryStreamInner {
    state: Mutex<MemoryStreamState>,
    ready: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

/// In-process change-stream client.
///
/// Records are queued per partition with [`MemoryChangeStream::push`] and
/// delivered by one task per partition once started. Commits and acks are
/// recorded for inspection. Cloning yields another handle to the same stream.
///
/// ```rust
/// use cdcsink_core::event::ChangeRecord;
/// use cdcsink_core::stream::MemoryChangeStream;
///
/// let stream = MemoryChangeStream::ready();
/// stream.push(ChangeRecord::mutation(0, 1, "k1", "v1"));
/// stream.push(ChangeRecord::deletion(0, 2, "k1"));
///
/// assert!(stream.commits().is_empty());
/// ```
#[derive(Clone)]
pub struct MemoryChangeStream {
    inner: Arc<MemoryStreamInner>,
}

impl Default for MemoryChangeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChangeStream")
            .field("ready", &*self.inner.ready.borrow())
            .field("closed", &*self.inner.closed.borrow())
            .finish_non_exhaustive()
    }
}

impl MemoryChangeStream {
    /// Creates a stream that is not ready until [`mark_ready`](Self::mark_ready).
    #[must_use]
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(MemoryStreamInner {
                state: Mutex::new(MemoryStreamState::default()),
                ready,
                closed,
            }),
        }
    }

    /// Creates a stream that is ready immediately.
    #[must_use]
    pub fn ready() -> Self {
        let stream = Self::new();
        stream.mark_ready();
        stream
    }

    /// Makes `wait_until_ready` fail with [`StreamError::Unavailable`].
    #[must_use]
    pub fn with_unavailable_upstream(self, message: impl Into<String>) -> Self {
        self.state().readiness_error = Some(message.into());
        self.inner.ready.send_replace(true);
        self
    }

    /// Fails the next `count` commits.
    pub fn fail_next_commits(&self, count: usize) {
        self.state().failing_commits = count;
    }

    /// Signals that stream positions are established.
    pub fn mark_ready(&self) {
        self.inner.ready.send_replace(true);
    }

    /// Queues a record for delivery on its partition.
    pub fn push(&self, record: ChangeRecord) {
        let partition = record.partition;
        let mut state = self.state();

        if !state.senders.contains_key(&partition) {
            let (tx, rx) = mpsc::unbounded_channel();
            state.senders.insert(partition, tx);
            match state.listener.clone() {
                Some(listener) => {
                    let task = self.spawn_delivery(partition, rx, listener);
                    state.tasks.push(task);
                }
                None => {
                    state.receivers.insert(partition, rx);
                }
            }
        }

        if let Some(tx) = state.senders.get(&partition) {
            if tx.send(record).is_err() {
                warn!(partition, "Record dropped: partition delivery stopped");
            }
        }
    }

    /// Queues several records.
    pub fn push_all(&self, records: impl IntoIterator<Item = ChangeRecord>) {
        for record in records {
            self.push(record);
        }
    }

    /// Returns every successful commit, in call order.
    #[must_use]
    pub fn commits(&self) -> Vec<(PartitionId, SequenceNumber)> {
        self.state().commits.clone()
    }

    /// Returns the highest committed sequence of `partition`.
    #[must_use]
    pub fn committed(&self, partition: PartitionId) -> Option<SequenceNumber> {
        self.state()
            .commits
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, s)| *s)
            .max()
    }

    /// Returns every ack, in call order.
    #[must_use]
    pub fn acks(&self) -> Vec<(PartitionId, SequenceNumber)> {
        self.state().acks.clone()
    }

    /// Returns the checkpoint mode the client was switched to.
    #[must_use]
    pub fn checkpoint_mode(&self) -> CheckpointMode {
        self.state().checkpoint_mode
    }

    fn state(&self) -> MutexGuard<'_, MemoryStreamState> {
        // A poisoned lock only means a test panicked while holding it.
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn spawn_delivery(
        &self,
        partition: PartitionId,
        mut rx: mpsc::UnboundedReceiver<ChangeRecord>,
        listener: Arc<dyn EventListener>,
    ) -> JoinHandle<()> {
        let mut closed = self.inner.closed.subscribe();
        tokio::spawn(async move {
            if *closed.borrow_and_update() {
                return;
            }
            debug!(partition, "Partition delivery started");
            loop {
                tokio::select! {
                    biased;
                    _ = closed.changed() => break,
                    record = rx.recv() => match record {
                        Some(record) => listener.on_change(record).await,
                        None => break,
                    },
                }
            }
            debug!(partition, "Partition delivery stopped");
        })
    }
}

#[async_trait]
impl ChangeStreamClient for MemoryChangeStream {
    fn enable_manual_checkpoint(&self) -> Result<(), StreamError> {
        self.state().checkpoint_mode = CheckpointMode::Manual;
        Ok(())
    }

    async fn start(&self, listener: Arc<dyn EventListener>) -> Result<(), StreamError> {
        if *self.inner.closed.borrow() {
            return Err(StreamError::Closed);
        }

        let mut state = self.state();
        let receivers: Vec<_> = state.receivers.drain().collect();
        state.listener = Some(Arc::clone(&listener));
        for (partition, rx) in receivers {
            let task = self.spawn_delivery(partition, rx, Arc::clone(&listener));
            state.tasks.push(task);
        }

        info!(partitions = state.senders.len(), "Memory change stream started");
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<(), StreamError> {
        let mut ready = self.inner.ready.subscribe();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| StreamError::Closed)?;

        match self.state().readiness_error.clone() {
            Some(message) => Err(StreamError::Unavailable(message)),
            None => Ok(()),
        }
    }

    async fn commit(
        &self,
        partition: PartitionId,
        sequence: SequenceNumber,
    ) -> Result<(), StreamError> {
        let mut state = self.state();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StreamError::Commit {
                partition,
                sequence,
                message: "Simulated commit failure".to_string(),
            });
        }

        state.commits.push((partition, sequence));
        Ok(())
    }

    fn ack(&self, partition: PartitionId, sequence: SequenceNumber) {
        self.state().acks.push((partition, sequence));
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.inner.closed.send_replace(true);

        let tasks = {
            let mut state = self.state();
            state.listener = None;
            std::mem::take(&mut state.tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Partition delivery task panicked");
            }
        }

        info!("Memory change stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recording {
        records: Mutex<Vec<(PartitionId, SequenceNumber)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for Recording {
        async fn on_change(&self, record: ChangeRecord) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.records
                .lock()
                .unwrap()
                .push((record.partition, record.sequence));
        }
    }

    #[tokio::test]
    async fn test_delivers_in_partition_order() {
        let stream = MemoryChangeStream::ready();
        stream.push_all((1..=5).map(|seq| ChangeRecord::mutation(3, seq, "k", "v")));

        let listener = Arc::new(Recording::default());
        stream.start(listener.clone()).await.unwrap();
        stream.push(ChangeRecord::deletion(3, 6, "k"));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while listener.calls.load(Ordering::SeqCst) < 6 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let seen = listener.records.lock().unwrap().clone();
        assert_eq!(seen, (1..=6).map(|seq| (3, seq)).collect::<Vec<_>>());
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_readiness_gate() {
        let stream = MemoryChangeStream::new();
        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.wait_until_ready().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        stream.mark_ready();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_upstream() {
        let stream = MemoryChangeStream::new().with_unavailable_upstream("no route to host");
        let err = stream.wait_until_ready().await.unwrap_err();
        assert!(matches!(err, StreamError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_commit_failures_are_injected() {
        let stream = MemoryChangeStream::ready();
        stream.fail_next_commits(1);

        assert!(stream.commit(0, 10).await.is_err());
        stream.commit(0, 10).await.unwrap();
        stream.commit(0, 10).await.unwrap();

        assert_eq!(stream.commits(), vec![(0, 10), (0, 10)]);
        assert_eq!(stream.committed(0), Some(10));
        assert_eq!(stream.committed(1), None);
    }

    #[test]
    fn test_manual_checkpoint() {
        let stream = MemoryChangeStream::new();
        stream.enable_manual_checkpoint().unwrap();
        assert_eq!(stream.checkpoint_mode(), CheckpointMode::Manual);
    }
}
