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

//! Flush engine: batching, writing, retrying.
//!
//! # Architecture
//!
//! ```text
//!   enqueue(p, actions) ──► [capacity semaphore] ──► worker p % N
//!                                                      │
//!                                 ┌────────────────────┤ one open batch per partition
//!                                 ▼                    │
//!                       size / bytes / linger ──► Destination::write_batch
//!                                                      │
//!                        all actions of event ok ◄─────┤ failed actions retried
//!                                 │                    │ inline with backoff
//!                                 ▼                    ▼
//!                    ack + mark_flushed        poisoned after retry.limit
//! ```
//!
//! Each worker exclusively owns the open batches and event trackers of its
//! partitions, so no locking is needed on the hot path and a partition never
//! has two batches in flight. A failed action is retried before anything else of
//! that partition is written.
//!
//! Backpressure counts un-flushed actions: `enqueue` reserves one permit per
//! action (capped at the high-water mark) and the permits are released once the
//! event is resolved.

use crate::action::WriteAction;
use crate::batch::{Batch, BatchEntry, EventTracker, FlushReason, PendingEvent};
use crate::checkpoint::CheckpointCoordinator;
use crate::config::{BatchConfig, ConnectorConfig, PoisonPolicy, RetryConfig};
use crate::destination::{ActionResult, Destination, DestinationError};
use crate::event::{PartitionId, SequenceNumber};
use crate::metrics::{self, Timer};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, instrument, warn, Dispatch};

/// Flush engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    /// The engine is shutting down and accepts no more work
    #[error("Flush engine is closed")]
    Closed,

    /// The workers have not been started
    #[error("Flush engine is not running")]
    NotRunning,

    /// No poisoned event is parked under this identity
    #[error("No poisoned event at partition {partition}, sequence {sequence}")]
    UnknownPoisonedEvent {
        /// Requested partition
        partition: PartitionId,
        /// Requested sequence
        sequence: SequenceNumber,
    },
}

/// Operator decision for a poisoned event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Give up on the failed writes: acknowledge and release the watermark
    Skip,
    /// Write the failed actions again with a fresh retry budget
    Retry,
}

/// Snapshot of a poisoned event.
#[derive(Debug, Clone, PartialEq)]
pub struct PoisonedEventInfo {
    /// Partition of the event
    pub partition: PartitionId,
    /// Sequence of the event
    pub sequence: SequenceNumber,
    /// Collection of the event
    pub collection: String,
    /// Failed flush attempts
    pub attempts: u32,
    /// Last error reported by the destination
    pub last_error: String,
    /// Actions that were not written
    pub failed_actions: Vec<WriteAction>,
}

struct PoisonedEvent {
    info: PoisonedEventInfo,
    event: PendingEvent,
}

/// Counters exposed through [`Stats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) events_received: AtomicU64,
    pub(crate) events_dropped: AtomicU64,
    pub(crate) events_acked: AtomicU64,
    pub(crate) events_flushed: AtomicU64,
    pub(crate) events_poisoned: AtomicU64,
    pub(crate) actions_written: AtomicU64,
    pub(crate) batches_flushed: AtomicU64,
    pub(crate) retries: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Stats {
        Stats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_acked: self.events_acked.load(Ordering::Relaxed),
            events_flushed: self.events_flushed.load(Ordering::Relaxed),
            events_poisoned: self.events_poisoned.load(Ordering::Relaxed),
            actions_written: self.actions_written.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Connector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Records delivered by the change stream
    pub events_received: u64,
    /// Events resolved without a write (no actions, malformed, unknown kind)
    pub events_dropped: u64,
    /// Acknowledgements sent
    pub events_acked: u64,
    /// Events whose writes were all confirmed
    pub events_flushed: u64,
    /// Events poisoned
    pub events_poisoned: u64,
    /// Actions confirmed by the destination
    pub actions_written: u64,
    /// Batches handed to the destination
    pub batches_flushed: u64,
    /// Retry rounds
    pub retries: u64,
}

/// Spawns `future` under `dispatch`, or under the caller's current subscriber.
pub(crate) fn spawn_task<F>(future: F, dispatch: Option<&Dispatch>) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match dispatch {
        Some(dispatch) => tokio::spawn(future.with_subscriber(dispatch.clone())),
        None => tokio::spawn(future.with_current_subscriber()),
    }
}

/// Runs `future` with `dispatch` as the default subscriber, if one is given.
pub(crate) async fn with_dispatch<F: Future>(dispatch: Option<&Dispatch>, future: F) -> F::Output {
    match dispatch {
        Some(dispatch) => future.with_subscriber(dispatch.clone()).await,
        None => future.await,
    }
}

enum Command {
    Enqueue {
        event: PendingEvent,
        actions: Vec<WriteAction>,
    },
    Drain {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct Shared<D> {
    batch: BatchConfig,
    retry: RetryConfig,
    poison_policy: PoisonPolicy,
    high_water_mark: usize,
    destination: Arc<Mutex<D>>,
    destination_type: String,
    coordinator: Arc<CheckpointCoordinator>,
    capacity: Arc<Semaphore>,
    poisoned: Mutex<BTreeMap<(PartitionId, SequenceNumber), PoisonedEvent>>,
    stats: Arc<StatsCounters>,
}

/// Batches actions per partition and writes them to the destination.
pub struct Processor<D: Destination> {
    shared: Arc<Shared<D>>,
    senders: Vec<mpsc::Sender<Command>>,
    receivers: std::sync::Mutex<Vec<mpsc::Receiver<Command>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closing: watch::Sender<bool>,
    dispatch: Option<Dispatch>,
}

impl<D: Destination + 'static> Processor<D> {
    /// Creates the engine. Workers are not running until
    /// [`start_processor`](Self::start_processor); until then `enqueue` only
    /// queues work.
    pub fn new(
        config: &ConnectorConfig,
        destination: D,
        coordinator: Arc<CheckpointCoordinator>,
        dispatch: Option<Dispatch>,
    ) -> Self {
        let workers = config.workers.max(1);
        let (senders, receivers) = (0..workers)
            .map(|_| mpsc::channel(config.backpressure.channel_capacity.max(1)))
            .unzip();
        let destination_type = destination.metadata().destination_type;
        let (closing, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                batch: config.batch.clone(),
                retry: config.retry.clone(),
                poison_policy: config.poison_policy,
                high_water_mark: config.backpressure.high_water_mark,
                destination: Arc::new(Mutex::new(destination)),
                destination_type,
                coordinator,
                capacity: Arc::new(Semaphore::new(config.backpressure.high_water_mark)),
                poisoned: Mutex::new(BTreeMap::new()),
                stats: Arc::new(StatsCounters::default()),
            }),
            senders,
            receivers: std::sync::Mutex::new(receivers),
            workers: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closing,
            dispatch,
        }
    }

    /// Shared handle to the destination.
    #[must_use]
    pub fn destination(&self) -> Arc<Mutex<D>> {
        Arc::clone(&self.shared.destination)
    }

    pub(crate) fn counters(&self) -> Arc<StatsCounters> {
        Arc::clone(&self.shared.stats)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.shared.stats.snapshot()
    }

    /// Actions accepted but not yet resolved.
    #[must_use]
    pub fn pending_actions(&self) -> usize {
        self.shared.pending_actions()
    }

    /// Returns true once the workers run.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawns the flush workers. Further calls are no-ops.
    pub fn start_processor(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("Flush workers already started");
            return;
        }

        let receivers = std::mem::take(
            &mut *self
                .receivers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let handles: Vec<_> = receivers
            .into_iter()
            .enumerate()
            .map(|(id, commands)| {
                let worker = Worker {
                    id,
                    shared: Arc::clone(&self.shared),
                    lanes: HashMap::new(),
                };
                spawn_task(worker.run(commands), self.dispatch.as_ref())
            })
            .collect();

        info!(workers = handles.len(), "Flush workers started");
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    /// Accepts the actions of one event.
    ///
    /// Blocks while the high-water mark is reached. Actions of one partition are
    /// written in the order they are enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Closed`] once shutdown has begun; the event is
    /// then left unacknowledged for redelivery.
    pub async fn enqueue(
        &self,
        mut event: PendingEvent,
        actions: Vec<WriteAction>,
    ) -> Result<(), ProcessorError> {
        if actions.is_empty() {
            self.shared.release(event).await;
            return Ok(());
        }

        let mut closing = self.closing.subscribe();
        if *closing.borrow_and_update() {
            event.ack.abandon();
            return Err(ProcessorError::Closed);
        }

        let wanted = actions.len().min(self.shared.high_water_mark);
        let wanted = u32::try_from(wanted).unwrap_or(u32::MAX);
        if self.shared.capacity.available_permits() < wanted as usize {
            debug!(
                partition = event.partition,
                sequence = event.sequence,
                actions = actions.len(),
                "High-water mark reached, waiting for capacity"
            );
        }

        let acquire = Arc::clone(&self.shared.capacity).acquire_many_owned(wanted);
        let permit = tokio::select! {
            permit = acquire => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    event.ack.abandon();
                    return Err(ProcessorError::Closed);
                }
            },
            () = closed_signal(&mut closing) => {
                event.ack.abandon();
                return Err(ProcessorError::Closed);
            }
        };

        event.permit = Some(permit);
        metrics::set_pending_actions(self.shared.pending_actions());

        let worker = usize::from(event.partition) % self.senders.len();
        if let Err(mpsc::error::SendError(command)) = self.senders[worker]
            .send(Command::Enqueue { event, actions })
            .await
        {
            if let Command::Enqueue { event, .. } = command {
                event.ack.abandon();
            }
            return Err(ProcessorError::Closed);
        }

        Ok(())
    }

    /// Flushes every open batch and waits for the writes to settle.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::NotRunning`] before the workers start and
    /// [`ProcessorError::Closed`] after they stopped.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<(), ProcessorError> {
        if !self.is_started() {
            return Err(ProcessorError::NotRunning);
        }

        let mut pending = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let (done, wait) = oneshot::channel();
            sender
                .send(Command::Drain { done })
                .await
                .map_err(|_| ProcessorError::Closed)?;
            pending.push(wait);
        }

        for done in join_all(pending).await {
            done.map_err(|_| ProcessorError::Closed)?;
        }

        debug!("All open batches drained");
        Ok(())
    }

    /// Stops accepting work; `enqueue` calls waiting for capacity return.
    pub fn begin_close(&self) {
        self.closing.send_replace(true);
    }

    /// Flushes everything accepted so far and stops the workers.
    ///
    /// Starts the workers first if they never ran, so queued work is still
    /// written. Idempotent.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        self.begin_close();
        if !self.is_started() {
            info!("Starting flush workers to drain queued work");
            self.start_processor();
        }

        let mut pending = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let (done, wait) = oneshot::channel();
            if sender.send(Command::Shutdown { done }).await.is_ok() {
                pending.push(wait);
            }
        }
        join_all(pending).await;

        let handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Flush worker panicked");
            }
        }

        let parked = std::mem::take(&mut *self.shared.poisoned.lock().await);
        if !parked.is_empty() {
            warn!(
                count = parked.len(),
                "Poisoned events left unresolved at shutdown"
            );
            for (_, poisoned) in parked {
                poisoned.event.ack.abandon();
            }
            metrics::set_poisoned_events(0);
        }

        metrics::set_pending_actions(self.shared.pending_actions());
    }

    /// Lists parked poisoned events, ordered by partition and sequence.
    pub async fn poisoned_events(&self) -> Vec<PoisonedEventInfo> {
        self.shared
            .poisoned
            .lock()
            .await
            .values()
            .map(|poisoned| poisoned.info.clone())
            .collect()
    }

    /// Resolves a parked poisoned event.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::UnknownPoisonedEvent`] if nothing is parked
    /// under this identity, or [`ProcessorError::Closed`] if a retry cannot be
    /// enqueued any more.
    #[instrument(skip(self))]
    pub async fn resolve_poisoned(
        &self,
        partition: PartitionId,
        sequence: SequenceNumber,
        resolution: Resolution,
    ) -> Result<(), ProcessorError> {
        let parked = {
            let mut poisoned = self.shared.poisoned.lock().await;
            let parked = poisoned.remove(&(partition, sequence));
            metrics::set_poisoned_events(poisoned.len());
            parked
        };
        let PoisonedEvent { info, event } =
            parked.ok_or(ProcessorError::UnknownPoisonedEvent { partition, sequence })?;

        match resolution {
            Resolution::Skip => {
                warn!(
                    partition,
                    sequence,
                    failed_actions = info.failed_actions.len(),
                    "Skipping poisoned event"
                );
                self.shared.release(event).await;
                Ok(())
            }
            Resolution::Retry => {
                info!(
                    partition,
                    sequence,
                    actions = info.failed_actions.len(),
                    "Retrying poisoned event"
                );
                self.shared
                    .coordinator
                    .mark_outstanding(partition, sequence)
                    .await;
                self.enqueue(event, info.failed_actions).await
            }
        }
    }
}

async fn closed_signal(closing: &mut watch::Receiver<bool>) {
    while !*closing.borrow_and_update() {
        if closing.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<D: Destination + 'static> Shared<D> {
    fn pending_actions(&self) -> usize {
        self.high_water_mark
            .saturating_sub(self.capacity.available_permits())
    }

    /// Acknowledges an event and resolves its sequence without further writes.
    async fn release(&self, event: PendingEvent) {
        let PendingEvent {
            partition,
            sequence,
            ack,
            permit,
            ..
        } = event;
        ack.ack();
        StatsCounters::bump(&self.stats.events_acked);
        self.coordinator.mark_flushed(partition, sequence).await;
        drop(permit);
    }

    /// Settles an event whose writes are all confirmed.
    #[allow(clippy::cast_precision_loss)]
    async fn complete(&self, tracker: EventTracker) {
        let PendingEvent {
            partition,
            sequence,
            collection,
            event_time,
            ack,
            permit,
            ..
        } = tracker.event;

        ack.ack();
        StatsCounters::bump(&self.stats.events_acked);
        self.coordinator.mark_flushed(partition, sequence).await;
        drop(permit);

        StatsCounters::bump(&self.stats.events_flushed);
        metrics::increment_events_flushed(&collection);
        let lag_ms = (Utc::now() - event_time).num_milliseconds().max(0);
        metrics::record_end_to_end_lag(lag_ms as f64 / 1000.0, &collection);
    }

    /// Parks or skips an event whose writes cannot succeed.
    async fn poison(&self, tracker: EventTracker, mut failed_actions: Vec<WriteAction>) {
        let EventTracker {
            mut event,
            unsent,
            attempts,
            last_error,
            ..
        } = tracker;
        failed_actions.extend(unsent);
        let last_error = last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        let (partition, sequence) = (event.partition, event.sequence);

        error!(
            partition,
            sequence,
            collection = %event.collection,
            attempts,
            unwritten = failed_actions.len(),
            error = %last_error,
            policy = ?self.poison_policy,
            "Event poisoned"
        );
        StatsCounters::bump(&self.stats.events_poisoned);
        metrics::increment_events_poisoned(&event.collection);
        drop(event.permit.take());

        match self.poison_policy {
            PoisonPolicy::Skip => self.release(event).await,
            PoisonPolicy::Block => {
                self.coordinator.mark_poisoned(partition, sequence).await;
                let info = PoisonedEventInfo {
                    partition,
                    sequence,
                    collection: event.collection.clone(),
                    attempts,
                    last_error,
                    failed_actions,
                };
                let mut poisoned = self.poisoned.lock().await;
                poisoned.insert((partition, sequence), PoisonedEvent { info, event });
                metrics::set_poisoned_events(poisoned.len());
            }
        }
    }

    /// Writes one batch; always returns one result per action.
    async fn write(&self, batch: &Batch) -> Vec<ActionResult> {
        let actions = batch.actions();
        let outcome = {
            let _timer = Timer::new(
                self.destination_type.as_str(),
                metrics::record_destination_write_duration,
            );
            let mut destination = self.destination.lock().await;
            destination.write_batch(&actions).await
        };

        match outcome {
            Ok(results) if results.len() == actions.len() => results,
            Ok(results) => {
                error!(
                    expected = actions.len(),
                    returned = results.len(),
                    "Destination returned a result count that does not match the batch"
                );
                vec![Err(DestinationError::write("result count mismatch", true)); actions.len()]
            }
            Err(e) => {
                warn!(error = %e, actions = actions.len(), "Batch write failed");
                vec![Err(e); actions.len()]
            }
        }
    }

    /// Writes the open batch of `lane`, retrying failed actions until they
    /// succeed or their events are poisoned.
    #[instrument(skip(self, lane), fields(partition = lane.batch.partition(), reason = reason.as_str()))]
    async fn flush_lane(&self, lane: &mut Lane, reason: FlushReason) {
        if lane.batch.is_empty() {
            return;
        }

        let mut batch = lane.batch.take();
        let partition = batch.partition();
        let started = Instant::now();

        StatsCounters::bump(&self.stats.batches_flushed);
        metrics::increment_batches_flushed(reason.as_str());
        metrics::record_batch_size(batch.len());
        metrics::record_batch_bytes(batch.size_bytes());
        debug!(
            actions = batch.len(),
            bytes = batch.size_bytes(),
            "Flushing batch"
        );

        let mut round: u32 = 0;
        loop {
            let results = self.write(&batch).await;
            let touched = batch.sequences();

            let mut written: u64 = 0;
            let mut failed: Vec<(BatchEntry, DestinationError)> = Vec::new();
            for (entry, result) in batch.into_entries().into_iter().zip(results) {
                match result {
                    Ok(()) => {
                        written += 1;
                        if let Some(tracker) = lane.trackers.get_mut(&entry.sequence) {
                            tracker.confirm();
                        }
                    }
                    Err(e) => {
                        metrics::increment_action_failures(&self.destination_type, e.category());
                        if let Some(tracker) = lane.trackers.get_mut(&entry.sequence) {
                            tracker.last_error = Some(e.clone());
                        }
                        failed.push((entry, e));
                    }
                }
            }

            self.stats
                .actions_written
                .fetch_add(written, Ordering::Relaxed);
            metrics::increment_actions_written(written, &self.destination_type);

            for sequence in &touched {
                let done = lane
                    .trackers
                    .get(sequence)
                    .is_some_and(EventTracker::is_settled);
                if done {
                    if let Some(tracker) = lane.trackers.remove(sequence) {
                        self.complete(tracker).await;
                    }
                }
            }

            if failed.is_empty() {
                break;
            }
            round += 1;

            let failed_sequences: BTreeSet<SequenceNumber> =
                failed.iter().map(|(entry, _)| entry.sequence).collect();
            let mut poison: BTreeMap<SequenceNumber, Vec<WriteAction>> = BTreeMap::new();
            for sequence in failed_sequences {
                if let Some(tracker) = lane.trackers.get_mut(&sequence) {
                    tracker.attempts += 1;
                    let retryable = tracker
                        .last_error
                        .as_ref()
                        .is_some_and(DestinationError::is_retryable);
                    if !retryable || tracker.attempts > self.retry.limit {
                        poison.insert(sequence, Vec::new());
                    }
                }
            }

            let retry_after = failed.iter().filter_map(|(_, e)| e.retry_after()).max();
            let error_type = failed
                .first()
                .map_or("unknown_error", |(_, e)| e.category());

            let mut retry = Vec::new();
            for (entry, _) in failed {
                match poison.get_mut(&entry.sequence) {
                    Some(actions) => actions.push(entry.action),
                    None if lane.trackers.contains_key(&entry.sequence) => retry.push(entry),
                    None => debug!(
                        sequence = entry.sequence,
                        "Dropping failed action of a resolved event"
                    ),
                }
            }

            for (sequence, actions) in poison {
                if let Some(tracker) = lane.trackers.remove(&sequence) {
                    self.poison(tracker, actions).await;
                }
            }

            if retry.is_empty() {
                break;
            }

            let backoff = self.retry.backoff(round);
            let delay = retry_after.map_or(backoff, |after| after.max(backoff));
            StatsCounters::bump(&self.stats.retries);
            metrics::increment_retries(error_type);
            warn!(
                round,
                actions = retry.len(),
                delay_ms = delay.as_millis(),
                "Retrying failed actions"
            );

            sleep(delay).await;
            batch = Batch::from_entries(partition, retry);
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis(),
            "Batch settled"
        );
        metrics::set_pending_actions(self.pending_actions());
    }
}

/// Open batch and trackers of one partition.
struct Lane {
    batch: Batch,
    trackers: BTreeMap<SequenceNumber, EventTracker>,
}

impl Lane {
    fn new(partition: PartitionId) -> Self {
        Self {
            batch: Batch::new(partition),
            trackers: BTreeMap::new(),
        }
    }
}

struct Worker<D> {
    id: usize,
    shared: Arc<Shared<D>>,
    lanes: HashMap<PartitionId, Lane>,
}

impl<D: Destination + 'static> Worker<D> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!(worker = self.id, "Flush worker running");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Enqueue { event, actions }) => self.accept(event, actions).await,
                    Some(Command::Drain { done }) => {
                        self.flush_all(FlushReason::Drain).await;
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown { done }) => {
                        self.flush_all(FlushReason::Shutdown).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.flush_all(FlushReason::Shutdown).await;
                        break;
                    }
                },
                () = wait_until(deadline) => self.flush_expired().await,
            }
        }

        // Work that raced with shutdown is left for redelivery
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Enqueue { event, .. } = command {
                event.ack.abandon();
            }
        }

        debug!(worker = self.id, "Flush worker stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let linger = self.shared.batch.linger();
        self.lanes
            .values()
            .filter_map(|lane| lane.batch.deadline(linger))
            .min()
    }

    async fn accept(&mut self, event: PendingEvent, actions: Vec<WriteAction>) {
        let (partition, sequence) = (event.partition, event.sequence);
        let shared = Arc::clone(&self.shared);
        let lane = self
            .lanes
            .entry(partition)
            .or_insert_with(|| Lane::new(partition));

        lane.trackers
            .insert(sequence, EventTracker::new(event, actions.len()));

        let mut actions = actions.into_iter();
        while let Some(action) = actions.next() {
            lane.batch.push(sequence, action);
            let Some(reason) = lane.batch.full_reason(&shared.batch) else {
                continue;
            };

            // The rest travels with the tracker, so a poisoned event keeps it
            if let Some(tracker) = lane.trackers.get_mut(&sequence) {
                tracker.unsent = actions.collect();
            }
            shared.flush_lane(lane, reason).await;

            match lane.trackers.get_mut(&sequence) {
                Some(tracker) => actions = std::mem::take(&mut tracker.unsent).into_iter(),
                None => return,
            }
        }
    }

    async fn flush_expired(&mut self) {
        let now = Instant::now();
        let linger = self.shared.batch.linger();
        let shared = Arc::clone(&self.shared);

        for lane in self.lanes.values_mut() {
            if lane.batch.deadline(linger).is_some_and(|deadline| deadline <= now) {
                shared.flush_lane(lane, FlushReason::Linger).await;
            }
        }
    }

    async fn flush_all(&mut self, reason: FlushReason) {
        let shared = Arc::clone(&self.shared);
        for lane in self.lanes.values_mut() {
            shared.flush_lane(lane, reason).await;
        }
    }
}
