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

//! Connector: wires a change stream, a mapper and a destination together.
//!
//! # Lifecycle
//!
//! ```text
//! Constructed ──start()──► WaitingForReady ──stream ready──► Running
//!      │                        │       │                       │
//!      │                        │       └──readiness failed──► Failed
//!      └────────────────────────┴───────────close()────────────┴──► Closing ──► Closed
//! ```
//!
//! `start()` returns immediately. Events delivered before the stream is ready
//! are queued; the flush workers and the checkpoint committer only start once
//! the stream reports readiness. `close()` flushes every open batch, commits the
//! final watermarks and closes the destination.
//!
//! # Example
//!
//! ```rust,no_run
//! use cdcsink_core::config::ConnectorConfig;
//! use cdcsink_core::connector::Connector;
//! use cdcsink_core::destination::MemoryDestination;
//! use cdcsink_core::mapper::DefaultMapper;
//! use cdcsink_core::stream::MemoryChangeStream;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Connector::builder()
//!     .config("cdcsink.yml")
//!     .change_stream(MemoryChangeStream::ready())
//!     .mapper(DefaultMapper)
//!     .destination(MemoryDestination::new())
//!     .build()?;
//!
//! connector.start()?;
//! connector.wait_until_running().await?;
//!
//! // ... on shutdown:
//! connector.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::ack::AckRelay;
use crate::action::WriteAction;
use crate::batch::PendingEvent;
use crate::checkpoint::{CheckpointCoordinator, CommitSummary, Registration};
use crate::config::{ConfigError, ConfigSource, ConnectorConfig};
use crate::destination::{Destination, DestinationError};
use crate::event::{ChangeRecord, Event, Normalized, PartitionId, SequenceNumber};
use crate::mapper::{DefaultMapper, Mapper};
use crate::metrics::{self, ConnectorStatus, DropReason};
use crate::processor::{
    spawn_task, with_dispatch, PoisonedEventInfo, Processor, ProcessorError, Resolution, Stats,
    StatsCounters,
};
use crate::stream::{ChangeStreamClient, EventListener, StreamError};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn, Dispatch};

/// Lifecycle state of a [`Connector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
    /// Built, not started
    Constructed,
    /// Started; waiting for the change stream to establish positions
    WaitingForReady,
    /// Flush workers and committer running
    Running,
    /// `close()` in progress
    Closing,
    /// Fully stopped
    Closed,
    /// The change stream could not become ready
    Failed,
}

impl ConnectorState {
    /// Returns the state as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Constructed => "constructed",
            Self::WaitingForReady => "waiting_for_ready",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector errors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Invalid or unreadable configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Change-stream failure
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Flush engine failure
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// Destination failure during shutdown
    #[error(transparent)]
    Destination(#[from] DestinationError),

    /// `start()` was called twice
    #[error("Connector already started")]
    AlreadyStarted,

    /// The operation is not allowed in the current state
    #[error("Operation not allowed while connector is {0}")]
    InvalidState(ConnectorState),
}

/// Builder for [`Connector`].
pub struct ConnectorBuilder<D> {
    config: Option<ConfigSource>,
    mapper: Option<Arc<dyn Mapper>>,
    stream: Option<Arc<dyn ChangeStreamClient>>,
    destination: Option<D>,
    dispatch: Option<Dispatch>,
}

impl<D> Default for ConnectorBuilder<D> {
    fn default() -> Self {
        Self {
            config: None,
            mapper: None,
            stream: None,
            destination: None,
            dispatch: None,
        }
    }
}

impl<D: Destination + 'static> ConnectorBuilder<D> {
    /// Sets the configuration: a [`ConnectorConfig`] or the path of a YAML file.
    ///
    /// Defaults to [`ConnectorConfig::default`].
    #[must_use]
    pub fn config(mut self, source: impl Into<ConfigSource>) -> Self {
        self.config = Some(source.into());
        self
    }

    /// Sets the mapper. Defaults to [`DefaultMapper`].
    #[must_use]
    pub fn mapper(mut self, mapper: impl Mapper + 'static) -> Self {
        self.mapper = Some(Arc::new(mapper));
        self
    }

    /// Sets the change-stream client.
    #[must_use]
    pub fn change_stream(mut self, stream: impl ChangeStreamClient) -> Self {
        self.stream = Some(Arc::new(stream));
        self
    }

    /// Sets the destination.
    #[must_use]
    pub fn destination(mut self, destination: D) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Routes every log line of this connector to `dispatch`.
    ///
    /// Without it, tasks log to the subscriber current at `start()`.
    #[must_use]
    pub fn logger(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.dispatch = Some(dispatch.into());
        self
    }

    /// Builds the connector.
    ///
    /// Loads and validates the configuration and switches the change stream to
    /// manual checkpointing.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Config`] for a bad configuration or a missing
    /// component, and [`ConnectorError::Stream`] if the stream cannot
    /// checkpoint manually.
    pub fn build(self) -> Result<Connector<D>, ConnectorError> {
        match self.dispatch.clone() {
            Some(dispatch) => tracing::dispatcher::with_default(&dispatch, || self.build_inner()),
            None => self.build_inner(),
        }
    }

    fn build_inner(self) -> Result<Connector<D>, ConnectorError> {
        let config = self
            .config
            .unwrap_or_else(|| ConnectorConfig::default().into())
            .load()?;
        let stream = self.stream.ok_or(ConfigError::Missing("change_stream"))?;
        let destination = self.destination.ok_or(ConfigError::Missing("destination"))?;
        let mapper = self.mapper.unwrap_or_else(|| Arc::new(DefaultMapper));

        stream.enable_manual_checkpoint()?;

        let coordinator = Arc::new(CheckpointCoordinator::new(config.checkpoint.commit_every));
        let processor = Arc::new(Processor::new(
            &config,
            destination,
            Arc::clone(&coordinator),
            self.dispatch.clone(),
        ));
        let listener = Arc::new(ConnectorListener {
            mapper,
            processor: Arc::clone(&processor),
            coordinator: Arc::clone(&coordinator),
            relay: AckRelay::new(Arc::clone(&stream)),
            default_collection: config.default_collection.clone(),
            counters: processor.counters(),
            dispatch: self.dispatch.clone(),
        });

        let (state, _) = watch::channel(ConnectorState::Constructed);
        let (lifecycle_stop, _) = watch::channel(false);

        info!(
            workers = config.workers,
            batch_max_size = config.batch.max_size,
            linger_ms = config.batch.linger_ms,
            poison_policy = ?config.poison_policy,
            "Connector built"
        );

        Ok(Connector {
            config: Arc::new(config),
            stream,
            processor,
            coordinator,
            listener,
            state: Arc::new(state),
            lifecycle_stop,
            tasks: std::sync::Mutex::new(Tasks::default()),
            dispatch: self.dispatch,
        })
    }
}

#[derive(Default)]
struct Tasks {
    stream: Option<JoinHandle<()>>,
    lifecycle: Option<JoinHandle<()>>,
}

/// A change-data-capture sink connector.
pub struct Connector<D: Destination + 'static> {
    config: Arc<ConnectorConfig>,
    stream: Arc<dyn ChangeStreamClient>,
    processor: Arc<Processor<D>>,
    coordinator: Arc<CheckpointCoordinator>,
    listener: Arc<ConnectorListener<D>>,
    state: Arc<watch::Sender<ConnectorState>>,
    lifecycle_stop: watch::Sender<bool>,
    tasks: std::sync::Mutex<Tasks>,
    dispatch: Option<Dispatch>,
}

impl<D: Destination + 'static> Connector<D> {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ConnectorBuilder<D> {
        ConnectorBuilder::default()
    }

    /// Starts delivery without blocking.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::AlreadyStarted`] unless the connector is
    /// freshly constructed.
    pub fn start(&self) -> Result<(), ConnectorError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ConnectorState::Constructed {
                *state = ConnectorState::WaitingForReady;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ConnectorError::AlreadyStarted);
        }

        let stream_task = {
            let stream = Arc::clone(&self.stream);
            let listener: Arc<dyn EventListener> = self.listener.clone();
            let state = Arc::clone(&self.state);
            spawn_task(
                async move {
                    if let Err(e) = stream.start(listener).await {
                        error!(error = %e, "Change stream stopped with error");
                        mark_failed(&state);
                    }
                },
                self.dispatch.as_ref(),
            )
        };

        let lifecycle_task = spawn_task(
            run_lifecycle(
                Lifecycle {
                    config: Arc::clone(&self.config),
                    stream: Arc::clone(&self.stream),
                    processor: Arc::clone(&self.processor),
                    coordinator: Arc::clone(&self.coordinator),
                    state: Arc::clone(&self.state),
                },
                self.lifecycle_stop.subscribe(),
            ),
            self.dispatch.as_ref(),
        );

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.stream = Some(stream_task);
        tasks.lifecycle = Some(lifecycle_task);

        self.log(|| info!("Connector started, waiting for change stream readiness"));
        Ok(())
    }

    /// Resolves once the connector is running.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::InvalidState`] if the connector failed, is
    /// closing, or was never started.
    pub async fn wait_until_running(&self) -> Result<(), ConnectorError> {
        if self.state() == ConnectorState::Constructed {
            return Err(ConnectorError::InvalidState(ConnectorState::Constructed));
        }

        let mut state = self.state.subscribe();
        let reached = state
            .wait_for(|state| {
                !matches!(
                    state,
                    ConnectorState::Constructed | ConnectorState::WaitingForReady
                )
            })
            .await
            .map(|state| *state);

        match reached {
            Ok(ConnectorState::Running) => Ok(()),
            Ok(other) => Err(ConnectorError::InvalidState(other)),
            Err(_) => Err(ConnectorError::InvalidState(ConnectorState::Closed)),
        }
    }

    /// Stops the connector.
    ///
    /// Stops delivery, flushes every open batch (retrying as configured),
    /// commits the final watermarks and closes the destination. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first error of the change-stream or destination shutdown;
    /// the remaining steps still run.
    pub async fn close(&self) -> Result<(), ConnectorError> {
        with_dispatch(self.dispatch.as_ref(), self.close_inner()).await
    }

    #[instrument(skip(self))]
    async fn close_inner(&self) -> Result<(), ConnectorError> {
        let mut previous = ConnectorState::Constructed;
        let began = self.state.send_if_modified(|state| {
            previous = *state;
            if matches!(state, ConnectorState::Closing | ConnectorState::Closed) {
                false
            } else {
                *state = ConnectorState::Closing;
                true
            }
        });

        if !began {
            if previous == ConnectorState::Closing {
                let mut state = self.state.subscribe();
                let _ = state
                    .wait_for(|state| *state == ConnectorState::Closed)
                    .await
                    .map(|_| ());
            }
            return Ok(());
        }

        info!(from = %previous, "Closing connector");
        let mut first_error: Option<ConnectorError> = None;

        self.lifecycle_stop.send_replace(true);
        self.processor.begin_close();

        if let Err(e) = self.stream.close().await {
            warn!(error = %e, "Change stream did not close cleanly");
            first_error.get_or_insert(e.into());
        }

        let (stream_task, lifecycle_task) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            (tasks.stream.take(), tasks.lifecycle.take())
        };
        for task in [stream_task, lifecycle_task].into_iter().flatten() {
            if let Err(e) = task.await {
                error!(error = %e, "Connector task panicked");
            }
        }

        self.processor.close().await;

        let summary =
            commit_checkpoints(&self.processor, &self.coordinator, self.stream.as_ref()).await;
        if summary.failed > 0 {
            warn!(
                failed = summary.failed,
                "Final checkpoint commit incomplete; upstream will redeliver"
            );
        }

        {
            let destination = self.processor.destination();
            let mut destination = destination.lock().await;
            if let Err(e) = destination.close().await {
                error!(error = %e, "Failed to close destination");
                first_error.get_or_insert(e.into());
            }
        }

        self.state.send_replace(ConnectorState::Closed);
        metrics::set_connector_status(ConnectorStatus::Stopped);

        let stats = self.processor.stats();
        info!(
            events_received = stats.events_received,
            events_flushed = stats.events_flushed,
            events_dropped = stats.events_dropped,
            events_poisoned = stats.events_poisoned,
            batches_flushed = stats.batches_flushed,
            retries = stats.retries,
            "Connector closed"
        );

        first_error.map_or(Ok(()), Err)
    }

    /// Flushes every open batch and commits the watermarks, so partitions can
    /// move to another instance without losing writes.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::InvalidState`] unless the connector is running.
    pub async fn prepare_rebalance(&self) -> Result<CommitSummary, ConnectorError> {
        with_dispatch(self.dispatch.as_ref(), async {
            self.ensure_running()?;
            info!("Preparing for rebalance");
            self.processor.drain().await?;
            let summary =
                commit_checkpoints(&self.processor, &self.coordinator, self.stream.as_ref()).await;
            info!(
                committed = summary.committed,
                failed = summary.failed,
                "Ready for rebalance"
            );
            Ok::<_, ConnectorError>(summary)
        })
        .await
    }

    /// Marks the end of a rebalance. The change stream resumes delivery from
    /// the committed checkpoints.
    pub fn finish_rebalance(&self) {
        self.log(|| info!(state = %self.state(), "Rebalance finished"));
    }

    /// Lists events poisoned under the `block` policy.
    pub async fn poisoned_events(&self) -> Vec<PoisonedEventInfo> {
        self.processor.poisoned_events().await
    }

    /// Resolves a poisoned event.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::UnknownPoisonedEvent`] (wrapped) if nothing is
    /// parked under this identity.
    pub async fn resolve_poisoned(
        &self,
        partition: PartitionId,
        sequence: SequenceNumber,
        resolution: Resolution,
    ) -> Result<(), ConnectorError> {
        with_dispatch(
            self.dispatch.as_ref(),
            self.processor
                .resolve_poisoned(partition, sequence, resolution),
        )
        .await
        .map_err(Into::into)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.processor.stats()
    }

    /// Checkpoint watermark of `partition`.
    pub async fn watermark(&self, partition: PartitionId) -> Option<SequenceNumber> {
        self.coordinator.watermark(partition).await
    }

    /// Last committed checkpoint of `partition`.
    pub async fn committed(&self, partition: PartitionId) -> Option<SequenceNumber> {
        self.coordinator.committed(partition).await
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Shared handle to the destination.
    #[must_use]
    pub fn destination(&self) -> Arc<Mutex<D>> {
        self.processor.destination()
    }

    /// The listener the change stream delivers to.
    #[must_use]
    pub fn listener(&self) -> Arc<dyn EventListener> {
        self.listener.clone()
    }

    fn ensure_running(&self) -> Result<(), ConnectorError> {
        match self.state() {
            ConnectorState::Running => Ok(()),
            other => Err(ConnectorError::InvalidState(other)),
        }
    }

    fn log(&self, f: impl FnOnce()) {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

fn mark_failed(state: &watch::Sender<ConnectorState>) {
    let failed = state.send_if_modified(|state| {
        if matches!(
            state,
            ConnectorState::WaitingForReady | ConnectorState::Running
        ) {
            *state = ConnectorState::Failed;
            true
        } else {
            false
        }
    });
    if failed {
        metrics::set_connector_status(ConnectorStatus::Error);
    }
}

/// Flushes the destination, then commits every watermark it covers.
async fn commit_checkpoints<D: Destination + 'static>(
    processor: &Processor<D>,
    coordinator: &CheckpointCoordinator,
    stream: &dyn ChangeStreamClient,
) -> CommitSummary {
    if coordinator.uncommitted().await.is_empty() {
        return CommitSummary::default();
    }

    let candidates = {
        let destination = processor.destination();
        let mut destination = destination.lock().await;
        if let Err(e) = destination.flush().await {
            warn!(error = %e, "Destination flush failed, deferring checkpoint commit");
            return CommitSummary::default();
        }
        coordinator.uncommitted().await
    };

    coordinator.commit_to(stream, candidates).await
}

struct Lifecycle<D: Destination + 'static> {
    config: Arc<ConnectorConfig>,
    stream: Arc<dyn ChangeStreamClient>,
    processor: Arc<Processor<D>>,
    coordinator: Arc<CheckpointCoordinator>,
    state: Arc<watch::Sender<ConnectorState>>,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Waits for readiness, starts the flush workers, then commits checkpoints
/// until stopped.
async fn run_lifecycle<D: Destination + 'static>(
    ctx: Lifecycle<D>,
    mut stop: watch::Receiver<bool>,
) {
    let ready = tokio::select! {
        result = ctx.stream.wait_until_ready() => result,
        () = stopped(&mut stop) => {
            debug!("Readiness wait cancelled");
            return;
        }
    };

    if let Err(e) = ready {
        error!(error = %e, retryable = e.is_retryable(), "Change stream failed to become ready");
        mark_failed(&ctx.state);
        return;
    }

    let promoted = ctx.state.send_if_modified(|state| {
        if *state == ConnectorState::WaitingForReady {
            *state = ConnectorState::Running;
            true
        } else {
            false
        }
    });
    if !promoted {
        return;
    }

    ctx.processor.start_processor();
    metrics::set_connector_status(ConnectorStatus::Running);
    info!("Change stream ready, connector running");

    let mut ticker = interval(ctx.config.checkpoint.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = ctx.coordinator.commit_requested().notified() => {}
            () = stopped(&mut stop) => break,
        }

        let summary =
            commit_checkpoints(&ctx.processor, &ctx.coordinator, ctx.stream.as_ref()).await;
        if summary.committed > 0 || summary.failed > 0 {
            debug!(
                committed = summary.committed,
                failed = summary.failed,
                "Checkpoint round finished"
            );
        }
    }

    debug!("Checkpoint committer stopped");
}

/// Receives records from the change stream and feeds the flush engine.
struct ConnectorListener<D: Destination + 'static> {
    mapper: Arc<dyn Mapper>,
    processor: Arc<Processor<D>>,
    coordinator: Arc<CheckpointCoordinator>,
    relay: AckRelay,
    default_collection: String,
    counters: Arc<StatsCounters>,
    dispatch: Option<Dispatch>,
}

impl<D: Destination + 'static> ConnectorListener<D> {
    async fn handle(&self, record: ChangeRecord) {
        let (partition, sequence) = (record.partition, record.sequence);
        StatsCounters::bump(&self.counters.events_received);

        match self.coordinator.register(partition, sequence).await {
            Registration::Accepted => {}
            Registration::Settled => {
                // Already written: acknowledge so the upstream slot is freed
                self.drop_event(partition, sequence, DropReason::StaleSequence);
                return;
            }
            Registration::Unsettled => {
                // The earlier delivery acknowledges once its writes settle
                self.relay.token(partition, sequence).abandon();
                StatsCounters::bump(&self.counters.events_dropped);
                metrics::increment_events_dropped(DropReason::DuplicateInFlight);
                debug!(partition, sequence, "Ignoring redelivery of an unsettled event");
                return;
            }
        }

        let event = match record.normalize(&self.default_collection) {
            Ok(Normalized::Event(event)) => event,
            Ok(Normalized::Unsupported { kind }) => {
                warn!(partition, sequence, kind = %kind, "Ignoring change of unsupported kind");
                self.resolve(partition, sequence, DropReason::UnknownKind)
                    .await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed change record");
                self.resolve(partition, sequence, DropReason::Malformed)
                    .await;
                return;
            }
        };

        metrics::increment_events_received(&event.collection, event.kind.as_str());
        let actions = self.mapper.map(&event);
        if actions.is_empty() {
            self.resolve(partition, sequence, DropReason::NoActions)
                .await;
            return;
        }

        self.enqueue(&event, actions).await;
    }

    async fn enqueue(&self, event: &Event, actions: Vec<WriteAction>) {
        let pending = PendingEvent::new(event, self.relay.token(event.partition, event.sequence));
        if let Err(e) = self.processor.enqueue(pending, actions).await {
            warn!(
                partition = event.partition,
                sequence = event.sequence,
                error = %e,
                "Event not accepted; upstream will redeliver"
            );
        }
    }

    /// Acknowledges and resolves an event that needs no write.
    async fn resolve(&self, partition: PartitionId, sequence: SequenceNumber, reason: DropReason) {
        self.drop_event(partition, sequence, reason);
        self.coordinator.mark_flushed(partition, sequence).await;
    }

    fn drop_event(&self, partition: PartitionId, sequence: SequenceNumber, reason: DropReason) {
        self.relay.token(partition, sequence).ack();
        StatsCounters::bump(&self.counters.events_acked);
        StatsCounters::bump(&self.counters.events_dropped);
        metrics::increment_events_dropped(reason);
        debug!(partition, sequence, reason = reason.as_str(), "Event acknowledged without write");
    }
}

#[async_trait]
impl<D: Destination + 'static> EventListener for ConnectorListener<D> {
    async fn on_change(&self, record: ChangeRecord) {
        with_dispatch(self.dispatch.as_ref(), self.handle(record)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MemoryDestination;
    use crate::stream::MemoryChangeStream;

    fn builder(stream: MemoryChangeStream) -> ConnectorBuilder<MemoryDestination> {
        Connector::builder()
            .change_stream(stream)
            .destination(MemoryDestination::new())
    }

    #[test]
    fn test_build_requires_destination() {
        let err = Connector::<MemoryDestination>::builder()
            .change_stream(MemoryChangeStream::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConnectorError::Config(ConfigError::Missing("destination"))
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = ConnectorConfig {
            workers: 0,
            ..ConnectorConfig::default()
        };
        let err = builder(MemoryChangeStream::new())
            .config(config)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ConnectorError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_build_enables_manual_checkpoint() {
        let stream = MemoryChangeStream::new();
        let connector = builder(stream.clone()).build().unwrap();
        assert_eq!(connector.state(), ConnectorState::Constructed);
        assert_eq!(
            stream.checkpoint_mode(),
            crate::stream::CheckpointMode::Manual
        );
    }

    #[tokio::test]
    async fn test_start_twice() {
        let connector = builder(MemoryChangeStream::ready()).build().unwrap();
        connector.start().unwrap();
        assert!(matches!(
            connector.start(),
            Err(ConnectorError::AlreadyStarted)
        ));
        connector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebalance_requires_running() {
        let connector = builder(MemoryChangeStream::new()).build().unwrap();
        let err = connector.prepare_rebalance().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::InvalidState(ConnectorState::Constructed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = builder(MemoryChangeStream::ready()).build().unwrap();
        connector.close().await.unwrap();
        connector.close().await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Closed);
        assert_eq!(connector.destination().lock().await.close_count(), 1);
    }

    #[tokio::test]
    async fn test_readiness_failure() {
        let stream = MemoryChangeStream::new().with_unavailable_upstream("connection refused");
        let connector = builder(stream).build().unwrap();
        connector.start().unwrap();

        let err = connector.wait_until_running().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::InvalidState(ConnectorState::Failed)
        ));
        connector.close().await.unwrap();
    }
}
