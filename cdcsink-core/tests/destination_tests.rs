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

//! Tests for custom destinations driven by the connector.

use async_trait::async_trait;
use bytes::Bytes;
use cdcsink_core::action::WriteAction;
use cdcsink_core::config::ConnectorConfig;
use cdcsink_core::connector::Connector;
use cdcsink_core::destination::{
    ActionResult, Destination, DestinationError, DestinationMetadata,
};
use cdcsink_core::event::ChangeRecord;
use cdcsink_core::stream::MemoryChangeStream;
use std::time::Duration;
use tokio::time::sleep;

/// Destination that buffers writes and makes them durable on flush.
#[derive(Debug, Default)]
struct BufferedDestination {
    buffered: Vec<Bytes>,
    durable: Vec<Bytes>,
    failing_flushes: usize,
    /// Whole-call failures to return before accepting writes
    throttled_calls: usize,
    retry_after: Option<Duration>,
    /// Calls answered with too few results
    short_calls: usize,
    calls: usize,
}

impl BufferedDestination {
    fn new() -> Self {
        Self::default()
    }

    fn with_failing_flushes(mut self, count: usize) -> Self {
        self.failing_flushes = count;
        self
    }

    fn with_throttling(mut self, calls: usize, retry_after: Duration) -> Self {
        self.throttled_calls = calls;
        self.retry_after = Some(retry_after);
        self
    }

    fn with_short_results(mut self, calls: usize) -> Self {
        self.short_calls = calls;
        self
    }
}

#[async_trait]
impl Destination for BufferedDestination {
    async fn write_batch(
        &mut self,
        actions: &[WriteAction],
    ) -> Result<Vec<ActionResult>, DestinationError> {
        self.calls += 1;

        if self.throttled_calls > 0 {
            self.throttled_calls -= 1;
            return Err(DestinationError::capacity("Too many requests", self.retry_after));
        }

        if self.short_calls > 0 {
            self.short_calls -= 1;
            return Ok(vec![Ok(())]);
        }

        self.buffered
            .extend(actions.iter().map(|action| action.target_key.clone()));
        Ok(vec![Ok(()); actions.len()])
    }

    async fn flush(&mut self) -> Result<(), DestinationError> {
        if self.failing_flushes > 0 {
            self.failing_flushes -= 1;
            return Err(DestinationError::connection("flush timed out"));
        }
        self.durable.append(&mut self.buffered);
        Ok(())
    }

    fn metadata(&self) -> DestinationMetadata {
        DestinationMetadata::new("BufferedDestination", "buffered").with_max_batch_size(100)
    }
}

fn config() -> ConnectorConfig {
    ConnectorConfig::builder()
        .batch_linger(Duration::from_millis(50))
        .retry_initial_delay(Duration::from_millis(100))
        .retry_jitter(0.0)
        .build()
        .unwrap()
}

async fn running(
    destination: BufferedDestination,
) -> (Connector<BufferedDestination>, MemoryChangeStream) {
    let stream = MemoryChangeStream::ready();
    let connector = Connector::builder()
        .config(config())
        .change_stream(stream.clone())
        .destination(destination)
        .build()
        .unwrap();
    connector.start().unwrap();
    connector.wait_until_running().await.unwrap();
    (connector, stream)
}

#[tokio::test(start_paused = true)]
async fn test_commit_follows_destination_flush() {
    let (connector, stream) = running(BufferedDestination::new()).await;
    let listener = connector.listener();

    listener.on_change(ChangeRecord::mutation(0, 1, "a", "1")).await;
    listener.on_change(ChangeRecord::mutation(0, 2, "b", "2")).await;
    sleep(Duration::from_millis(60)).await;

    // Written but not yet durable
    assert_eq!(connector.watermark(0).await, Some(2));
    assert!(connector.destination().lock().await.durable.is_empty());

    let summary = connector.prepare_rebalance().await.unwrap();
    assert_eq!(summary.committed, 1);
    assert_eq!(stream.committed(0), Some(2));
    assert_eq!(connector.destination().lock().await.durable, vec!["a", "b"]);

    connector.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_defers_commit() {
    let (connector, stream) = running(BufferedDestination::new().with_failing_flushes(1)).await;

    connector
        .listener()
        .on_change(ChangeRecord::mutation(3, 9, "k", "v"))
        .await;

    let summary = connector.prepare_rebalance().await.unwrap();
    assert_eq!(summary.committed, 0);
    assert_eq!(stream.committed(3), None);

    let summary = connector.prepare_rebalance().await.unwrap();
    assert_eq!(summary.committed, 1);
    assert_eq!(stream.committed(3), Some(9));

    connector.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_honors_retry_after() {
    let destination = BufferedDestination::new().with_throttling(1, Duration::from_millis(500));
    let (connector, stream) = running(destination).await;

    connector
        .listener()
        .on_change(ChangeRecord::mutation(0, 1, "k", "v"))
        .await;

    // Backoff alone would retry at 150ms
    sleep(Duration::from_millis(300)).await;
    assert!(stream.acks().is_empty());

    sleep(Duration::from_millis(300)).await;
    assert_eq!(stream.acks(), vec![(0, 1)]);
    assert_eq!(connector.destination().lock().await.calls, 2);

    connector.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_result_count_mismatch_retries_whole_batch() {
    let (connector, stream) = running(BufferedDestination::new().with_short_results(1)).await;
    let listener = connector.listener();

    listener.on_change(ChangeRecord::mutation(0, 1, "a", "1")).await;
    listener.on_change(ChangeRecord::mutation(0, 2, "b", "2")).await;

    sleep(Duration::from_millis(60)).await;
    assert!(stream.acks().is_empty());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(stream.acks(), vec![(0, 1), (0, 2)]);

    connector.close().await.unwrap();
    let destination = connector.destination();
    let destination = destination.lock().await;
    assert_eq!(destination.durable, vec!["a", "b"]);
    assert_eq!(connector.stats().retries, 1);
}

#[test]
fn test_destination_error_retryable() {
    assert!(DestinationError::connection("reset").is_retryable());
    assert!(DestinationError::capacity("full", None).is_retryable());
    assert!(DestinationError::write("timeout", true).is_retryable());
    assert!(!DestinationError::write("forbidden", false).is_retryable());
    assert!(!DestinationError::rejected("bad document").is_retryable());
    assert!(!DestinationError::configuration("no table", Some("table".into())).is_retryable());
}

#[test]
fn test_destination_error_retry_after() {
    let err = DestinationError::capacity("slow down", Some(Duration::from_secs(2)));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    assert_eq!(DestinationError::connection("x").retry_after(), None);
}

#[test]
fn test_destination_error_categories() {
    assert_eq!(DestinationError::connection("x").category(), "connection_error");
    assert_eq!(DestinationError::unsupported("expire").category(), "rejected_error");
    assert!(DestinationError::unsupported("expire")
        .to_string()
        .contains("expire"));
}

#[test]
fn test_destination_metadata_builder() {
    let metadata = BufferedDestination::new()
        .metadata()
        .with_property("region", "eu-west-1");

    assert_eq!(metadata.destination_type, "buffered");
    assert_eq!(metadata.max_batch_size, Some(100));
    assert_eq!(metadata.properties.get("region").map(String::as_str), Some("eu-west-1"));
}
