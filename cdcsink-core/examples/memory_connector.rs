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

//! Connector over an in-memory change stream.
//!
//! A producer task feeds JSON user documents into a [`MemoryChangeStream`]. A
//! mapper drops internal documents and indexes the rest by email; a console
//! destination prints every batch.
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=info,cdcsink_core=debug cargo run --example memory_connector
//! ```
//!
//! Stops after the producer is done or on Ctrl+C.

use async_trait::async_trait;
use cdcsink_core::action::WriteAction;
use cdcsink_core::config::ConnectorConfig;
use cdcsink_core::connector::Connector;
use cdcsink_core::destination::{
    ActionResult, Destination, DestinationError, DestinationMetadata,
};
use cdcsink_core::event::{ChangeRecord, Event, EventKind};
use cdcsink_core::stream::MemoryChangeStream;
use serde_json::{json, Value};
use std::error::Error;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const PARTITIONS: u16 = 4;
const USERS: u64 = 40;

/// Prints every action it receives.
#[derive(Debug, Default)]
struct ConsoleDestination {
    written: usize,
}

#[async_trait]
impl Destination for ConsoleDestination {
    async fn write_batch(
        &mut self,
        actions: &[WriteAction],
    ) -> Result<Vec<ActionResult>, DestinationError> {
        for action in actions {
            self.written += 1;
            info!(
                count = self.written,
                kind = action.kind.label(),
                key = %String::from_utf8_lossy(&action.target_key),
                "📦 Action written"
            );
        }
        Ok(vec![Ok(()); actions.len()])
    }

    async fn flush(&mut self) -> Result<(), DestinationError> {
        info!(total = self.written, "✅ Destination flushed");
        Ok(())
    }

    fn metadata(&self) -> DestinationMetadata {
        DestinationMetadata::new("Console", "console")
    }
}

/// Writes the user document and an email index entry; skips internal users.
fn map_user(event: &Event) -> Vec<WriteAction> {
    match event.kind {
        EventKind::Mutation => {
            let Some(body) = &event.value else {
                return Vec::new();
            };
            let Ok(user) = serde_json::from_slice::<Value>(body) else {
                warn!(sequence = event.sequence, "Skipping document that is not JSON");
                return Vec::new();
            };
            if user["internal"].as_bool().unwrap_or(false) {
                return Vec::new();
            }

            let mut actions = vec![WriteAction::upsert(event.key.clone(), body.clone())];
            if let Some(email) = user["email"].as_str() {
                actions.push(WriteAction::upsert(
                    format!("email:{email}"),
                    event.key.clone(),
                ));
            }
            actions
        }
        EventKind::Expiration | EventKind::Deletion => {
            vec![WriteAction::delete(event.key.clone())]
        }
    }
}

fn user_record(partition: u16, sequence: u64, id: u64) -> ChangeRecord {
    let key = format!("user:{id}");
    if id % 10 == 9 {
        return ChangeRecord::deletion(partition, sequence, key).with_collection("users");
    }

    let body = json!({
        "id": id,
        "name": format!("user-{id}"),
        "email": format!("user{id}@example.com"),
        "internal": id % 7 == 0,
    });
    ChangeRecord::mutation(partition, sequence, key, body.to_string()).with_collection("users")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let config = ConnectorConfig::builder()
        .batch_max_size(8)
        .batch_linger(Duration::from_millis(200))
        .workers(2)
        .checkpoint_interval(Duration::from_secs(1))
        .build()?;

    let stream = MemoryChangeStream::new();
    let connector = Connector::builder()
        .config(config)
        .change_stream(stream.clone())
        .mapper(map_user)
        .destination(ConsoleDestination::default())
        .build()?;

    info!("🚀 Starting connector");
    connector.start()?;

    // Positions become available a little later, like a real upstream
    let upstream = stream.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        upstream.mark_ready();
    });
    connector.wait_until_running().await?;
    info!("✅ Connector running");

    let producer = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let mut sequences = [0u64; PARTITIONS as usize];
            for id in 0..USERS {
                let partition = u16::try_from(id % u64::from(PARTITIONS)).unwrap_or(0);
                sequences[usize::from(partition)] += 1;
                stream.push(user_record(partition, sequences[usize::from(partition)], id));
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
    };

    tokio::select! {
        _ = producer => {
            // Let the last batches linger out before stopping
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        _ = signal::ctrl_c() => info!("🛑 Received shutdown signal"),
    }

    connector.close().await?;

    let stats = connector.stats();
    info!(
        received = stats.events_received,
        flushed = stats.events_flushed,
        dropped = stats.events_dropped,
        actions = stats.actions_written,
        "👋 Connector stopped"
    );
    for partition in 0..PARTITIONS {
        info!(partition, checkpoint = ?stream.committed(partition), "Committed checkpoint");
    }

    Ok(())
}

/// Initialize structured logging
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cdcsink_core=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}
