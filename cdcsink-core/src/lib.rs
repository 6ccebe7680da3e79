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

//! cdcsink core - change-data-capture sink connector.
//!
//! Consumes ordered change events from a partitioned change stream, turns each
//! event into write actions with a user-supplied mapper, batches the actions and
//! writes them to a destination, and commits per-partition checkpoints only
//! once every earlier write is confirmed. Delivery is at-least-once.
//!
//! # Key Components
//!
//! - **Events**: [`event`] normalizes raw change records into typed events
//! - **Mapping**: [`mapper`] turns events into [`action::WriteAction`]s
//! - **Destinations**: [`destination`] is the sink boundary
//! - **Change streams**: [`stream`] is the upstream boundary
//! - **Flush engine**: [`processor`] batches, writes and retries
//! - **Checkpoints**: [`checkpoint`] tracks per-partition watermarks
//! - **Connector**: [`connector`] ties it together with a lifecycle
//!
//! # Example
//!
//! ```rust
//! use cdcsink_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = MemoryChangeStream::ready();
//! let connector = Connector::builder()
//!     .change_stream(stream.clone())
//!     .destination(MemoryDestination::new())
//!     .build()?;
//!
//! connector.start()?;
//! connector.wait_until_running().await?;
//!
//! // Change-stream clients call the listener; here we deliver by hand.
//! let listener = connector.listener();
//! listener
//!     .on_change(ChangeRecord::mutation(0, 1, "user:1", r#"{"name":"Ada"}"#))
//!     .await;
//!
//! connector.close().await?;
//! assert_eq!(stream.committed(0), Some(1));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ack;
pub mod action;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod destination;
pub mod event;
pub mod mapper;
pub mod metrics;
pub mod processor;
pub mod stream;

/// Commonly used types.
pub mod prelude {
    pub use crate::action::{ActionKind, WriteAction};
    pub use crate::config::{ConnectorConfig, PoisonPolicy};
    pub use crate::connector::{Connector, ConnectorError, ConnectorState};
    pub use crate::destination::{Destination, DestinationError, MemoryDestination};
    pub use crate::event::{ChangeRecord, Event, EventKind, PartitionId, SequenceNumber};
    pub use crate::mapper::{DefaultMapper, Mapper};
    pub use crate::processor::Resolution;
    pub use crate::stream::{ChangeStreamClient, EventListener, MemoryChangeStream};
}
