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

//! Mapping from change events to write actions.
//!
//! The mapper runs synchronously on the delivery path of its partition: a mapper
//! that blocks stalls that partition's intake. Any
//! `Fn(&Event) -> Vec<WriteAction> + Send + Sync` is a [`Mapper`].
//!
//! ```rust
//! use cdcsink_core::action::WriteAction;
//! use cdcsink_core::event::Event;
//! use cdcsink_core::mapper::Mapper;
//!
//! // Only replicate the "users" collection, skip everything else.
//! let mapper = |event: &Event| -> Vec<WriteAction> {
//!     if event.collection_name() != "users" {
//!         return Vec::new();
//!     }
//!     match &event.value {
//!         Some(value) => vec![WriteAction::upsert(event.key.clone(), value.clone())],
//!         None => vec![WriteAction::delete(event.key.clone())],
//!     }
//! };
//!
//! fn assert_mapper(_: &impl Mapper) {}
//! assert_mapper(&mapper);
//! ```

use crate::action::WriteAction;
use crate::event::{Event, EventKind};

/// Turns one event into zero or more write actions.
///
/// Returning an empty vector means no write is needed; the event is still
/// acknowledged and checkpointed.
pub trait Mapper: Send + Sync {
    /// Maps an event to its ordered write actions.
    fn map(&self, event: &Event) -> Vec<WriteAction>;
}

impl<F> Mapper for F
where
    F: Fn(&Event) -> Vec<WriteAction> + Send + Sync,
{
    fn map(&self, event: &Event) -> Vec<WriteAction> {
        self(event)
    }
}

/// Replicates documents one-to-one.
///
/// Mutations become upserts of the same key and body; expirations and deletions
/// become deletes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMapper;

impl Mapper for DefaultMapper {
    fn map(&self, event: &Event) -> Vec<WriteAction> {
        match event.kind {
            EventKind::Mutation => match &event.value {
                Some(value) => vec![WriteAction::upsert(event.key.clone(), value.clone())],
                // A body-less mutation still creates the document
                None => vec![WriteAction::upsert(event.key.clone(), bytes::Bytes::new())],
            },
            EventKind::Expiration | EventKind::Deletion => {
                vec![WriteAction::delete(event.key.clone())]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use bytes::Bytes;
    use chrono::Utc;

    #[test]
    fn test_default_mapper_mutation() {
        let event = Event::mutation(
            Some(Bytes::from_static(b"k1")),
            Some(Bytes::from_static(b"{}")),
            "users",
            Utc::now(),
            0,
            10,
        )
        .unwrap();

        let actions = DefaultMapper.map(&event);
        assert_eq!(actions, vec![WriteAction::upsert("k1", "{}")]);
    }

    #[test]
    fn test_default_mapper_removals() {
        let now = Utc::now();
        let expired = Event::expiration(Some(Bytes::from_static(b"k")), "c", now, 0, 1).unwrap();
        let deleted = Event::deletion(Some(Bytes::from_static(b"k")), "c", now, 0, 2).unwrap();

        assert_eq!(DefaultMapper.map(&expired)[0].kind, ActionKind::Delete);
        assert_eq!(DefaultMapper.map(&deleted)[0].kind, ActionKind::Delete);
    }

    #[test]
    fn test_closure_mapper() {
        let fan_out = |event: &Event| {
            vec![
                WriteAction::delete(event.key.clone()),
                WriteAction::custom("audit", event.key.clone(), None),
            ]
        };
        let event = Event::deletion(Some(Bytes::from_static(b"k")), "c", Utc::now(), 0, 1).unwrap();
        assert_eq!(fan_out.map(&event).len(), 2);
    }
}
