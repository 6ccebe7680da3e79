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

//! Write actions produced by the mapper and executed by a destination.
//!
//! The flush engine treats a [`WriteAction`] as opaque apart from its size; only
//! destinations interpret the kind and payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operation a destination should perform for a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Insert or replace the document
    Upsert,

    /// Remove the document
    Delete,

    /// Set a time-to-live on the document
    Expire {
        /// Time until the document expires
        ttl: Duration,
    },

    /// Destination-specific operation identified by name
    Custom(String),
}

impl ActionKind {
    /// Returns a short static label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::Expire { .. } => "expire",
            Self::Custom(_) => "custom",
        }
    }
}

/// A single write derived from an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAction {
    /// Key of the target document; destinations may also route on it
    pub target_key: Bytes,

    /// Operation to perform
    pub kind: ActionKind,

    /// Operation payload (document body for upserts)
    pub payload: Option<Bytes>,
}

impl WriteAction {
    /// Creates an upsert of `payload` under `key`.
    pub fn upsert(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            target_key: key.into(),
            kind: ActionKind::Upsert,
            payload: Some(payload.into()),
        }
    }

    /// Creates a delete of `key`.
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            target_key: key.into(),
            kind: ActionKind::Delete,
            payload: None,
        }
    }

    /// Creates an expiry of `key` after `ttl`.
    pub fn expire(key: impl Into<Bytes>, ttl: Duration) -> Self {
        Self {
            target_key: key.into(),
            kind: ActionKind::Expire { ttl },
            payload: None,
        }
    }

    /// Creates a destination-specific operation.
    pub fn custom(name: impl Into<String>, key: impl Into<Bytes>, payload: Option<Bytes>) -> Self {
        Self {
            target_key: key.into(),
            kind: ActionKind::Custom(name.into()),
            payload,
        }
    }

    /// Returns the approximate size of this action in bytes.
    ///
    /// Used for the byte-size flush trigger.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let kind = match &self.kind {
            ActionKind::Custom(name) => name.len(),
            _ => 0,
        };
        self.target_key.len() + self.payload.as_ref().map_or(0, Bytes::len) + kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_bytes() {
        assert_eq!(WriteAction::upsert("key", "value").size_bytes(), 8);
        assert_eq!(WriteAction::delete("key").size_bytes(), 3);
        assert_eq!(
            WriteAction::custom("incr", "key", Some(Bytes::from_static(b"1"))).size_bytes(),
            8
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(WriteAction::upsert("k", "v").kind.label(), "upsert");
        assert_eq!(
            WriteAction::expire("k", Duration::from_secs(5)).kind.label(),
            "expire"
        );
        assert_eq!(WriteAction::custom("x", "k", None).kind.label(), "custom");
    }
}
