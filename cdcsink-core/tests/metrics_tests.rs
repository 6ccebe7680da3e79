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

//! Tests for metrics instrumentation module.

use cdcsink_core::metrics::{
    self, ConnectorStatus, DropReason, Timer, DESTINATION_WRITE_DURATION_SECONDS,
    EVENTS_FLUSHED_TOTAL, EVENTS_RECEIVED_TOTAL, METRIC_PREFIX,
};

#[test]
fn test_metric_names() {
    assert!(EVENTS_RECEIVED_TOTAL.starts_with(METRIC_PREFIX));
    assert!(EVENTS_RECEIVED_TOTAL.ends_with("_total"));
    assert!(EVENTS_FLUSHED_TOTAL.ends_with("_total"));
    assert!(DESTINATION_WRITE_DURATION_SECONDS.ends_with("_seconds"));
}

#[test]
fn test_connector_status_values() {
    assert_eq!(ConnectorStatus::Stopped as u8, 0);
    assert_eq!(ConnectorStatus::Running as u8, 1);
    assert_eq!(ConnectorStatus::Error as u8, 2);
}

#[test]
fn test_drop_reason_labels_are_distinct() {
    let labels = [
        DropReason::NoActions.as_str(),
        DropReason::Malformed.as_str(),
        DropReason::UnknownKind.as_str(),
        DropReason::StaleSequence.as_str(),
        DropReason::DuplicateInFlight.as_str(),
    ];
    for (i, label) in labels.iter().enumerate() {
        assert!(!labels[i + 1..].contains(label));
    }
}

#[test]
fn test_helpers_without_recorder() {
    // Without an installed recorder every helper is a no-op
    metrics::init_metrics();
    metrics::increment_events_received("users", "mutation");
    metrics::increment_events_dropped(DropReason::NoActions);
    metrics::record_batch_size(10);
    metrics::set_connector_status(ConnectorStatus::Running);
}

#[test]
fn test_timer() {
    use std::thread;
    use std::time::Duration;

    let recorded = std::sync::Arc::new(std::sync::Mutex::new(None));
    let recorded_clone = recorded.clone();

    {
        let _timer = Timer::new("memory", move |duration, label: &str| {
            *recorded_clone.lock().unwrap() = Some((duration, label.to_string()));
        });
        thread::sleep(Duration::from_millis(10));
    }

    let (duration, label) = recorded.lock().unwrap().take().unwrap();
    assert!(duration.as_millis() >= 10);
    assert_eq!(label, "memory");
}
