//! Integration tests for the event module.
//!
//! These tests verify record normalization and the default mapping.

use bytes::Bytes;
use cdcsink_core::action::{ActionKind, WriteAction};
use cdcsink_core::event::{ChangeKind, ChangeRecord, Event, EventError, EventKind, Normalized};
use cdcsink_core::mapper::{DefaultMapper, Mapper};
use chrono::{TimeZone, Utc};

#[test]
fn test_change_kind_serialization() {
    let json = serde_json::to_string(&ChangeKind::Expiration).unwrap();
    assert_eq!(json, "\"expiration\"");

    let kind: ChangeKind = serde_json::from_str("\"deletion\"").unwrap();
    assert_eq!(kind, ChangeKind::Deletion);

    let kind: ChangeKind = serde_json::from_str("\"touch\"").unwrap();
    assert_eq!(kind, ChangeKind::Unknown("touch".to_string()));
}

#[test]
fn test_record_from_client_json() {
    let json = r#"{
        "kind": "mutation",
        "key": [117, 49],
        "value": [123, 125],
        "collection": "users",
        "event_time": "2025-03-01T12:00:00Z",
        "partition": 7,
        "sequence": 42
    }"#;

    let record: ChangeRecord = serde_json::from_str(json).unwrap();
    assert_eq!(record.kind, ChangeKind::Mutation);
    assert_eq!(record.key, Some(Bytes::from_static(b"u1")));
    assert_eq!(record.partition, 7);
    assert_eq!(record.sequence, 42);

    let Normalized::Event(event) = record.normalize("_default").unwrap() else {
        panic!("expected an event");
    };
    assert_eq!(event.collection, "users");
    assert_eq!(event.event_time, Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
    assert_eq!(event.value, Some(Bytes::from_static(b"{}")));
}

#[test]
fn test_normalize_applies_default_collection() {
    let record = ChangeRecord::deletion(1, 5, "k");
    let Normalized::Event(event) = record.normalize("_default").unwrap() else {
        panic!("expected an event");
    };

    assert_eq!(event.kind, EventKind::Deletion);
    assert_eq!(event.collection, "_default");
    assert_eq!(event.value, None);
}

#[test]
fn test_normalize_drops_value_of_removals() {
    let record = ChangeRecord {
        value: Some(Bytes::from_static(b"stale body")),
        ..ChangeRecord::expiration(0, 1, "session:9")
    };
    let Normalized::Event(event) = record.normalize("sessions").unwrap() else {
        panic!("expected an event");
    };

    assert!(event.is_expiration());
    assert_eq!(event.value, None);
}

#[test]
fn test_normalize_reports_unknown_kind() {
    let record = ChangeRecord {
        kind: ChangeKind::Unknown("touch".to_string()),
        ..ChangeRecord::mutation(0, 3, "k", "v")
    };

    let normalized = record.normalize("_default").unwrap();
    assert_eq!(
        normalized,
        Normalized::Unsupported {
            kind: "touch".to_string()
        }
    );
}

#[test]
fn test_normalize_rejects_missing_key() {
    let record = ChangeRecord {
        key: None,
        ..ChangeRecord::mutation(2, 8, "ignored", "v")
    };

    let err = record.normalize("_default").unwrap_err();
    assert_eq!(
        err,
        EventError::MalformedEvent {
            partition: 2,
            sequence: 8,
            field: "key"
        }
    );
    assert!(err.to_string().contains("key"));
}

#[test]
fn test_default_mapper() {
    let now = Utc::now();
    let mutation = Event::mutation(
        Some(Bytes::from_static(b"user:1")),
        Some(Bytes::from_static(b"{\"name\":\"Ada\"}")),
        "users",
        now,
        0,
        1,
    )
    .unwrap();
    assert_eq!(
        DefaultMapper.map(&mutation),
        vec![WriteAction::upsert("user:1", "{\"name\":\"Ada\"}")]
    );

    let deletion = Event::deletion(Some(Bytes::from_static(b"user:1")), "users", now, 0, 2).unwrap();
    let actions = DefaultMapper.map(&deletion);
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].kind, ActionKind::Delete);

    let expiration =
        Event::expiration(Some(Bytes::from_static(b"user:1")), "users", now, 0, 3).unwrap();
    assert_eq!(DefaultMapper.map(&expiration)[0].kind, ActionKind::Delete);
}

#[test]
fn test_closure_mapper_fans_out() {
    let mapper = |event: &Event| {
        vec![
            WriteAction::upsert(event.key.clone(), event.value.clone().unwrap_or_default()),
            WriteAction::custom("audit", event.key.clone(), None),
        ]
    };

    let event = Event::mutation(
        Some(Bytes::from_static(b"k")),
        Some(Bytes::from_static(b"v")),
        "c",
        Utc::now(),
        0,
        1,
    )
    .unwrap();

    let actions = mapper.map(&event);
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[1].kind, ActionKind::Custom("audit".to_string()));
}

#[test]
fn test_estimated_size_bytes() {
    let event = Event::mutation(
        Some(Bytes::from_static(b"key")),
        Some(Bytes::from_static(b"0123456789")),
        "c",
        Utc::now(),
        0,
        1,
    )
    .unwrap();

    assert!(event.estimated_size_bytes() >= 13);
    assert_eq!(event.key_str(), Some("key"));
}
