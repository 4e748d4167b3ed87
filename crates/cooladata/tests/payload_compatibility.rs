//! Tests to verify the wire format matches what the CoolaData API expects.
//!
//! Event objects are flat JSON objects with snake_case keys; the track
//! request body is `{"events": [...]}`.

use cooladata::types::{CalibrationResponse, TrackResponse, TRACKER_TYPE, TRACKER_VERSION};
use cooladata::{Batch, DeliveryCallback, EventRecord};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_event_object_is_flat() {
    let record = EventRecord::new("level_up", "user_1")
        .with_property("level", 4)
        .with_property("hero", "knight")
        .with_timestamp(1706400000000);

    let object = record.to_event_object();

    assert_eq!(object["event_name"], "level_up");
    assert_eq!(object["user_id"], "user_1");
    assert_eq!(object["level"], 4);
    assert_eq!(object["hero"], "knight");
    assert_eq!(object["event_timestamp_epoch"], 1706400000000_i64);
    assert!(object["event_timezone_offset"].is_i64());
    assert_eq!(object["tracker_type"], TRACKER_TYPE);
    assert_eq!(object["tracker_version"], TRACKER_VERSION);
    // `r` is a non-negative integer sent as a string
    assert!(object["r"].as_str().unwrap().parse::<u32>().is_ok());

    // no nesting anywhere
    assert!(object.values().all(|v| !v.is_object() && !v.is_array()));
    // no event_id without one being set
    assert!(!object.contains_key("event_id"));
}

#[test]
fn test_event_id_is_sent_when_set() {
    let callback: DeliveryCallback = Arc::new(|_| {});
    let record = EventRecord::new("purchase", "user_1")
        .with_event_id("evt_9")
        .with_callback(callback);

    assert_eq!(record.to_event_object()["event_id"], "evt_9");
}

#[test]
fn test_reserved_keys_cannot_be_overridden() {
    let record = EventRecord::new("purchase", "user_1")
        .with_property("event_name", "spoofed")
        .with_property("user_id", "someone_else");

    let object = record.to_event_object();
    assert_eq!(object["event_name"], "purchase");
    assert_eq!(object["user_id"], "user_1");
}

#[test]
fn test_user_property_overrides_tracker_field() {
    let record = EventRecord::new("purchase", "user_1").with_property("tracker_type", "custom");
    assert_eq!(record.to_event_object()["tracker_type"], "custom");
}

#[test]
fn test_batch_payload_json_structure() {
    let batch = Batch::new(vec![
        EventRecord::new("a", "user_1").with_property("x", true),
        EventRecord::new("b", "user_2"),
    ])
    .unwrap();

    let json = serde_json::to_value(batch.payload()).unwrap();

    let object = json.as_object().unwrap();
    assert_eq!(object.len(), 1);
    let events = json["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["event_name"], "a");
    assert_eq!(events[0]["x"], true);
    assert_eq!(events[1]["user_id"], "user_2");
}

#[test]
fn test_track_response_parsing() {
    let response: TrackResponse = serde_json::from_value(json!({
        "status": true,
        "results": {
            "evt_1": { "coins": 100, "tier": "gold", "vip": false },
            "evt_2": "accepted"
        }
    }))
    .unwrap();

    assert!(response.status);

    let properties = response.response_properties("evt_1").unwrap();
    assert_eq!(properties["coins"], "100");
    assert_eq!(properties["tier"], "gold");
    assert_eq!(properties["vip"], "false");

    // non-object results carry no properties
    assert!(response.response_properties("evt_2").unwrap().is_empty());
    assert!(response.response_properties("evt_3").is_none());
}

#[test]
fn test_track_response_without_status() {
    let response: TrackResponse = serde_json::from_str("{}").unwrap();
    assert!(!response.status);
    assert!(response.results.is_empty());
}

#[test]
fn test_calibration_response_json_structure() {
    let response: CalibrationResponse = serde_json::from_value(json!({
        "configuration": { "calibrationTimestampMillis": 1706400000123.0 }
    }))
    .unwrap();
    assert_eq!(response.timestamp_millis(), Some(1706400000123));

    let response: CalibrationResponse =
        serde_json::from_value(json!({ "configuration": {} })).unwrap();
    assert_eq!(response.timestamp_millis(), None);

    let response: CalibrationResponse = serde_json::from_value(json!({})).unwrap();
    assert_eq!(response.timestamp_millis(), None);
}
