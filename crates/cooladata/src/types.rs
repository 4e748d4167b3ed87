//! Event types and serialization.

use crate::Error;
use chrono::{Datelike, Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Value of the `tracker_type` field.
pub const TRACKER_TYPE: &str = "rust";

/// Value of the `tracker_version` field.
pub const TRACKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Receives the outcome of delivering one event.
pub type DeliveryCallback = Arc<dyn Fn(DeliveryResult) + Send + Sync>;

/// Get current timestamp in milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Local UTC offset in whole hours, with an hour taken off while daylight
/// saving time is in effect.
pub(crate) fn local_timezone_offset_hours() -> i32 {
    let now = Local::now();
    let current = now.offset().local_minus_utc();
    let offset_on = |month| {
        Local
            .with_ymd_and_hms(now.year(), month, 1, 0, 0, 0)
            .earliest()
            .map(|t| t.offset().local_minus_utc())
    };
    // standard time is the smaller of the winter and summer offsets
    let standard = match (offset_on(1), offset_on(7)) {
        (Some(january), Some(july)) => january.min(july),
        _ => current,
    };
    offset_hours(current, standard)
}

fn offset_hours(current_secs: i32, standard_secs: i32) -> i32 {
    current_secs / 3600 - i32::from(current_secs > standard_secs)
}

/// One tracked event, normalized and ready to be queued.
///
/// A record is either plain or carries both an `event_id` and a callback.
/// Records with a callback are delivered ahead of plain ones.
#[derive(Clone)]
pub struct EventRecord {
    event_name: String,
    user_id: String,
    event_id: Option<String>,
    callback: Option<DeliveryCallback>,
    properties: Map<String, Value>,
    context: Map<String, Value>,
    timestamp_epoch_millis: i64,
    timezone_offset_hours: i32,
    cache_buster: u32,
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("event_name", &self.event_name)
            .field("user_id", &self.user_id)
            .field("event_id", &self.event_id)
            .field("has_callback", &self.callback.is_some())
            .field("properties", &self.properties)
            .field("timestamp_epoch_millis", &self.timestamp_epoch_millis)
            .finish_non_exhaustive()
    }
}

impl EventRecord {
    /// Create a plain record stamped with the local clock.
    pub fn new(event_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            user_id: user_id.into(),
            event_id: None,
            callback: None,
            properties: Map::new(),
            context: Map::new(),
            timestamp_epoch_millis: now_ms(),
            timezone_offset_hours: local_timezone_offset_hours(),
            cache_buster: rand::random::<u32>() >> 1,
        }
    }

    /// Set the event id used to match the server's per-event result.
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Set the callback invoked once the event is delivered or abandoned.
    pub fn with_callback(mut self, callback: DeliveryCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Add a user property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Override the event timestamp (milliseconds since epoch).
    pub fn with_timestamp(mut self, timestamp_epoch_millis: i64) -> Self {
        self.timestamp_epoch_millis = timestamp_epoch_millis;
        self
    }

    pub(crate) fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    pub(crate) fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn timestamp_epoch_millis(&self) -> i64 {
        self.timestamp_epoch_millis
    }

    pub fn timezone_offset_hours(&self) -> i32 {
        self.timezone_offset_hours
    }

    /// Whether the record waits for a delivery result.
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Check the tracking preconditions.
    pub fn validate(&self) -> Result<(), Error> {
        if self.event_name.is_empty() {
            return Err(Error::InvalidEvent(
                "event name cannot be empty, it is the primary identifier of the event".into(),
            ));
        }
        if self.user_id.is_empty() {
            return Err(Error::InvalidEvent(
                "user id must be provided at setup or when tracking the event".into(),
            ));
        }
        match (&self.event_id, &self.callback) {
            (Some(id), Some(_)) if id.is_empty() => {
                return Err(Error::InvalidEvent("event id cannot be empty".into()));
            }
            (Some(_), None) => {
                return Err(Error::InvalidEvent(
                    "event id was given without a callback".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::InvalidEvent(
                    "callback was given without an event id".into(),
                ));
            }
            _ => {}
        }
        if let Some((key, _)) = self
            .properties
            .iter()
            .find(|(_, value)| value.is_array() || value.is_object())
        {
            return Err(Error::InvalidEvent(format!(
                "property {key:?} must be a string, number, boolean or null"
            )));
        }
        Ok(())
    }

    /// Flatten the record into the JSON object sent to the server.
    ///
    /// First writer wins: reserved keys, then user properties, then the
    /// mandatory tracker fields, then optional and attribution context.
    pub fn to_event_object(&self) -> Map<String, Value> {
        let mut object = Map::new();
        object.insert("event_name".into(), Value::from(self.event_name.as_str()));
        object.insert("user_id".into(), Value::from(self.user_id.as_str()));
        if let Some(event_id) = &self.event_id {
            object.insert("event_id".into(), Value::from(event_id.as_str()));
        }

        for (key, value) in &self.properties {
            object.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let mandatory = [
            ("event_timestamp_epoch", Value::from(self.timestamp_epoch_millis)),
            ("event_timezone_offset", Value::from(self.timezone_offset_hours)),
            ("tracker_type", Value::from(TRACKER_TYPE)),
            ("tracker_version", Value::from(TRACKER_VERSION)),
            ("r", Value::from(self.cache_buster.to_string())),
        ];
        for (key, value) in mandatory {
            object.entry(key).or_insert(value);
        }

        for (key, value) in &self.context {
            object.entry(key.clone()).or_insert_with(|| value.clone());
        }

        object
    }

    /// Hand a delivery result to the callback, if any.
    pub(crate) fn resolve(&self, result: DeliveryResult) {
        if let Some(callback) = &self.callback {
            callback(result);
        }
    }
}

/// Outcome handed to a per-event callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// The event id given when the event was tracked.
    pub event_id: String,
    /// False if anything went wrong.
    pub status: bool,
    /// 200 when the server was reached, otherwise the failure code.
    pub delivery_status_code: u16,
    /// Failure description, if any.
    pub delivery_status_description: Option<String>,
    /// Per-event properties returned by the server.
    pub response_properties: HashMap<String, String>,
}

impl DeliveryResult {
    pub(crate) fn failed(
        event_id: impl Into<String>,
        code: u16,
        description: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            status: false,
            delivery_status_code: code,
            delivery_status_description: Some(description.into()),
            response_properties: HashMap::new(),
        }
    }
}

impl fmt::Display for DeliveryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event {}: {} ({}",
            self.event_id,
            if self.status { "success" } else { "failure" },
            self.delivery_status_code
        )?;
        if let Some(description) = &self.delivery_status_description {
            write!(f, " {description}")?;
        }
        write!(f, ")")
    }
}

/// Batch payload sent to the track API.
#[derive(Debug, Clone, Serialize)]
pub struct TrackPayload {
    pub events: Vec<Map<String, Value>>,
}

/// Response from the track API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackResponse {
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub results: Map<String, Value>,
}

impl TrackResponse {
    /// Server-supplied fields for one event, as strings.
    pub fn response_properties(&self, event_id: &str) -> Option<HashMap<String, String>> {
        let result = self.results.get(event_id)?;
        let properties = match result {
            Value::Object(fields) => fields
                .iter()
                .map(|(key, value)| (key.clone(), value_to_string(value)))
                .collect(),
            _ => HashMap::new(),
        };
        Some(properties)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Response from the calibration endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalibrationResponse {
    #[serde(default)]
    pub configuration: Option<CalibrationConfiguration>,
}

/// The `configuration` object of a calibration response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationConfiguration {
    #[serde(default)]
    pub calibration_timestamp_millis: Option<f64>,
}

impl CalibrationResponse {
    /// Server time in milliseconds, if the server sent one.
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.configuration
            .as_ref()?
            .calibration_timestamp_millis
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| ms.round() as i64)
    }
}

/// Best-effort diagnostics, see [`Tracker::subscribe`](crate::Tracker::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    /// Pending events after an add.
    QueueSize(usize),
    /// A batch send attempt started.
    SendingBatch { event_count: usize, attempt: u32 },
    /// The server acknowledged a batch.
    BatchDelivered { response: String },
    /// A batch ran out of retries and was dropped.
    BatchAbandoned {
        event_count: usize,
        code: u16,
        description: String,
        attempts: u32,
    },
    /// The API token was refused; setup is required again.
    Unauthorized,
    /// Server clock calibration was obtained.
    Calibrated { timestamp_millis: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_callback() -> DeliveryCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_offset_hours_drops_daylight_saving_hour() {
        const HOUR: i32 = 3600;
        // summer in Central Europe
        assert_eq!(offset_hours(2 * HOUR, HOUR), 1);
        // winter in Central Europe
        assert_eq!(offset_hours(HOUR, HOUR), 1);
        // summer in New York
        assert_eq!(offset_hours(-4 * HOUR, -5 * HOUR), -5);
        // no daylight saving, half hour truncated
        assert_eq!(offset_hours(5 * HOUR + 1800, 5 * HOUR + 1800), 5);
    }

    #[test]
    fn test_local_offset_is_whole_hours_in_range() {
        let hours = local_timezone_offset_hours();
        assert!((-14..=14).contains(&hours));
    }

    #[test]
    fn test_event_object_has_mandatory_fields() {
        let record = EventRecord::new("signup", "user_1")
            .with_property("plan", "pro")
            .with_timestamp(1706400000000);

        let object = record.to_event_object();

        assert_eq!(object["event_name"], "signup");
        assert_eq!(object["user_id"], "user_1");
        assert_eq!(object["plan"], "pro");
        assert_eq!(object["event_timestamp_epoch"], 1706400000000i64);
        assert_eq!(object["tracker_type"], TRACKER_TYPE);
        assert_eq!(object["tracker_version"], TRACKER_VERSION);
        assert!(object["r"].is_string());
        assert!(object.get("event_id").is_none());
    }

    #[test]
    fn test_user_properties_win_over_tracker_fields() {
        let record = EventRecord::new("signup", "user_1")
            .with_property("tracker_type", "custom")
            .with_property("event_name", "hijack")
            .with_context(Map::from_iter([
                ("utm_source".to_string(), json!("newsletter")),
                ("session_os".to_string(), json!("linux")),
            ]))
            .with_property("utm_source", "ads");

        let object = record.to_event_object();

        assert_eq!(object["tracker_type"], "custom");
        assert_eq!(object["utm_source"], "ads");
        assert_eq!(object["session_os"], "linux");
        // reserved keys stay with the tracker
        assert_eq!(object["event_name"], "signup");
    }

    #[test]
    fn test_validate_requires_name_and_user() {
        assert!(EventRecord::new("", "user_1").validate().is_err());
        assert!(EventRecord::new("signup", "").validate().is_err());
        assert!(EventRecord::new("signup", "user_1").validate().is_ok());
    }

    #[test]
    fn test_validate_requires_paired_event_id_and_callback() {
        let id_only = EventRecord::new("signup", "user_1").with_event_id("evt_1");
        assert!(matches!(id_only.validate(), Err(Error::InvalidEvent(_))));

        let callback_only = EventRecord::new("signup", "user_1").with_callback(noop_callback());
        assert!(matches!(callback_only.validate(), Err(Error::InvalidEvent(_))));

        let paired = EventRecord::new("signup", "user_1")
            .with_event_id("evt_1")
            .with_callback(noop_callback());
        assert!(paired.validate().is_ok());
        assert!(paired.has_callback());
    }

    #[test]
    fn test_validate_rejects_nested_properties() {
        let record = EventRecord::new("signup", "user_1").with_property("tags", json!(["a"]));
        assert!(record.validate().is_err());

        let record = EventRecord::new("signup", "user_1").with_property("missing", Value::Null);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_track_response_properties() {
        let response: TrackResponse = serde_json::from_value(json!({
            "status": true,
            "results": {
                "evt_1": { "tag": "abc", "count": 3 }
            }
        }))
        .unwrap();

        let properties = response.response_properties("evt_1").unwrap();
        assert_eq!(properties["tag"], "abc");
        assert_eq!(properties["count"], "3");
        assert!(response.response_properties("evt_2").is_none());
    }

    #[test]
    fn test_calibration_response() {
        let response: CalibrationResponse = serde_json::from_value(json!({
            "configuration": { "calibrationTimestampMillis": 1706400000000.0 }
        }))
        .unwrap();
        assert_eq!(response.timestamp_millis(), Some(1706400000000));

        let empty: CalibrationResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.timestamp_millis(), None);
    }

    #[test]
    fn test_delivery_result_display() {
        let result = DeliveryResult::failed("evt_1", 500, "Internal Server Error");
        assert_eq!(
            result.to_string(),
            "event evt_1: failure (500 Internal Server Error)"
        );
    }
}
