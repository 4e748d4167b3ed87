//! Event builder and field assembly.

use crate::clock::Clock;
use crate::types::{DeliveryCallback, DeliveryResult, EventRecord};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// What the tracker knows when an event is built.
pub(crate) struct FieldContext<'a> {
    pub(crate) default_user_id: Option<&'a str>,
    pub(crate) clock: &'a Clock,
    pub(crate) attribution: &'a HashMap<String, String>,
}

/// Host fields added to every event unless the caller set them.
fn optional_fields(clock: &Clock) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("session_os".into(), Value::from(std::env::consts::OS));
    data.insert("session_os_family".into(), Value::from(std::env::consts::FAMILY));
    data.insert("session_arch".into(), Value::from(std::env::consts::ARCH));
    data.insert("time_in_app".into(), Value::from(clock.time_in_app_ms()));
    data
}

/// Builder for track events.
pub struct TrackBuilder {
    event_name: String,
    user_id: Option<String>,
    event_id: Option<String>,
    callback: Option<DeliveryCallback>,
    properties: Map<String, Value>,
    timestamp: Option<i64>,
}

impl std::fmt::Debug for TrackBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackBuilder")
            .field("event_name", &self.event_name)
            .field("user_id", &self.user_id)
            .field("event_id", &self.event_id)
            .field("has_callback", &self.callback.is_some())
            .field("properties", &self.properties)
            .finish()
    }
}

impl TrackBuilder {
    pub(crate) fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            user_id: None,
            event_id: None,
            callback: None,
            properties: Map::new(),
            timestamp: None,
        }
    }

    /// Track for this user instead of the setup default.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the event id (requires a callback).
    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Set the delivery callback (requires an event id).
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(DeliveryResult) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Add a property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add several properties.
    pub fn properties<I, K, V>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (key, value) in properties {
            self.properties.insert(key.into(), value.into());
        }
        self
    }

    /// Set custom timestamp (milliseconds since epoch).
    pub fn timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Build the record. Validation happens when it is queued.
    pub(crate) fn build(self, ctx: &FieldContext<'_>) -> EventRecord {
        let user_id = self
            .user_id
            .filter(|id| !id.is_empty())
            .or_else(|| ctx.default_user_id.map(String::from))
            .unwrap_or_default();

        let mut context = optional_fields(ctx.clock);
        for (key, value) in ctx.attribution {
            context
                .entry(key.clone())
                .or_insert_with(|| Value::from(value.as_str()));
        }

        let mut record = EventRecord::new(self.event_name, user_id)
            .with_properties(self.properties)
            .with_context(context)
            .with_timestamp(self.timestamp.unwrap_or_else(|| ctx.clock.now_ms()));

        if let Some(event_id) = self.event_id {
            record = record.with_event_id(event_id);
        }
        if let Some(callback) = self.callback {
            record = record.with_callback(callback);
        }

        record
    }
}
