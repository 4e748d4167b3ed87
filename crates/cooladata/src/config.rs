//! Client configuration.

use crate::attribution::AttributionSource;
use crate::storage::KeyValueStore;
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default service endpoint.
pub const DEFAULT_ENDPOINT_URL: &str = "https://api.cooladata.com";

/// Default maximum number of events held before batching.
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 30_000;

/// Default fill percentage that triggers a flush.
pub const DEFAULT_TRIGGER_PERCENT: u8 = 85;

/// Default cap on events per request.
pub const DEFAULT_MAX_EVENTS_PER_REQUEST: usize = 50;

/// Default connection-level retries inside one request.
pub const DEFAULT_MAX_SINGLE_REQUEST_RETRIES: u32 = 3;

/// Default attempts per batch before it is abandoned.
pub const DEFAULT_MAX_TOTAL_REQUEST_RETRIES: u32 = 24;

/// Default minimum gap between two batch sends.
pub const DEFAULT_PUBLISH_BACKOFF_INTERVAL: Duration = Duration::from_millis(5_000);

/// Default wait before retrying a failed batch.
pub const DEFAULT_OUTAGE_BACKOFF_INTERVAL: Duration = Duration::from_millis(15_000);

/// Default periodic flush interval, also the per-request timeout.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(5_000);

/// Default maximum number of batches waiting for the server.
pub const DEFAULT_MAX_BATCHES: usize = 1_000;

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) endpoint_url: String,
    pub(crate) queue_max_size: usize,
    pub(crate) trigger_percent: u8,
    pub(crate) max_events_per_request: usize,
    pub(crate) max_single_request_retries: u32,
    pub(crate) max_total_request_retries: u32,
    pub(crate) publish_backoff_interval: Duration,
    pub(crate) outage_backoff_interval: Duration,
    pub(crate) publish_interval: Duration,
    pub(crate) max_batches: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.into(),
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            trigger_percent: DEFAULT_TRIGGER_PERCENT,
            max_events_per_request: DEFAULT_MAX_EVENTS_PER_REQUEST,
            max_single_request_retries: DEFAULT_MAX_SINGLE_REQUEST_RETRIES,
            max_total_request_retries: DEFAULT_MAX_TOTAL_REQUEST_RETRIES,
            publish_backoff_interval: DEFAULT_PUBLISH_BACKOFF_INTERVAL,
            outage_backoff_interval: DEFAULT_OUTAGE_BACKOFF_INTERVAL,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            max_batches: DEFAULT_MAX_BATCHES,
        }
    }
}

impl Config {
    /// Get the default endpoint URL.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Get the event queue capacity.
    pub fn queue_max_size(&self) -> usize {
        self.queue_max_size
    }

    /// Get the flush trigger percentage.
    pub fn trigger_percent(&self) -> u8 {
        self.trigger_percent
    }

    /// Get the per-request event cap.
    pub fn max_events_per_request(&self) -> usize {
        self.max_events_per_request
    }

    /// Get the connection-level retries inside one request.
    pub fn max_single_request_retries(&self) -> u32 {
        self.max_single_request_retries
    }

    /// Get the number of attempts per batch.
    pub fn max_total_request_retries(&self) -> u32 {
        self.max_total_request_retries
    }

    /// Get the minimum gap between batch sends.
    pub fn publish_backoff_interval(&self) -> Duration {
        self.publish_backoff_interval
    }

    /// Get the wait before retrying a failed batch.
    pub fn outage_backoff_interval(&self) -> Duration {
        self.outage_backoff_interval
    }

    /// Get the periodic flush interval.
    ///
    /// A request without a response after this long counts as a timeout.
    pub fn publish_interval(&self) -> Duration {
        self.publish_interval
    }

    /// Get the maximum number of queued batches.
    pub fn max_batches(&self) -> usize {
        self.max_batches
    }

    /// Number of records moved into one batch for a given queue shape.
    pub(crate) fn batch_size(&self, capacity: usize, trigger_percent: u8) -> usize {
        let by_trigger = capacity.saturating_mul(usize::from(trigger_percent)) / 100;
        by_trigger.min(self.max_events_per_request).max(1)
    }
}

/// Builder for [`Tracker`](crate::Tracker).
pub struct TrackerBuilder {
    endpoint_url: Option<String>,
    queue_max_size: Option<usize>,
    trigger_percent: Option<u8>,
    max_events_per_request: Option<usize>,
    max_single_request_retries: Option<u32>,
    max_total_request_retries: Option<u32>,
    publish_backoff_interval: Option<Duration>,
    outage_backoff_interval: Option<Duration>,
    publish_interval: Option<Duration>,
    max_batches: Option<usize>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) store: Option<Arc<dyn KeyValueStore>>,
    pub(crate) attribution: Option<Arc<dyn AttributionSource>>,
}

impl fmt::Debug for TrackerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerBuilder")
            .field("endpoint_url", &self.endpoint_url)
            .field("queue_max_size", &self.queue_max_size)
            .field("trigger_percent", &self.trigger_percent)
            .field("publish_interval", &self.publish_interval)
            .field("custom_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for TrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerBuilder {
    /// Create a new builder with every knob at its default.
    pub fn new() -> Self {
        Self {
            endpoint_url: None,
            queue_max_size: None,
            trigger_percent: None,
            max_events_per_request: None,
            max_single_request_retries: None,
            max_total_request_retries: None,
            publish_backoff_interval: None,
            outage_backoff_interval: None,
            publish_interval: None,
            max_batches: None,
            transport: None,
            store: None,
            attribution: None,
        }
    }

    /// Set the endpoint used when `setup` does not name one.
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Set the event queue capacity.
    pub fn queue_max_size(mut self, size: usize) -> Self {
        self.queue_max_size = Some(size);
        self
    }

    /// Set the fill percentage that triggers a flush (clamped to 100).
    pub fn trigger_percent(mut self, percent: u8) -> Self {
        self.trigger_percent = Some(percent.min(100));
        self
    }

    /// Set the per-request event cap.
    pub fn max_events_per_request(mut self, count: usize) -> Self {
        self.max_events_per_request = Some(count);
        self
    }

    /// Set the connection-level retries inside one request.
    pub fn max_single_request_retries(mut self, count: u32) -> Self {
        self.max_single_request_retries = Some(count);
        self
    }

    /// Set the number of attempts per batch.
    pub fn max_total_request_retries(mut self, count: u32) -> Self {
        self.max_total_request_retries = Some(count);
        self
    }

    /// Set the minimum gap between batch sends.
    pub fn publish_backoff_interval(mut self, interval: Duration) -> Self {
        self.publish_backoff_interval = Some(interval);
        self
    }

    /// Set the wait before retrying a failed batch.
    pub fn outage_backoff_interval(mut self, interval: Duration) -> Self {
        self.outage_backoff_interval = Some(interval);
        self
    }

    /// Set the periodic flush interval.
    pub fn publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = Some(interval);
        self
    }

    /// Set the maximum number of queued batches.
    pub fn max_batches(mut self, count: usize) -> Self {
        self.max_batches = Some(count);
        self
    }

    /// Use a custom transport instead of HTTP.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom store for the persisted user id.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom campaign attribution source.
    pub fn attribution(mut self, source: Arc<dyn AttributionSource>) -> Self {
        self.attribution = Some(source);
        self
    }

    /// Build the configuration.
    pub(crate) fn build_config(&self) -> Result<Config, crate::Error> {
        let defaults = Config::default();
        let config = Config {
            endpoint_url: self
                .endpoint_url
                .clone()
                .unwrap_or(defaults.endpoint_url),
            queue_max_size: self.queue_max_size.unwrap_or(defaults.queue_max_size),
            trigger_percent: self.trigger_percent.unwrap_or(defaults.trigger_percent),
            max_events_per_request: self
                .max_events_per_request
                .unwrap_or(defaults.max_events_per_request),
            max_single_request_retries: self
                .max_single_request_retries
                .unwrap_or(defaults.max_single_request_retries),
            max_total_request_retries: self
                .max_total_request_retries
                .unwrap_or(defaults.max_total_request_retries),
            publish_backoff_interval: self
                .publish_backoff_interval
                .unwrap_or(defaults.publish_backoff_interval),
            outage_backoff_interval: self
                .outage_backoff_interval
                .unwrap_or(defaults.outage_backoff_interval),
            publish_interval: self.publish_interval.unwrap_or(defaults.publish_interval),
            max_batches: self.max_batches.unwrap_or(defaults.max_batches),
        };

        if config.endpoint_url.is_empty() {
            return Err(crate::Error::Config("endpoint_url cannot be empty".into()));
        }
        if config.publish_interval.is_zero() {
            return Err(crate::Error::Config(
                "publish_interval must be greater than zero".into(),
            ));
        }
        if config.max_total_request_retries == 0 {
            return Err(crate::Error::Config(
                "max_total_request_retries must be at least 1".into(),
            ));
        }
        if config.max_events_per_request == 0 {
            return Err(crate::Error::Config(
                "max_events_per_request must be at least 1".into(),
            ));
        }

        Ok(config)
    }
}

/// Arguments for [`Tracker::setup`](crate::Tracker::setup).
#[derive(Debug, Clone)]
pub struct Setup {
    pub(crate) api_token: String,
    pub(crate) endpoint_url: Option<String>,
    pub(crate) user_id: Option<String>,
}

impl Setup {
    /// Start a setup with the API token issued for the project.
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            endpoint_url: None,
            user_id: None,
        }
    }

    /// Talk to this endpoint instead of the configured default.
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Default user id for events tracked without one.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl From<&str> for Setup {
    fn from(api_token: &str) -> Self {
        Setup::new(api_token)
    }
}

impl From<String> for Setup {
    fn from(api_token: String) -> Self {
        Setup::new(api_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = TrackerBuilder::new().build_config().unwrap();

        assert_eq!(config.endpoint_url(), DEFAULT_ENDPOINT_URL);
        assert_eq!(config.queue_max_size(), DEFAULT_QUEUE_MAX_SIZE);
        assert_eq!(config.trigger_percent(), DEFAULT_TRIGGER_PERCENT);
        assert_eq!(config.max_events_per_request(), DEFAULT_MAX_EVENTS_PER_REQUEST);
        assert_eq!(config.max_total_request_retries(), DEFAULT_MAX_TOTAL_REQUEST_RETRIES);
        assert_eq!(config.publish_interval(), DEFAULT_PUBLISH_INTERVAL);
        assert_eq!(config.outage_backoff_interval(), DEFAULT_OUTAGE_BACKOFF_INTERVAL);
        assert_eq!(config.max_batches(), DEFAULT_MAX_BATCHES);
    }

    #[test]
    fn test_builder_custom_values() {
        let config = TrackerBuilder::new()
            .endpoint_url("https://custom.example.com")
            .queue_max_size(100)
            .trigger_percent(50)
            .max_total_request_retries(3)
            .publish_interval(Duration::from_millis(200))
            .max_batches(7)
            .build_config()
            .unwrap();

        assert_eq!(config.endpoint_url(), "https://custom.example.com");
        assert_eq!(config.queue_max_size(), 100);
        assert_eq!(config.trigger_percent(), 50);
        assert_eq!(config.max_total_request_retries(), 3);
        assert_eq!(config.publish_interval(), Duration::from_millis(200));
        assert_eq!(config.max_batches(), 7);
    }

    #[test]
    fn test_trigger_percent_is_clamped() {
        let config = TrackerBuilder::new()
            .trigger_percent(250)
            .build_config()
            .unwrap();
        assert_eq!(config.trigger_percent(), 100);
    }

    #[test]
    fn test_invalid_values_fail() {
        assert!(TrackerBuilder::new().endpoint_url("").build_config().is_err());
        assert!(TrackerBuilder::new()
            .publish_interval(Duration::ZERO)
            .build_config()
            .is_err());
        assert!(TrackerBuilder::new()
            .max_total_request_retries(0)
            .build_config()
            .is_err());
        assert!(TrackerBuilder::new()
            .max_events_per_request(0)
            .build_config()
            .is_err());
    }

    #[test]
    fn test_batch_size() {
        let config = TrackerBuilder::new().build_config().unwrap();
        // 30000 * 85% is far above the per-request cap
        assert_eq!(config.batch_size(30_000, 85), 50);
        assert_eq!(config.batch_size(10, 50), 5);
        assert_eq!(config.batch_size(10, 0), 1);
        assert_eq!(config.batch_size(0, 85), 1);
    }

    #[test]
    fn test_setup_accepts_string_and_str() {
        let setup: Setup = "token".into();
        assert_eq!(setup.api_token, "token");

        let setup = Setup::new(String::from("token"))
            .endpoint_url("https://example.com")
            .user_id("user_1");
        assert_eq!(setup.endpoint_url.as_deref(), Some("https://example.com"));
        assert_eq!(setup.user_id.as_deref(), Some("user_1"));
    }
}
