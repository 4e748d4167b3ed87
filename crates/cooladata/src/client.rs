//! CoolaData tracker implementation.

use crate::attribution::{AttributionSource, NoAttribution};
use crate::builders::{FieldContext, TrackBuilder};
use crate::clock::fetch_calibration;
use crate::config::{Config, Setup, TrackerBuilder};
use crate::scheduler::{DeliveryScheduler, Session, SetupState, Shared};
use crate::storage::{KeyValueStore, MemoryStore, USER_ID_KEY};
use crate::transport::{HttpTransport, Transport};
use crate::types::{DeliveryResult, OperationEvent};
use crate::Error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

/// CoolaData event tracker.
///
/// Events are queued in memory and delivered in batches by background
/// tasks, so `track(..).send()` never waits for the network. Delivery is
/// at-least-once: a batch is retried with backoff until the server
/// acknowledges it or the retry budget runs out.
///
/// # Example
///
/// ```rust,no_run
/// use cooladata::{Setup, Tracker};
///
/// #[tokio::main]
/// async fn main() -> Result<(), cooladata::Error> {
///     let tracker = Tracker::builder().build()?;
///     tracker.setup(Setup::new("api_token").user_id("user_42")).await?;
///
///     tracker.track("level_complete")
///         .property("level", 3)
///         .send()
///         .await?;
///
///     // Ask for a delivery report
///     tracker.track("purchase")
///         .property("amount", 9.99)
///         .event_id("purchase_1")
///         .callback(|result| println!("{result}"))
///         .send()
///         .await?;
///
///     tracker.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct Tracker {
    shared: Arc<Shared>,
    transport: Option<Arc<dyn Transport>>,
    store: Arc<dyn KeyValueStore>,
    attribution: Arc<dyn AttributionSource>,
    scheduler: Mutex<Option<DeliveryScheduler>>,
    is_shutdown: AtomicBool,
}

impl Tracker {
    /// Create a new builder.
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    pub(crate) fn from_builder(builder: TrackerBuilder) -> Result<Self, Error> {
        let config = builder.build_config()?;

        Ok(Self {
            shared: Arc::new(Shared::new(config)),
            transport: builder.transport,
            store: builder
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            attribution: builder
                .attribution
                .unwrap_or_else(|| Arc::new(NoAttribution)),
            scheduler: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Get the tracker configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Configure the tracker with an API token and start delivery.
    ///
    /// Calling it again replaces the token, endpoint and user. It is the
    /// way back from [`SetupState::Revoked`]: batches held back by the
    /// refused token are sent with the new one.
    #[instrument(skip(self, setup))]
    pub async fn setup(&self, setup: impl Into<Setup>) -> Result<(), Error> {
        self.ensure_not_shutdown()?;
        let setup = setup.into();
        if setup.api_token.is_empty() {
            return Err(Error::Config("api token must not be empty".into()));
        }

        let mut scheduler = self.scheduler.lock().await;
        let previous = self.shared.setup_state();
        self.shared.set_state(SetupState::Configuring);

        let session = match self.build_session(setup) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.shared.set_state(previous);
                return Err(e);
            }
        };

        self.spawn_calibration(&session);
        info!(user_id = %session.user_id, "tracker configured");
        *self.shared.session.write().await = Some(session);

        if self.shared.enabled.load(Ordering::SeqCst) {
            self.attach_flush_signal().await;
        }
        self.shared.set_state(SetupState::Ready);

        if scheduler.is_none() {
            *scheduler = Some(DeliveryScheduler::start(self.shared.clone()));
        }

        // pick up anything queued while unconfigured
        self.shared.flush_signal.notify_one();
        Ok(())
    }

    fn build_session(&self, setup: Setup) -> Result<Session, Error> {
        let endpoint_url = setup
            .endpoint_url
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.shared.config.endpoint_url().to_string());

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(HttpTransport::new(&endpoint_url, &self.shared.config)?),
        };

        Ok(Session {
            api_token: setup.api_token,
            user_id: self.resolve_user_id(setup.user_id),
            transport,
            attribution: self.attribution.fetch(),
        })
    }

    /// Explicit id, else the stored one, else a fresh id that is stored.
    fn resolve_user_id(&self, explicit: Option<String>) -> String {
        if let Some(user_id) = explicit.filter(|id| !id.is_empty()) {
            return user_id;
        }

        match self.store.get(USER_ID_KEY) {
            Ok(Some(stored)) if !stored.is_empty() => return stored,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read stored user id"),
        }

        let generated = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.store.set(USER_ID_KEY, &generated) {
            warn!(error = %e, "could not store generated user id");
        }
        debug!(user_id = %generated, "generated user id");
        generated
    }

    fn spawn_calibration(&self, session: &Arc<Session>) {
        let shared = self.shared.clone();
        let session = session.clone();

        tokio::spawn(async move {
            let timeout = shared.config.publish_interval();
            if let Some(timestamp_millis) =
                fetch_calibration(session.transport.as_ref(), &session.api_token, timeout).await
            {
                shared.clock.calibrate(timestamp_millis);
                debug!(timestamp_millis, "clock calibrated");
                shared.emit(OperationEvent::Calibrated { timestamp_millis });
            }
        });
    }

    async fn attach_flush_signal(&self) {
        let mut queues = self.shared.queues.lock().await;
        queues
            .events
            .set_flush_signal(Some(self.shared.flush_signal.clone()));
    }

    // ============================================
    // TRACK
    // ============================================

    /// Track an event.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use cooladata::Tracker;
    /// # async fn example(tracker: &Tracker) -> Result<(), cooladata::Error> {
    /// tracker.track("item_bought")
    ///     .property("item", "sword")
    ///     .property("price", 120)
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn track(&self, event_name: impl Into<String>) -> SendableTrack<'_> {
        SendableTrack {
            builder: TrackBuilder::new(event_name),
            tracker: self,
        }
    }

    async fn enqueue(&self, builder: TrackBuilder) -> Result<(), Error> {
        self.ensure_not_shutdown()?;
        match self.shared.setup_state() {
            SetupState::NotCalled => return Err(Error::SetupRequired),
            SetupState::Revoked => {
                warn!("event ignored, the API token was refused");
                return Ok(());
            }
            SetupState::Configuring | SetupState::Ready => {}
        }

        let session = self.shared.session.read().await.clone();
        let no_attribution = HashMap::new();
        let record = builder.build(&FieldContext {
            default_user_id: session.as_deref().map(|s| s.user_id.as_str()),
            clock: &self.shared.clock,
            attribution: session
                .as_deref()
                .map_or(&no_attribution, |s| &s.attribution),
        });

        let pending = {
            let mut queues = self.shared.queues.lock().await;
            queues.events.add(record)?;
            queues.events.len()
        };
        debug!(pending, "event queued");
        self.shared.emit(OperationEvent::QueueSize(pending));

        Ok(())
    }

    // ============================================
    // LIFECYCLE
    // ============================================

    /// Move pending events into a batch and wake the sender now.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<(), Error> {
        self.ensure_not_shutdown()?;
        if self.shared.setup_state() == SetupState::NotCalled {
            return Err(Error::SetupRequired);
        }
        if self.shared.is_active() {
            self.shared.manage_batch_sending().await;
        }
        Ok(())
    }

    /// Pause delivery. Events are still queued.
    #[instrument(skip(self))]
    pub async fn disable(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        self.shared.queues.lock().await.events.set_flush_signal(None);
        info!("tracker disabled");
    }

    /// Resume delivery after [`disable`](Self::disable).
    #[instrument(skip(self))]
    pub async fn enable(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        self.attach_flush_signal().await;
        if self.shared.is_active() {
            self.shared.flush_signal.notify_one();
        }
        info!("tracker enabled");
    }

    /// Shutdown the tracker.
    ///
    /// Stops the background tasks. A request already on the wire is allowed
    /// to finish, but no further attempts start. Undelivered events are
    /// dropped.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Ok(()); // Already shutdown
        }

        info!("shutting down tracker");
        self.shared.queues.lock().await.events.set_flush_signal(None);

        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }

        let (events, batches) = {
            let queues = self.shared.queues.lock().await;
            (queues.events.len(), queues.batches.len())
        };
        if events > 0 || batches > 0 {
            warn!(events, batches, "undelivered events dropped at shutdown");
        }

        Ok(())
    }

    /// Change the event queue capacity, evicting the oldest events if needed.
    pub async fn set_queue_capacity(&self, capacity: usize) {
        self.shared.queues.lock().await.events.set_capacity(capacity);
    }

    /// Change the fill percentage that triggers a flush.
    pub async fn set_trigger_percent(&self, percent: u8) {
        self.shared
            .queues
            .lock()
            .await
            .events
            .set_trigger_percent(percent);
    }

    // ============================================
    // INTROSPECTION
    // ============================================

    /// Diagnostics stream. Receivers that lag lose events; delivery is
    /// unaffected.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.shared.subscribe()
    }

    /// Events not yet batched.
    pub async fn pending_event_count(&self) -> usize {
        self.shared.queues.lock().await.events.len()
    }

    /// Batches waiting for the server.
    pub async fn pending_batch_count(&self) -> usize {
        self.shared.queues.lock().await.batches.len()
    }

    /// Whether a batch is in flight.
    pub fn is_sending(&self) -> bool {
        self.shared.is_sending()
    }

    pub fn setup_state(&self) -> SetupState {
        self.shared.setup_state()
    }

    /// Default user of the current setup.
    pub async fn user_id(&self) -> Option<String> {
        self.shared
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.user_id.clone())
    }

    fn ensure_not_shutdown(&self) -> Result<(), Error> {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}

impl TrackerBuilder {
    /// Build the tracker.
    pub fn build(self) -> Result<Tracker, Error> {
        Tracker::from_builder(self)
    }
}

/// Sendable track event builder.
pub struct SendableTrack<'a> {
    builder: TrackBuilder,
    tracker: &'a Tracker,
}

impl<'a> SendableTrack<'a> {
    /// Track for this user instead of the setup default.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.builder = self.builder.user_id(user_id);
        self
    }

    /// Set the event id. Must be paired with [`callback`](Self::callback).
    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.builder = self.builder.event_id(event_id);
        self
    }

    /// Be told how delivery ended. Must be paired with an event id.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(DeliveryResult) + Send + Sync + 'static,
    {
        self.builder = self.builder.callback(callback);
        self
    }

    /// Add a property. Values must be JSON scalars.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.builder = self.builder.property(key, value);
        self
    }

    /// Add several properties.
    pub fn properties<I, K, V>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.builder = self.builder.properties(properties);
        self
    }

    /// Set custom timestamp.
    pub fn timestamp(mut self, ts: i64) -> Self {
        self.builder = self.builder.timestamp(ts);
        self
    }

    /// Queue the event.
    pub async fn send(self) -> Result<(), Error> {
        self.tracker.enqueue(self.builder).await
    }
}
