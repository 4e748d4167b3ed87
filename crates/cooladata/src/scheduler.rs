//! Batch formation and delivery.
//!
//! Two tasks run per tracker. The flush loop wakes on the periodic timer or
//! the event queue's flush signal and moves records into the batch queue.
//! The send loop owns the in-flight slot: it delivers the oldest batch,
//! retries it with backoff, and resolves callbacks. Only one batch is ever
//! in flight, so batches are sent and acknowledged in order.

use crate::batch::BatchQueue;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::TransportError;
use crate::queue::EventQueue;
use crate::transport::Transport;
use crate::types::{DeliveryResult, OperationEvent, TrackResponse};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DIAGNOSTICS_CAPACITY: usize = 256;

/// Configuration state of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    /// `setup` was never called; tracking is an error.
    NotCalled,
    /// `setup` is in progress.
    Configuring,
    /// Events are accepted and delivered.
    Ready,
    /// The server refused the API token; tracking is ignored until the
    /// next `setup`.
    Revoked,
}

/// Both queues, guarded by one lock.
#[derive(Debug)]
pub(crate) struct Queues {
    pub(crate) events: EventQueue,
    pub(crate) batches: BatchQueue,
}

/// Values fixed by one `setup` call.
pub(crate) struct Session {
    pub(crate) api_token: String,
    pub(crate) user_id: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) attribution: HashMap<String, String>,
}

/// How one delivery run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Nothing to send, or sending is paused.
    Idle,
    /// The server acknowledged the batch.
    Delivered,
    /// The batch ran out of attempts and was dropped.
    Abandoned,
    /// The API token was refused; the batch stays queued.
    Revoked,
    /// Stopped between retries by shutdown or disable.
    Halted,
}

/// State shared by the tracker facade and the background tasks.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) queues: Mutex<Queues>,
    pub(crate) session: RwLock<Option<Arc<Session>>>,
    pub(crate) state: watch::Sender<SetupState>,
    pub(crate) enabled: AtomicBool,
    pub(crate) clock: Clock,
    pub(crate) flush_signal: Arc<Notify>,
    send_wake: Notify,
    in_flight: AtomicBool,
    diagnostics: broadcast::Sender<OperationEvent>,
}

impl Shared {
    pub(crate) fn new(config: Config) -> Self {
        let flush_signal = Arc::new(Notify::new());
        let mut events = EventQueue::new(config.queue_max_size(), config.trigger_percent());
        events.set_flush_signal(Some(flush_signal.clone()));
        let batches = BatchQueue::new(config.max_batches());
        let (state, _) = watch::channel(SetupState::NotCalled);
        let (diagnostics, _) = broadcast::channel(DIAGNOSTICS_CAPACITY);

        Self {
            config,
            queues: Mutex::new(Queues { events, batches }),
            session: RwLock::new(None),
            state,
            enabled: AtomicBool::new(true),
            clock: Clock::new(),
            flush_signal,
            send_wake: Notify::new(),
            in_flight: AtomicBool::new(false),
            diagnostics,
        }
    }

    pub(crate) fn setup_state(&self) -> SetupState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SetupState) {
        self.state.send_replace(state);
    }

    /// Whether background delivery may run.
    pub(crate) fn is_active(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && self.setup_state() == SetupState::Ready
    }

    pub(crate) fn is_sending(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.diagnostics.subscribe()
    }

    pub(crate) fn emit(&self, event: OperationEvent) {
        // nobody listening is fine
        let _ = self.diagnostics.send(event);
    }

    /// Move the next batch out of the event queue and wake the sender.
    pub(crate) async fn manage_batch_sending(&self) {
        if self.form_batch().await {
            self.send_wake.notify_one();
        }
    }

    /// Returns whether any batch is waiting to be sent.
    async fn form_batch(&self) -> bool {
        let mut queues = self.queues.lock().await;
        let size = self
            .config
            .batch_size(queues.events.capacity(), queues.events.trigger_percent());
        let records = queues.events.take_first(size);
        let count = records.len();

        if count > 0 {
            if queues.batches.add(records) {
                queues.events.drop_first(count);
                debug!(
                    batch_size = count,
                    batches = queues.batches.len(),
                    "batch formed"
                );
            } else {
                debug!(
                    batches = queues.batches.len(),
                    "batch queue full, records stay pending"
                );
            }
        }

        !queues.batches.is_empty()
    }

    /// Deliver the oldest batch, retrying until it resolves.
    pub(crate) async fn deliver_oldest(
        &self,
        last_completed: &mut Option<Instant>,
        cancel: &CancellationToken,
    ) -> Outcome {
        if !self.is_active() {
            return Outcome::Idle;
        }
        let Some(session) = self.session.read().await.clone() else {
            return Outcome::Idle;
        };

        self.in_flight.store(true, Ordering::SeqCst);
        let outcome = self.run_attempts(&session, last_completed, cancel).await;
        self.in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_attempts(
        &self,
        session: &Session,
        last_completed: &mut Option<Instant>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let publish_backoff = self.config.publish_backoff_interval();
        let outage_backoff = self.config.outage_backoff_interval();
        let max_attempts = self.config.max_total_request_retries();
        let mut attempts: u32 = 0;

        loop {
            if let Some(done) = *last_completed {
                let elapsed = done.elapsed();
                if elapsed < publish_backoff {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Outcome::Halted,
                        _ = sleep(publish_backoff - elapsed) => {}
                    }
                }
            }
            if cancel.is_cancelled() {
                return Outcome::Halted;
            }

            let (event_count, data) = {
                let queues = self.queues.lock().await;
                let Some(batch) = queues.batches.peek_oldest() else {
                    return Outcome::Idle;
                };
                (batch.len(), batch.to_json())
            };
            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    error!(error = %e, "batch could not be serialized, dropping it");
                    self.abandon_oldest(0, e.to_string(), attempts).await;
                    return Outcome::Abandoned;
                }
            };

            let path = format!(
                "v1/{}/track?r={}",
                session.api_token,
                rand::thread_rng().gen_range(0..i32::MAX)
            );
            let started = Instant::now();
            self.emit(OperationEvent::SendingBatch {
                event_count,
                attempt: attempts + 1,
            });
            debug!(event_count, attempt = attempts + 1, "sending batch");

            let result = match timeout(
                self.config.publish_interval(),
                session.transport.send(&path, Some(data.as_str())),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            *last_completed = Some(Instant::now());

            let e = match result {
                Ok(response) => {
                    self.acknowledge_oldest(&response).await;
                    return Outcome::Delivered;
                }
                Err(e) => e,
            };

            if e.is_auth_failure() {
                warn!(error = %e, "API token refused, setup is required again");
                self.set_state(SetupState::Revoked);
                self.emit(OperationEvent::Unauthorized);
                return Outcome::Revoked;
            }

            attempts += 1;
            warn!(error = %e, attempts, max_attempts, "batch send failed");

            if attempts >= max_attempts {
                self.abandon_oldest(e.status_code(), e.description(), attempts)
                    .await;
                return Outcome::Abandoned;
            }

            let elapsed = started.elapsed();
            if elapsed < outage_backoff {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Outcome::Halted,
                    _ = sleep(outage_backoff - elapsed) => {}
                }
            }
            if cancel.is_cancelled() || !self.is_active() {
                return Outcome::Halted;
            }
        }
    }

    /// Remove the acknowledged batch and answer its callbacks.
    async fn acknowledge_oldest(&self, response: &str) {
        let Some(batch) = self.queues.lock().await.batches.remove_oldest() else {
            return;
        };
        info!(event_count = batch.len(), "batch delivered");
        self.emit(OperationEvent::BatchDelivered {
            response: response.to_string(),
        });

        let parsed = serde_json::from_str::<TrackResponse>(response);
        if let Err(e) = &parsed {
            warn!(error = %e, "server response was not understood");
        }

        for record in batch.records().iter().filter(|r| r.has_callback()) {
            let event_id = record.event_id().unwrap_or_default().to_string();
            let result = match &parsed {
                Ok(parsed) => match parsed.response_properties(&event_id) {
                    Some(response_properties) => DeliveryResult {
                        event_id,
                        status: parsed.status,
                        delivery_status_code: 200,
                        delivery_status_description: None,
                        response_properties,
                    },
                    None => {
                        DeliveryResult::failed(event_id, 200, "no result for event in server response")
                    }
                },
                Err(e) => {
                    DeliveryResult::failed(event_id, 200, format!("unreadable server response: {e}"))
                }
            };
            record.resolve(result);
        }
    }

    /// Drop the oldest batch and fail its callbacks.
    async fn abandon_oldest(&self, code: u16, description: String, attempts: u32) {
        let Some(batch) = self.queues.lock().await.batches.remove_oldest() else {
            return;
        };
        error!(
            event_count = batch.len(),
            code,
            description = %description,
            attempts,
            "batch abandoned after final attempt"
        );
        self.emit(OperationEvent::BatchAbandoned {
            event_count: batch.len(),
            code,
            description: description.clone(),
            attempts,
        });

        for record in batch.records().iter().filter(|r| r.has_callback()) {
            let event_id = record.event_id().unwrap_or_default();
            record.resolve(DeliveryResult::failed(event_id, code, description.clone()));
        }
    }
}

/// Handles to the background tasks of one tracker.
pub(crate) struct DeliveryScheduler {
    cancel: CancellationToken,
    flush_task: Option<JoinHandle<()>>,
    send_task: Option<JoinHandle<()>>,
}

impl DeliveryScheduler {
    /// Spawn the flush and send loops.
    pub(crate) fn start(shared: Arc<Shared>) -> Self {
        let cancel = CancellationToken::new();
        let flush_task = tokio::spawn(flush_loop(shared.clone(), cancel.clone()));
        let send_task = tokio::spawn(send_loop(shared, cancel.clone()));

        Self {
            cancel,
            flush_task: Some(flush_task),
            send_task: Some(send_task),
        }
    }

    /// Stop both loops. An attempt already in flight finishes first.
    pub(crate) async fn stop(&mut self) {
        self.cancel.cancel();
        for task in [self.flush_task.take(), self.send_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = task.await {
                error!(error = %e, "delivery task ended abnormally");
            }
        }
    }
}

impl Drop for DeliveryScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn flush_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let period = shared.config.publish_interval();
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
            _ = shared.flush_signal.notified() => {}
        }

        if shared.is_active() {
            shared.manage_batch_sending().await;
        }
    }
    debug!("flush loop stopped");
}

async fn send_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut last_completed = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.send_wake.notified() => {}
        }

        loop {
            match shared.deliver_oldest(&mut last_completed, &cancel).await {
                // move straight on to the next batch
                Outcome::Abandoned if !cancel.is_cancelled() => {
                    if !shared.form_batch().await {
                        break;
                    }
                }
                _ => break,
            }
        }
    }
    debug!("send loop stopped");
}
