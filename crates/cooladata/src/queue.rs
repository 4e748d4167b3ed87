//! Pending events, waiting to be batched.

use crate::types::EventRecord;
use crate::Error;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Bounded two-lane queue of events that have not been batched yet.
///
/// Records carrying a callback go to the priority lane and are always
/// taken first. When over capacity the oldest plain records are dropped,
/// priority records only once the plain lane is empty.
///
/// The queue is not synchronized itself; the scheduler keeps it behind the
/// same lock as the batch queue.
#[derive(Debug)]
pub struct EventQueue {
    priority_items: VecDeque<EventRecord>,
    plain_items: VecDeque<EventRecord>,
    capacity: usize,
    trigger_percent: u8,
    flush_signal: Option<Arc<Notify>>,
}

impl EventQueue {
    /// Create a new event queue.
    pub fn new(capacity: usize, trigger_percent: u8) -> Self {
        Self {
            priority_items: VecDeque::new(),
            plain_items: VecDeque::new(),
            capacity,
            trigger_percent: trigger_percent.min(100),
            flush_signal: None,
        }
    }

    /// Attach (or with `None`, detach) the signal raised when a flush is due.
    pub fn set_flush_signal(&mut self, signal: Option<Arc<Notify>>) {
        self.flush_signal = signal;
    }

    /// Add a record.
    ///
    /// Never fails for a full queue: the oldest records are evicted instead.
    /// Returns an error only for a record that breaks a tracking precondition.
    pub fn add(&mut self, record: EventRecord) -> Result<(), Error> {
        record.validate()?;

        if record.has_callback() {
            self.priority_items.push_back(record);
        } else {
            self.plain_items.push_back(record);
        }

        self.shrink_to_capacity();
        self.check_trigger();
        Ok(())
    }

    /// Clone up to `max_count` records, priority lane first, oldest first.
    pub fn take_first(&self, max_count: usize) -> Vec<EventRecord> {
        self.priority_items
            .iter()
            .chain(self.plain_items.iter())
            .take(max_count)
            .cloned()
            .collect()
    }

    /// Remove up to `count` records in the order `take_first` returns them.
    pub fn drop_first(&mut self, count: usize) {
        let from_priority = count.min(self.priority_items.len());
        self.priority_items.drain(..from_priority);

        let from_plain = (count - from_priority).min(self.plain_items.len());
        self.plain_items.drain(..from_plain);
    }

    /// Change the capacity, evicting as needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.shrink_to_capacity();
        self.check_trigger();
    }

    /// Change the flush trigger (clamped to 100).
    pub fn set_trigger_percent(&mut self, percent: u8) {
        self.trigger_percent = percent.min(100);
        self.check_trigger();
    }

    /// Get the maximum number of records held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the fill percentage that raises the flush signal.
    pub fn trigger_percent(&self) -> u8 {
        self.trigger_percent
    }

    /// Get the number of records in the queue.
    pub fn len(&self) -> usize {
        self.priority_items.len() + self.plain_items.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the number of records waiting for a callback.
    pub fn priority_len(&self) -> usize {
        self.priority_items.len()
    }

    /// Get the number of records without a callback.
    pub fn plain_len(&self) -> usize {
        self.plain_items.len()
    }

    /// Whether a flush is due: the fill ratio reached the trigger, or a
    /// record is waiting for a callback.
    pub fn should_flush(&self) -> bool {
        let threshold = self.capacity as u128 * u128::from(self.trigger_percent);
        (self.len() as u128) * 100 >= threshold || !self.priority_items.is_empty()
    }

    fn shrink_to_capacity(&mut self) {
        let excess = self.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }

        let from_plain = excess.min(self.plain_items.len());
        self.plain_items.drain(..from_plain);

        let excess_priority = self.priority_items.len().saturating_sub(self.capacity);
        self.priority_items.drain(..excess_priority);
    }

    fn check_trigger(&self) {
        if let Some(signal) = &self.flush_signal {
            if self.should_flush() {
                signal.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryCallback;
    use std::time::Duration;

    fn plain(id: usize) -> EventRecord {
        EventRecord::new(format!("event_{id}"), "user_1").with_property("id", id)
    }

    fn priority(id: usize) -> EventRecord {
        let callback: DeliveryCallback = Arc::new(|_| {});
        plain(id)
            .with_event_id(format!("evt_{id}"))
            .with_callback(callback)
    }

    fn names(records: &[EventRecord]) -> Vec<String> {
        records.iter().map(|r| r.event_name().to_string()).collect()
    }

    #[test]
    fn test_add_and_len() {
        let mut queue = EventQueue::new(10, 85);

        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());

        queue.add(plain(1)).unwrap();
        queue.add(priority(2)).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.plain_len(), 1);
        assert_eq!(queue.priority_len(), 1);
    }

    #[test]
    fn test_add_rejects_invalid_records() {
        let mut queue = EventQueue::new(10, 85);

        let unpaired = EventRecord::new("event", "user_1").with_event_id("evt_1");
        assert!(queue.add(unpaired).is_err());
        assert!(queue.add(EventRecord::new("", "user_1")).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_first_prefers_priority_items() {
        let mut queue = EventQueue::new(10, 85);
        queue.add(plain(1)).unwrap();
        queue.add(priority(2)).unwrap();
        queue.add(plain(3)).unwrap();
        queue.add(priority(4)).unwrap();

        let taken = queue.take_first(3);
        assert_eq!(names(&taken), ["event_2", "event_4", "event_1"]);

        // taking does not mutate
        assert_eq!(names(&queue.take_first(3)), names(&taken));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_drop_first_matches_take_first() {
        let mut queue = EventQueue::new(10, 85);
        queue.add(plain(1)).unwrap();
        queue.add(priority(2)).unwrap();
        queue.add(plain(3)).unwrap();

        queue.drop_first(2);

        assert_eq!(names(&queue.take_first(10)), ["event_3"]);

        queue.drop_first(5);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest_plain_first() {
        let mut queue = EventQueue::new(3, 100);
        queue.add(priority(1)).unwrap();
        queue.add(plain(2)).unwrap();
        queue.add(plain(3)).unwrap();
        queue.add(plain(4)).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(names(&queue.take_first(3)), ["event_1", "event_3", "event_4"]);
    }

    #[test]
    fn test_overflow_evicts_priority_only_when_plain_exhausted() {
        let mut queue = EventQueue::new(2, 100);
        queue.add(plain(1)).unwrap();
        queue.add(priority(2)).unwrap();
        queue.add(priority(3)).unwrap();
        queue.add(priority(4)).unwrap();

        assert_eq!(queue.plain_len(), 0);
        assert_eq!(names(&queue.take_first(2)), ["event_3", "event_4"]);
    }

    #[test]
    fn test_lowering_capacity_reclamps() {
        let mut queue = EventQueue::new(10, 100);
        for i in 0..4 {
            queue.add(priority(i)).unwrap();
            queue.add(plain(10 + i)).unwrap();
        }

        queue.set_capacity(5);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.priority_len(), 4);

        queue.set_capacity(2);
        assert_eq!(queue.plain_len(), 0);
        assert_eq!(names(&queue.take_first(2)), ["event_2", "event_3"]);

        queue.set_capacity(0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_should_flush_at_trigger_percent() {
        let mut queue = EventQueue::new(10, 30);

        queue.add(plain(1)).unwrap();
        queue.add(plain(2)).unwrap();
        assert!(!queue.should_flush());

        queue.add(plain(3)).unwrap();
        assert!(queue.should_flush());
    }

    #[test]
    fn test_priority_item_always_triggers() {
        let mut queue = EventQueue::new(100, 100);
        queue.add(plain(1)).unwrap();
        assert!(!queue.should_flush());

        queue.add(priority(2)).unwrap();
        assert!(queue.should_flush());
    }

    #[test]
    fn test_set_trigger_percent_reevaluates() {
        let mut queue = EventQueue::new(10, 100);
        queue.add(plain(1)).unwrap();
        assert!(!queue.should_flush());

        queue.set_trigger_percent(10);
        assert!(queue.should_flush());

        queue.set_trigger_percent(200);
        assert_eq!(queue.trigger_percent(), 100);
    }

    #[tokio::test]
    async fn test_signal_raised_only_when_attached() {
        let signal = Arc::new(Notify::new());
        let mut queue = EventQueue::new(100, 100);

        queue.add(priority(1)).unwrap();
        let detached =
            tokio::time::timeout(Duration::from_millis(20), signal.notified()).await;
        assert!(detached.is_err());

        queue.set_flush_signal(Some(signal.clone()));
        queue.add(priority(2)).unwrap();
        let attached =
            tokio::time::timeout(Duration::from_millis(20), signal.notified()).await;
        assert!(attached.is_ok());
    }
}
