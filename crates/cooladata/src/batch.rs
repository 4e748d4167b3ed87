//! Batches waiting for the server.

use crate::types::{EventRecord, TrackPayload};
use crate::Error;
use std::collections::VecDeque;

/// Non-empty group of records delivered in one request.
#[derive(Debug, Clone)]
pub struct Batch {
    records: Vec<EventRecord>,
}

impl Batch {
    /// `None` for an empty record list.
    pub fn new(records: Vec<EventRecord>) -> Option<Self> {
        if records.is_empty() {
            None
        } else {
            Some(Self { records })
        }
    }

    /// Records in the order they will be sent.
    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always false for a constructed batch.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Wire payload for this batch.
    pub fn payload(&self) -> TrackPayload {
        TrackPayload {
            events: self.records.iter().map(EventRecord::to_event_object).collect(),
        }
    }

    /// Request body `{"events": [...]}` as JSON text.
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&self.payload())?)
    }
}

/// FIFO of batches, bounded by `max_batches`.
#[derive(Debug)]
pub struct BatchQueue {
    batches: VecDeque<Batch>,
    max_batches: usize,
}

impl BatchQueue {
    /// Create an empty queue holding at most `max_batches` batches.
    pub fn new(max_batches: usize) -> Self {
        Self {
            batches: VecDeque::new(),
            max_batches,
        }
    }

    /// Admit a batch built from `records`.
    ///
    /// Returns false, leaving the queue untouched, for an empty record list
    /// or a full queue. The caller keeps the records for a later attempt.
    pub fn add(&mut self, records: Vec<EventRecord>) -> bool {
        if self.batches.len() >= self.max_batches {
            return false;
        }
        match Batch::new(records) {
            Some(batch) => {
                self.batches.push_back(batch);
                true
            }
            None => false,
        }
    }

    /// The batch to send next.
    pub fn peek_oldest(&self) -> Option<&Batch> {
        self.batches.front()
    }

    /// Pop the oldest batch; `None` on an empty queue.
    pub fn remove_oldest(&mut self) -> Option<Batch> {
        self.batches.pop_front()
    }

    /// Number of queued batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Check if no batch is queued.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Get the queue bound.
    pub fn max_batches(&self) -> usize {
        self.max_batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(names: &[&str]) -> Vec<EventRecord> {
        names
            .iter()
            .map(|name| EventRecord::new(*name, "user_1"))
            .collect()
    }

    #[test]
    fn test_rejects_empty_batch() {
        let mut queue = BatchQueue::new(5);
        assert!(!queue.add(Vec::new()));
        assert!(queue.is_empty());
        assert!(Batch::new(Vec::new()).is_none());
    }

    #[test]
    fn test_rejects_when_full() {
        let mut queue = BatchQueue::new(2);
        assert!(queue.add(records(&["a"])));
        assert!(queue.add(records(&["b"])));

        assert!(!queue.add(records(&["c"])));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = BatchQueue::new(5);
        queue.add(records(&["a", "b"]));
        queue.add(records(&["c"]));

        let oldest = queue.peek_oldest().unwrap();
        assert_eq!(oldest.len(), 2);
        assert_eq!(oldest.records()[0].event_name(), "a");

        let removed = queue.remove_oldest().unwrap();
        assert_eq!(removed.records()[1].event_name(), "b");
        assert_eq!(queue.peek_oldest().unwrap().records()[0].event_name(), "c");

        queue.remove_oldest();
        assert!(queue.peek_oldest().is_none());
        // removing from an empty queue is a no-op
        assert!(queue.remove_oldest().is_none());
    }

    #[test]
    fn test_payload_lists_every_record() {
        let batch = Batch::new(records(&["a", "b"])).unwrap();
        let json: serde_json::Value = serde_json::from_str(&batch.to_json().unwrap()).unwrap();

        let events = json["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event_name"], "a");
        assert_eq!(events[1]["event_name"], "b");
    }
}
