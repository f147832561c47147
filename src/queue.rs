//! Listener for public queue advertisements (`dsq`).
//!
//! Coordinators broadcast a signed advertisement when they open a mixing
//! queue. The listener verifies each one against the registry, enforces the
//! freshness window, drops duplicates, and hands not-yet-tried ready queues
//! to the orchestrator on request. It also feeds the per-coordinator
//! rate-limit counters that `start_new_queue` consults.

use std::sync::{Arc, Mutex};

use crate::messages::Queue;
use crate::registry::CoordinatorRegistry;
use crate::{Error, Result};

struct QueueEntry {
    queue: Queue,
    tried: bool,
}

pub struct QueueListener {
    registry: Arc<dyn CoordinatorRegistry>,
    entries: Mutex<Vec<QueueEntry>>,
}

impl QueueListener {
    pub fn new(registry: Arc<dyn CoordinatorRegistry>) -> QueueListener {
        QueueListener {
            registry,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Validate and store an incoming advertisement. Returns whether the
    /// queue is ready for submissions (the caller uses that to trigger entry
    /// submission for a waiting session).
    pub fn process_queue(&self, queue: Queue, now: i64) -> Result<bool> {
        if queue.is_time_out_of_bounds(now) {
            log::debug!("queue: {queue} is out of the time window");
            return Err(Error::QueueRejected("timestamp out of bounds"));
        }

        let coordinator = self
            .registry
            .by_outpoint(&queue.coordinator_outpoint)
            .ok_or(Error::QueueRejected("coordinator not in registry"))?;

        if !self.registry.verify_queue_signature(
            &coordinator.outpoint,
            &queue.signature_hash(),
            &queue.signature,
        ) {
            log::warn!("queue: invalid signature on {queue}");
            return Err(Error::QueueRejected("invalid signature"));
        }

        let mut entries = self.entries.lock().unwrap();
        let duplicate = entries.iter().any(|e| {
            e.queue.coordinator_outpoint == queue.coordinator_outpoint
                && e.queue.time == queue.time
                && e.queue.ready == queue.ready
        });
        if duplicate {
            log::debug!("queue: already have {queue}");
            return Err(Error::QueueRejected("duplicate"));
        }

        // Accepting the advertisement counts against the coordinator's
        // rate limit.
        self.registry.note_dsq(&coordinator.outpoint, queue.time);

        log::info!("queue: new {queue}");
        let ready = queue.ready;
        entries.push(QueueEntry {
            queue,
            tried: false,
        });
        Ok(ready)
    }

    /// The next ready, in-window queue that has not been attempted yet.
    /// Marks it as tried so a queue is only ever attempted once.
    pub fn next_ready(&self, now: i64) -> Option<Queue> {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.tried || !entry.queue.ready {
                continue;
            }
            if entry.queue.is_time_out_of_bounds(now) {
                continue;
            }
            entry.tried = true;
            return Some(entry.queue.clone());
        }
        None
    }

    /// Drop advertisements that fell out of the freshness window.
    pub fn do_maintenance(&self, now: i64) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| !e.queue.is_time_out_of_bounds(now));
        if entries.len() != before {
            log::debug!("queue: expired {} advertisements", before - entries.len());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{signed_queue, test_coordinator, StaticRegistry};

    fn listener() -> (QueueListener, Arc<StaticRegistry>) {
        let registry = Arc::new(StaticRegistry::new(vec![test_coordinator(1)]));
        (QueueListener::new(registry.clone()), registry)
    }

    #[test]
    fn accepts_valid_queue_and_drops_duplicate() {
        let (listener, registry) = listener();
        let queue = signed_queue(&test_coordinator(1), 1000, true);
        assert!(listener.process_queue(queue.clone(), 1000).unwrap());
        assert!(matches!(
            listener.process_queue(queue, 1000),
            Err(Error::QueueRejected("duplicate"))
        ));
        assert_eq!(listener.len(), 1);
        assert_eq!(registry.dsq_count(), 1);
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let (listener, _) = listener();
        let queue = signed_queue(&test_coordinator(1), 1000, true);
        assert!(listener.process_queue(queue.clone(), 1031).is_err());
        assert!(listener.process_queue(queue, 969).is_err());
    }

    #[test]
    fn rejects_bad_signature() {
        let (listener, _) = listener();
        let mut queue = signed_queue(&test_coordinator(1), 1000, true);
        queue.signature = vec![0u8; 96];
        assert!(matches!(
            listener.process_queue(queue, 1000),
            Err(Error::QueueRejected("invalid signature"))
        ));
    }

    #[test]
    fn next_ready_marks_tried() {
        let (listener, _) = listener();
        let queue = signed_queue(&test_coordinator(1), 1000, true);
        listener.process_queue(queue, 1000).unwrap();
        assert!(listener.next_ready(1001).is_some());
        assert!(listener.next_ready(1001).is_none());
    }

    #[test]
    fn not_ready_queues_are_held_back() {
        let (listener, _) = listener();
        let queue = signed_queue(&test_coordinator(1), 1000, false);
        assert!(!listener.process_queue(queue, 1000).unwrap());
        assert!(listener.next_ready(1001).is_none());
        assert_eq!(listener.len(), 1);
    }

    #[test]
    fn maintenance_expires_old_queues() {
        let (listener, _) = listener();
        let queue = signed_queue(&test_coordinator(1), 1000, true);
        listener.process_queue(queue, 1000).unwrap();
        listener.do_maintenance(1040);
        assert!(listener.is_empty());
    }
}
