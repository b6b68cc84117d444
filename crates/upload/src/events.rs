//! Fan-out of upload events to bounded subscriber queues.

use std::sync::Mutex;

use directup_protocol::UploadEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Default capacity of each subscriber queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Fans upload events out to any number of subscribers.
///
/// Each subscriber gets its own bounded queue. Publishing never waits: an
/// event that does not fit a full queue is dropped for that subscriber only.
pub struct EventHub {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<UploadEvent>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<UploadEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber.
    pub fn publish(&self, event: UploadEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(batch = %event.batch_id(), "subscriber queue full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Detaches all subscribers; their receivers end after draining.
    pub fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}
