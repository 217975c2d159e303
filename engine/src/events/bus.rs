//! Per-run live event feed.
//!
//! Delivery is best effort: a subscriber that falls more than the channel
//! capacity behind sees `Lagged` and must re-read the durable chain.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::core::event::Event;

pub struct EventBus {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn with_channels<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, broadcast::Sender<Event>>) -> T,
    ) -> T {
        // A poisoned map still holds valid senders.
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut channels)
    }

    /// Open the run's channel. Opening an open channel is a no-op.
    pub fn open(&self, run_id: &str) {
        let capacity = self.capacity;
        self.with_channels(|channels| {
            channels
                .entry(run_id.to_string())
                .or_insert_with(|| broadcast::channel(capacity).0);
        });
        debug!(run_id, "event channel opened");
    }

    /// Close the run's channel. Subscribers drain what was sent, then see `Closed`.
    pub fn close(&self, run_id: &str) {
        if self.with_channels(|channels| channels.remove(run_id)).is_some() {
            debug!(run_id, "event channel closed");
        }
    }

    pub fn is_open(&self, run_id: &str) -> bool {
        self.with_channels(|channels| channels.contains_key(run_id))
    }

    /// Publish to the run's channel. Unknown or closed runs are ignored.
    pub fn publish(&self, event: &Event) {
        self.with_channels(|channels| {
            if let Some(sender) = channels.get(&event.run_id) {
                // No receivers is not an error for a live feed.
                let _ = sender.send(event.clone());
            } else {
                debug!(run_id = %event.run_id, seq = event.seq, "no open channel for event");
            }
        });
    }

    /// Subscribe to an open run. `None` once the run's channel is closed.
    pub fn subscribe(&self, run_id: &str) -> Option<broadcast::Receiver<Event>> {
        self.with_channels(|channels| channels.get(run_id).map(broadcast::Sender::subscribe))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::core::event::{EventPayload, StatusLevel};

    fn event(run_id: &str, seq: u64) -> Event {
        Event {
            id: format!("{run_id}-{seq}"),
            run_id: run_id.to_string(),
            seq,
            parent_id: None,
            created_at: Utc::now(),
            payload: EventPayload::Status {
                level: StatusLevel::Info,
                content: format!("event {seq}"),
            },
        }
    }

    #[test]
    fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new(16);
        bus.open("r1");
        let mut rx = bus.subscribe("r1").expect("open channel");
        bus.publish(&event("r1", 0));
        bus.publish(&event("r1", 1));
        bus.publish(&event("r2", 0));

        assert_eq!(rx.try_recv().expect("first").seq, 0);
        assert_eq!(rx.try_recv().expect("second").seq, 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn close_ends_stream_after_buffered_events() {
        let bus = EventBus::new(16);
        bus.open("r1");
        let mut rx = bus.subscribe("r1").expect("open channel");
        bus.publish(&event("r1", 0));
        bus.close("r1");

        assert_eq!(rx.try_recv().expect("buffered").seq, 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
        assert!(bus.subscribe("r1").is_none());
        assert!(!bus.is_open("r1"));
    }

    #[test]
    fn publish_without_channel_or_receivers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(&event("r1", 0));
        bus.open("r1");
        bus.publish(&event("r1", 0));
        bus.open("r1");
        assert!(bus.is_open("r1"));
    }
}
