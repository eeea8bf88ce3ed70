//! Change-notification sink for the external UI/API host. Thread-safe and
//! non-blocking: the state document remains the durable source of truth,
//! so a dropped event under backpressure is acceptable.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, name: &str, payload: Value);
}

/// Production sink: a bounded channel drained by the host process. Emits
/// never block the caller; once the buffer is full, new events are
/// dropped rather than applying backpressure to the engine that produced
/// them.
pub struct ChannelEventSink {
    tx: SyncSender<Event>,
}

impl ChannelEventSink {
    /// Returns the sink half and the receiver half. `capacity` bounds how
    /// many unconsumed events are buffered before new ones are dropped.
    pub fn new(capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = sync_channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, name: &str, payload: Value) {
        let event = Event {
            name: name.to_string(),
            payload,
        };
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                // Backpressure: drop. The state document remains the
                // durable source of truth, so a missed notification does
                // not lose data, only UI freshness.
            }
        }
    }
}

/// Test sink: a ring buffer of the last `capacity` events for assertions.
pub struct RingBufferEventSink {
    capacity: usize,
    events: Mutex<Vec<Event>>,
}

impl RingBufferEventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event ring buffer mutex poisoned").clone()
    }
}

impl EventSink for RingBufferEventSink {
    fn emit(&self, name: &str, payload: Value) {
        let mut events = self.events.lock().expect("event ring buffer mutex poisoned");
        events.push(Event {
            name: name.to_string(),
            payload,
        });
        if events.len() > self.capacity {
            events.remove(0);
        }
    }
}

/// A sink that discards everything, used when no host is listening.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _name: &str, _payload: Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_buffer_records_events() {
        let sink = RingBufferEventSink::new(10);
        sink.emit("DownloadUpdate", json!({ "id": 1 }));
        sink.emit("DownloadUpdate", json!({ "id": 2 }));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "DownloadUpdate");
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let sink = RingBufferEventSink::new(2);
        sink.emit("a", json!(1));
        sink.emit("b", json!(2));
        sink.emit("c", json!(3));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "b");
        assert_eq!(events[1].name, "c");
    }

    #[test]
    fn channel_sink_drops_under_backpressure_without_blocking() {
        let (sink, rx) = ChannelEventSink::new(1);
        sink.emit("first", json!(1));
        sink.emit("second", json!(2));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.name, "first");
        assert!(rx.try_recv().is_err());
    }
}
