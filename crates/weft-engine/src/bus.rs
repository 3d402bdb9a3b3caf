//! In-process event bus
//!
//! Multi-producer broadcast with a bounded per-subscriber queue. A
//! subscriber that falls behind loses the oldest events for itself only
//! and receives a synthesized `SubscriberLag` telling it how many were
//! dropped. Publication order is preserved per subscriber.

use chrono::Utc;
use log::debug;
use tokio::sync::broadcast;

use weft_core::event::{Event, EventPayload, Topic};

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// `depth` is the per-subscriber queue bound before drop-oldest.
    pub fn new(depth: usize) -> Self {
        let (tx, _) = broadcast::channel(depth.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers. With no subscribers the event
    /// is dropped; the persistent record lives in the run store.
    pub fn publish(&self, event: Event) {
        let receivers = self.tx.receiver_count();
        if receivers == 0 {
            debug!("no subscribers for {} on run {}", event.payload.kind(), event.run_id);
        }
        let _ = self.tx.send(event);
    }

    /// Subscribe to a topic; events outside it are filtered out locally.
    pub fn subscribe(&self, topic: Topic) -> EventStream {
        EventStream { rx: self.tx.subscribe(), topic }
    }
}

/// One subscriber's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
    topic: Topic,
}

impl EventStream {
    /// Next matching event; `None` once the bus shuts down and the
    /// backlog drains. A lagged subscriber gets a `SubscriberLag` event
    /// in place of what it missed.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.topic.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(Event {
                        run_id: String::new(),
                        ts: Utc::now(),
                        version: weft_core::event::EVENT_SCHEMA_VERSION,
                        payload: EventPayload::SubscriberLag { missed },
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests to drain what is already
    /// queued.
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.topic.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    return Some(Event {
                        run_id: String::new(),
                        ts: Utc::now(),
                        version: weft_core::event::EVENT_SCHEMA_VERSION,
                        payload: EventPayload::SubscriberLag { missed },
                    });
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::RunState;

    fn event(run: &str, payload: EventPayload) -> Event {
        Event::new(run, Utc::now(), payload)
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let bus = EventBus::new(16);
        let mut all = bus.subscribe(Topic::AllRuns);
        let mut only_r2 = bus.subscribe(Topic::Run("r2".into()));

        bus.publish(event("r1", EventPayload::RunStarted { pipeline_id: "p".into(), dry_run: false }));
        bus.publish(event("r2", EventPayload::RunFinished { state: RunState::Succeeded, error: None }));

        assert_eq!(all.next().await.unwrap().run_id, "r1");
        assert_eq!(all.next().await.unwrap().run_id, "r2");
        let got = only_r2.next().await.unwrap();
        assert_eq!(got.run_id, "r2");
        assert_eq!(got.payload.kind(), "run_finished");
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_lag_event() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe(Topic::AllRuns);
        for i in 0..10 {
            bus.publish(event(
                &format!("r{i}"),
                EventPayload::RunStarted { pipeline_id: "p".into(), dry_run: false },
            ));
        }
        let first = slow.next().await.unwrap();
        match first.payload {
            EventPayload::SubscriberLag { missed } => assert_eq!(missed, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        // The retained tail is still delivered in order.
        let next = slow.next().await.unwrap();
        assert_eq!(next.run_id, "r6");
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe(Topic::AllRuns);
        bus.publish(event("r1", EventPayload::RunStarted { pipeline_id: "p".into(), dry_run: false }));
        drop(bus);
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }
}
