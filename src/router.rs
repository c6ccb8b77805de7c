//! Event bus - fans each `PipelineEvent` out to every subscriber
//!
//! Subscriber queues are unbounded: the archive writer and the analytics
//! accumulator both need every event to produce a correct result, so a
//! dropped event is a correctness bug, not a backpressure nicety. A slow
//! subscriber accumulates a backlog instead of losing history; a dead
//! (receiver-dropped) subscriber is simply skipped on the next publish.

use crate::events::PipelineEvent;
use tokio::sync::mpsc;

/// Fan-out point for the proxy's event stream
pub struct EventRouter {
    subscribers: Vec<(&'static str, mpsc::UnboundedSender<PipelineEvent>)>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Register a new subscriber and return its receiving end
    pub fn subscribe(&mut self, name: &'static str) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push((name, tx));
        rx
    }

    /// Publish one event to every subscriber, isolating failures per-sink
    pub fn publish(&self, event: PipelineEvent) {
        for (name, sender) in &self.subscribers {
            if sender.send(event.clone()).is_err() {
                tracing::warn!(subscriber = name, "event dropped: subscriber closed");
            }
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn sample_event(seq: u32) -> PipelineEvent {
        PipelineEvent::new(
            "req-1".to_string(),
            seq,
            0,
            "anthropic".to_string(),
            EventKind::ResponseDone {},
        )
    }

    #[tokio::test]
    async fn every_subscriber_receives_published_events() {
        let mut router = EventRouter::new();
        let mut a = router.subscribe("a");
        let mut b = router.subscribe("b");

        router.publish(sample_event(0));

        assert_eq!(a.recv().await.unwrap().seq, 0);
        assert_eq!(b.recv().await.unwrap().seq, 0);
    }

    #[tokio::test]
    async fn a_slow_subscriber_keeps_its_full_backlog() {
        let mut router = EventRouter::new();
        let mut slow = router.subscribe("slow");
        let mut fast = router.subscribe("fast");

        router.publish(sample_event(0));
        router.publish(sample_event(1));

        assert_eq!(fast.recv().await.unwrap().seq, 0);
        assert_eq!(fast.recv().await.unwrap().seq, 1);
        assert_eq!(slow.recv().await.unwrap().seq, 0);
        assert_eq!(slow.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_panic_publisher() {
        let mut router = EventRouter::new();
        let rx = router.subscribe("gone");
        drop(rx);

        router.publish(sample_event(0));
    }
}
