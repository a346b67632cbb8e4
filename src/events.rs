//! Type-keyed publish/subscribe event bus.
//!
//! Plain keyed broadcast for collaborators outside the coordination core:
//! no deduplication, no cancellation semantics. Each event type gets its
//! own lazily created broadcast channel, reclaimed when its last subscriber
//! goes away. Publishing to a type nobody subscribes to is a silent no-op.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

struct Inner {
    topics: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    capacity: usize,
}

/// Publish/subscribe bus keyed by event type.
///
/// Cheap to clone; all clones share the same topics.
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl EventBus {
    /// Create a bus with the default per-topic buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with a custom per-topic buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                capacity,
            }),
        }
    }

    /// Publish an event to all current subscribers of its type.
    ///
    /// Returns the number of subscribers reached; zero when nobody listens.
    pub fn publish<E: Clone + Send + 'static>(&self, event: E) -> usize {
        let topics = self.inner.topics.lock();
        topics
            .get(&TypeId::of::<E>())
            .and_then(|topic| topic.downcast_ref::<broadcast::Sender<E>>())
            .map_or(0, |sender| sender.send(event).unwrap_or(0))
    }

    /// Subscribe to events of type `E`, creating the topic if absent.
    pub fn subscribe<E: Clone + Send + 'static>(&self) -> EventStream<E> {
        let rx = {
            let mut topics = self.inner.topics.lock();
            let topic = topics
                .entry(TypeId::of::<E>())
                .or_insert_with(|| Box::new(broadcast::channel::<E>(self.inner.capacity).0));
            match topic.downcast_ref::<broadcast::Sender<E>>() {
                Some(sender) => sender.subscribe(),
                None => unreachable!("topic registered under a foreign type id"),
            }
        };
        EventStream {
            inner: self.inner.clone(),
            rx: Some(rx),
        }
    }

    /// Number of current subscribers for events of type `E`.
    pub fn subscriber_count<E: Clone + Send + 'static>(&self) -> usize {
        let topics = self.inner.topics.lock();
        topics
            .get(&TypeId::of::<E>())
            .and_then(|topic| topic.downcast_ref::<broadcast::Sender<E>>())
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription to one event type.
///
/// Dropping the last stream of a type reclaims its topic channel.
pub struct EventStream<E: 'static> {
    inner: Arc<Inner>,
    // Dropped explicitly before the reclamation check.
    rx: Option<broadcast::Receiver<E>>,
}

impl<E: Clone + Send + 'static> EventStream<E> {
    /// Receive the next event, skipping any gap caused by lag.
    ///
    /// Returns `None` when the topic channel is gone.
    pub async fn recv(&mut self) -> Option<E> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Receive without blocking; `None` when no event is buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl<E: 'static> Drop for EventStream<E> {
    fn drop(&mut self) {
        self.rx = None;
        let mut topics = self.inner.topics.lock();
        let reclaimable = topics
            .get(&TypeId::of::<E>())
            .and_then(|topic| topic.downcast_ref::<broadcast::Sender<E>>())
            .is_some_and(|sender| sender.receiver_count() == 0);
        if reclaimable {
            topics.remove(&TypeId::of::<E>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Pong(&'static str);

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe::<Ping>();

        assert_eq!(bus.publish(Ping(1)), 1);
        assert_eq!(stream.recv().await, Some(Ping(1)));
    }

    #[tokio::test]
    async fn test_topics_are_type_isolated() {
        let bus = EventBus::new();
        let mut pings = bus.subscribe::<Ping>();
        let mut pongs = bus.subscribe::<Pong>();

        bus.publish(Ping(1));
        bus.publish(Pong("hello"));

        assert_eq!(pings.try_recv(), Some(Ping(1)));
        assert_eq!(pings.try_recv(), None);
        assert_eq!(pongs.try_recv(), Some(Pong("hello")));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_reaches_nobody() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Ping(1)), 0);
    }

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let bus = EventBus::new();
        let mut first = bus.subscribe::<Ping>();
        let mut second = bus.subscribe::<Ping>();

        assert_eq!(bus.publish(Ping(2)), 2);
        assert_eq!(first.recv().await, Some(Ping(2)));
        assert_eq!(second.recv().await, Some(Ping(2)));
    }

    #[tokio::test]
    async fn test_topic_reclaimed_after_last_stream_drops() {
        let bus = EventBus::new();
        let first = bus.subscribe::<Ping>();
        let second = bus.subscribe::<Ping>();
        assert_eq!(bus.subscriber_count::<Ping>(), 2);

        drop(first);
        assert_eq!(bus.subscriber_count::<Ping>(), 1);

        drop(second);
        assert_eq!(bus.subscriber_count::<Ping>(), 0);
        assert_eq!(bus.publish(Ping(3)), 0);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_to_available_events() {
        let bus = EventBus::with_capacity(1);
        let mut stream = bus.subscribe::<Ping>();

        bus.publish(Ping(1));
        bus.publish(Ping(2));
        bus.publish(Ping(3));

        // Only the newest event still fits in the buffer.
        assert_eq!(stream.recv().await, Some(Ping(3)));
    }
}
