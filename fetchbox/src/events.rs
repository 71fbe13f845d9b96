//! Named-topic pub/sub for refetch and invalidation signals.
//!
//! The [`EventBus`] decouples the machinery that *detects* a reason to
//! refetch (invalidation after a write, window focus, network reconnect,
//! debounce timers) from the controllers that *perform* the refetch. Every
//! built-in topic carries a typed payload via the [`Event`] enum;
//! third-party plugins publish under their own topics with
//! [`Event::Custom`].
//!
//! Emission is synchronous: `emit` invokes every matching handler before
//! returning, in registration order. Handlers may themselves emit (the
//! refetch plugin turns an `invalidate` hit into a `refetch` emission);
//! the bus clones the handler list before dispatch so re-entrant emission
//! does not deadlock.
//!
//! The `focus` and `online` topics are the platform boundary: the embedding
//! adapter (a UI framework binding, a test) emits them when the host
//! environment regains focus or connectivity.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use smol_str::SmolStr;
use tracing::debug;

use fetchbox_core::QueryKey;

/// Built-in topic names.
pub mod topic {
    /// Carries [`RefetchEvent`](super::RefetchEvent)s.
    pub const REFETCH: &str = "refetch";
    /// Carries invalidated tag sets.
    pub const INVALIDATE: &str = "invalidate";
    /// Requests a refetch of every mounted controller.
    pub const REFETCH_ALL: &str = "refetchAll";
    /// The host environment regained focus.
    pub const FOCUS: &str = "focus";
    /// The host environment regained network connectivity.
    pub const ONLINE: &str = "online";
}

/// Why a refetch was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefetchReason {
    /// The host environment regained focus.
    Focus,
    /// The host environment regained connectivity.
    Reconnect,
    /// A tag the entry carries was invalidated.
    Invalidate,
    /// Requested by user code or a timer.
    Manual,
}

impl RefetchReason {
    /// Returns the reason as a string slice.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RefetchReason::Focus => "focus",
            RefetchReason::Reconnect => "reconnect",
            RefetchReason::Invalidate => "invalidate",
            RefetchReason::Manual => "manual",
        }
    }
}

/// Payload of the `refetch` topic.
#[derive(Clone, Debug, PartialEq)]
pub struct RefetchEvent {
    /// The key whose owner should re-execute.
    pub query_key: QueryKey,
    /// Why the refetch was requested.
    pub reason: RefetchReason,
}

/// A typed event on the bus.
#[derive(Clone, Debug)]
pub enum Event {
    /// A controller should re-execute the named key.
    Refetch(RefetchEvent),
    /// The given tags were invalidated.
    Invalidate(Vec<SmolStr>),
    /// Every mounted controller should re-execute.
    RefetchAll,
    /// The host environment regained focus.
    WindowFocus,
    /// The host environment regained connectivity.
    NetworkOnline,
    /// A plugin-defined event on its own topic.
    Custom {
        /// Topic the event is published under.
        topic: SmolStr,
        /// Arbitrary payload.
        payload: Value,
    },
}

impl Event {
    /// The topic this event is published under.
    pub fn topic(&self) -> &str {
        match self {
            Event::Refetch(_) => topic::REFETCH,
            Event::Invalidate(_) => topic::INVALIDATE,
            Event::RefetchAll => topic::REFETCH_ALL,
            Event::WindowFocus => topic::FOCUS,
            Event::NetworkOnline => topic::ONLINE,
            Event::Custom { topic, .. } => topic,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by subscriptions.
///
/// `unsubscribe` is idempotent: calling it more than once is safe and only
/// the first call removes the handler.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    done: AtomicBool,
    remove: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    /// Builds a subscription around a removal closure.
    pub(crate) fn new(remove: impl Fn() + Send + Sync + 'static) -> Self {
        Subscription {
            inner: Arc::new(SubscriptionInner {
                done: AtomicBool::new(false),
                remove: Box::new(remove),
            }),
        }
    }

    /// Removes the handler. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.inner.done.swap(true, Ordering::SeqCst) {
            (self.inner.remove)();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("done", &self.inner.done.load(Ordering::SeqCst))
            .finish()
    }
}

/// Named-topic pub/sub with typed payloads.
#[derive(Default)]
pub struct EventBus {
    handlers: DashMap<SmolStr, Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler on a topic.
    pub fn subscribe(
        self: &Arc<Self>,
        topic: impl Into<SmolStr>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        let bus = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade()
                && let Some(mut handlers) = bus.handlers.get_mut(&topic)
            {
                handlers.retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    /// Dispatches an event to its topic's handlers, synchronously and in
    /// registration order.
    pub fn emit(&self, event: Event) {
        // Clone the handler list out of the map so handlers can subscribe,
        // unsubscribe, or emit again without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .get(event.topic())
            .map(|entry| entry.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        debug!(topic = event.topic(), handlers = handlers.len(), "emit");
        for handler in handlers {
            handler(&event);
        }
    }

    /// Number of handlers currently registered on a topic.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers.get(topic).map(|entry| entry.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Event) + Send + Sync + Clone) {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        (seen, move |event: &Event| {
            sink.lock().expect("lock").push(event.topic().to_owned());
        })
    }

    #[test]
    fn test_emit_reaches_topic_handlers_only() {
        let bus = Arc::new(EventBus::new());
        let (seen, record) = recorder();
        bus.subscribe(topic::REFETCH_ALL, record.clone());
        bus.subscribe(topic::INVALIDATE, record);

        bus.emit(Event::RefetchAll);
        assert_eq!(seen.lock().expect("lock").as_slice(), ["refetchAll"]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let (seen, record) = recorder();
        let subscription = bus.subscribe(topic::REFETCH_ALL, record);

        subscription.unsubscribe();
        subscription.unsubscribe();
        bus.emit(Event::RefetchAll);
        assert!(seen.lock().expect("lock").is_empty());
        assert_eq!(bus.handler_count(topic::REFETCH_ALL), 0);
    }

    #[test]
    fn test_handlers_fire_in_registration_order() {
        let bus = Arc::new(EventBus::new());
        let order: Arc<Mutex<Vec<u8>>> = Arc::default();
        for tag in 0u8..3 {
            let order = Arc::clone(&order);
            bus.subscribe(topic::FOCUS, move |_| order.lock().expect("lock").push(tag));
        }
        bus.emit(Event::WindowFocus);
        assert_eq!(order.lock().expect("lock").as_slice(), [0, 1, 2]);
    }

    #[test]
    fn test_reentrant_emit_from_handler() {
        let bus = Arc::new(EventBus::new());
        let (seen, record) = recorder();
        bus.subscribe(topic::REFETCH, record);

        let inner_bus = Arc::clone(&bus);
        bus.subscribe(topic::INVALIDATE, move |_| {
            inner_bus.emit(Event::Refetch(RefetchEvent {
                query_key: QueryKey::from_raw("k"),
                reason: RefetchReason::Invalidate,
            }));
        });

        bus.emit(Event::Invalidate(vec![SmolStr::new("posts")]));
        assert_eq!(seen.lock().expect("lock").as_slice(), ["refetch"]);
    }

    #[test]
    fn test_custom_topic() {
        let bus = Arc::new(EventBus::new());
        let (seen, record) = recorder();
        bus.subscribe("devtools", record);
        bus.emit(Event::Custom {
            topic: SmolStr::new("devtools"),
            payload: serde_json::json!({"op": "snapshot"}),
        });
        assert_eq!(seen.lock().expect("lock").as_slice(), ["devtools"]);
    }
}
