//! Plugin event dispatch
//!
//! The lifecycle manager and loader announce every transition through an
//! [`EventDispatcher`]. Observers either subscribe to all events or to a
//! single [`EventKind`]; they are invoked synchronously, in subscription
//! order, on the task that performed the transition.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Kinds of events published by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Descriptor added to the registry
    Register,
    /// `initialize` hook succeeded
    Initialize,
    /// `start` hook succeeded
    Start,
    /// `stop` hook succeeded
    Stop,
    /// Loader finished loading a plugin
    Load,
    /// Plugin removed from the registry
    Unload,
    /// A lifecycle or load step failed
    Error,
    /// Any state change, with `from` and `to`
    State,
    /// Plugin settings replaced
    Config,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Register => "register",
            Self::Initialize => "initialize",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Load => "load",
            Self::Unload => "unload",
            Self::Error => "error",
            Self::State => "state",
            Self::Config => "config",
        };
        f.write_str(name)
    }
}

/// A single published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Unique event id
    pub id: Uuid,
    /// Event kind
    pub kind: EventKind,
    /// Plugin the event concerns
    pub plugin_id: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload
    pub data: Value,
}

/// Receives published events
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &PluginEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&PluginEvent) + Send + Sync,
{
    fn on_event(&self, event: &PluginEvent) {
        self(event);
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observers = Vec<(SubscriptionId, Arc<dyn EventObserver>)>;

/// Forwards events into an unbounded channel
struct ChannelObserver(mpsc::UnboundedSender<PluginEvent>);

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &PluginEvent) {
        // A dropped receiver just stops listening.
        let _ = self.0.send(event.clone());
    }
}

/// Observer registry and fan-out
#[derive(Default)]
pub struct EventDispatcher {
    all: RwLock<Observers>,
    scoped: RwLock<HashMap<EventKind, Observers>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Observe every event
    pub fn subscribe(&self, observer: impl EventObserver + 'static) -> SubscriptionId {
        let id = self.allocate_id();
        self.all.write().push((id, Arc::new(observer)));
        id
    }

    /// Observe events of one kind
    pub fn subscribe_to(
        &self,
        kind: EventKind,
        observer: impl EventObserver + 'static,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.scoped
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(observer)));
        id
    }

    /// Receive events through a channel, optionally filtered by kind
    pub fn channel(&self, kind: Option<EventKind>) -> mpsc::UnboundedReceiver<PluginEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match kind {
            Some(kind) => self.subscribe_to(kind, ChannelObserver(tx)),
            None => self.subscribe(ChannelObserver(tx)),
        };
        rx
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut all = self.all.write();
        let before = all.len();
        all.retain(|(sub, _)| *sub != id);
        if all.len() != before {
            return true;
        }
        drop(all);

        let mut scoped = self.scoped.write();
        for observers in scoped.values_mut() {
            let before = observers.len();
            observers.retain(|(sub, _)| *sub != id);
            if observers.len() != before {
                return true;
            }
        }
        false
    }

    /// Publish an event to matching observers
    pub fn emit(&self, kind: EventKind, plugin_id: &str, data: Value) {
        let event = PluginEvent {
            id: Uuid::new_v4(),
            kind,
            plugin_id: plugin_id.to_string(),
            timestamp: Utc::now(),
            data,
        };

        // Snapshot so observers may subscribe or unsubscribe re-entrantly.
        let mut targets: Vec<Arc<dyn EventObserver>> =
            self.all.read().iter().map(|(_, o)| Arc::clone(o)).collect();
        if let Some(scoped) = self.scoped.read().get(&kind) {
            targets.extend(scoped.iter().map(|(_, o)| Arc::clone(o)));
        }

        tracing::trace!(kind = %kind, plugin_id, observers = targets.len(), "emitting plugin event");
        for observer in targets {
            observer.on_event(&event);
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.all.read().len() + self.scoped.read().values().map(Vec::len).sum::<usize>()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn scoped_observers_only_see_their_kind() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.subscribe_to(EventKind::Start, move |event: &PluginEvent| {
            sink.lock().push(event.plugin_id.clone());
        });

        dispatcher.emit(EventKind::Register, "a", Value::Null);
        dispatcher.emit(EventKind::Start, "b", Value::Null);

        assert_eq!(*seen.lock(), vec!["b".to_string()]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = dispatcher.subscribe(move |_: &PluginEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(EventKind::Load, "a", Value::Null);
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.emit(EventKind::Load, "a", Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_receives_payload() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.channel(Some(EventKind::State));
        dispatcher.emit(EventKind::State, "a", json!({"from": "REGISTERED", "to": "INITIALIZED"}));

        let event = rx.recv().await.expect("event delivered");
        assert_eq!(event.kind, EventKind::State);
        assert_eq!(event.data["to"], "INITIALIZED");
    }
}
