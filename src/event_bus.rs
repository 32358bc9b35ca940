//! In-process publish/subscribe for cross-cutting signals.
//!
//! The bus is independent of the state store: it carries notifications such
//! as upload progress or theme changes that are not necessarily state.
//!
//! # Delivery
//!
//! [`EventBus::emit`] is synchronous. Listeners for the event run in
//! subscription order against a snapshot of the listener list, and each call
//! is isolated: a listener that returns `Err` or panics is logged and the
//! remaining listeners still run. Every emission, including ones nobody
//! listens to, is recorded in a bounded history (oldest evicted first).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::history::RingBuffer;
use crate::listeners::{lock, ListenerRegistry, Subscription};

/// Default number of emissions kept in [`EventBus::history`].
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusEvent {
    UploadStarted,
    UploadProgress,
    UploadCompleted,
    UploadFailed,
    ChatMessageSent,
    ChatMessageReceived,
    ThemeChanged,
    HealthChanged,
    ErrorRaised,
    Custom(String),
}

impl BusEvent {
    pub fn name(&self) -> &str {
        match self {
            BusEvent::UploadStarted => "UPLOAD_STARTED",
            BusEvent::UploadProgress => "UPLOAD_PROGRESS",
            BusEvent::UploadCompleted => "UPLOAD_COMPLETED",
            BusEvent::UploadFailed => "UPLOAD_FAILED",
            BusEvent::ChatMessageSent => "CHAT_MESSAGE_SENT",
            BusEvent::ChatMessageReceived => "CHAT_MESSAGE_RECEIVED",
            BusEvent::ThemeChanged => "THEME_CHANGED",
            BusEvent::HealthChanged => "HEALTH_CHANGED",
            BusEvent::ErrorRaised => "ERROR_RAISED",
            BusEvent::Custom(name) => name,
        }
    }
}

impl fmt::Display for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for BusEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

/// One recorded emission.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event: BusEvent,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Listener signature. Returning `Err` is logged and does not stop dispatch.
pub type Listener = dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync;

pub struct EventBus {
    listeners: ListenerRegistry<BusEvent, Listener>,
    history: Mutex<RingBuffer<EventRecord>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            listeners: ListenerRegistry::new(),
            history: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    pub fn on<F>(&self, event: BusEvent, listener: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.add(event, Arc::new(listener), false)
    }

    /// Like [`on`](Self::on), but the listener is removed before its first
    /// delivery, so a re-entrant emit from inside it does not call it again.
    pub fn once<F>(&self, event: BusEvent, listener: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.add(event, Arc::new(listener), true)
    }

    /// Remove every listener for `event`, or every listener when `None`.
    pub fn off(&self, event: Option<&BusEvent>) {
        match event {
            Some(event) => self.listeners.remove_key(event),
            None => self.listeners.clear(),
        }
    }

    /// Deliver `data` to all current listeners of `event`.
    ///
    /// Returns the number of listeners that completed without error.
    pub fn emit(&self, event: BusEvent, data: Value) -> usize {
        lock(&self.history).push(EventRecord {
            event: event.clone(),
            data: data.clone(),
            timestamp: Utc::now(),
        });

        let listeners = self.listeners.snapshot(&event);
        tracing::trace!(event = %event, listeners = listeners.len(), "emit");

        let mut delivered = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&data))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(event = %event, error = %e, "event listener failed");
                }
                Err(panic) => {
                    tracing::warn!(
                        event = %event,
                        panic = panic_message(panic.as_ref()),
                        "event listener panicked"
                    );
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self, event: &BusEvent) -> usize {
        self.listeners.count(event)
    }

    /// Recorded emissions, oldest first.
    pub fn history(&self) -> Vec<EventRecord> {
        lock(&self.history).to_vec()
    }

    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            let _ = bus.on(BusEvent::UploadCompleted, move |_| {
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }
        assert_eq!(bus.emit(BusEvent::UploadCompleted, json!({})), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_listener_does_not_block_later_ones() {
        let bus = EventBus::new();
        let hits = counter();

        let _a = bus.on(BusEvent::ChatMessageReceived, |_| anyhow::bail!("listener broke"));
        let _b = bus.on(BusEvent::ChatMessageReceived, |_| panic!("listener exploded"));
        let h = hits.clone();
        let _c = bus.on(BusEvent::ChatMessageReceived, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let delivered = bus.emit(BusEvent::ChatMessageReceived, json!({"answer": "..."}));
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_fires_a_single_time_even_when_reentrant() {
        let bus = Arc::new(EventBus::new());
        let hits = counter();
        let h = hits.clone();
        let inner_bus = Arc::downgrade(&bus);
        let _s = bus.once(BusEvent::ThemeChanged, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(bus) = inner_bus.upgrade() {
                bus.emit(BusEvent::ThemeChanged, json!("dark"));
            }
            Ok(())
        });

        bus.emit(BusEvent::ThemeChanged, json!("light"));
        bus.emit(BusEvent::ThemeChanged, json!("light"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(&BusEvent::ThemeChanged), 0);
    }

    #[test]
    fn unsubscribe_from_inside_listener() {
        let bus = EventBus::new();
        let hits = counter();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let h = hits.clone();
        let s = slot.clone();
        let sub = bus.on(BusEvent::UploadProgress, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = s.lock().unwrap().take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(sub);

        let other = counter();
        let o = other.clone();
        let _keep = bus.on(BusEvent::UploadProgress, move |_| {
            o.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(BusEvent::UploadProgress, json!(10));
        bus.emit(BusEvent::UploadProgress, json!(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_by_type_and_all() {
        let bus = EventBus::new();
        let _a = bus.on(BusEvent::UploadStarted, |_| Ok(()));
        let _b = bus.on(BusEvent::UploadFailed, |_| Ok(()));
        bus.off(Some(&BusEvent::UploadStarted));
        assert_eq!(bus.listener_count(&BusEvent::UploadStarted), 0);
        assert_eq!(bus.listener_count(&BusEvent::UploadFailed), 1);
        bus.off(None);
        assert_eq!(bus.listener_count(&BusEvent::UploadFailed), 0);
    }

    #[test]
    fn history_records_without_listeners_and_is_bounded() {
        let bus = EventBus::new();
        for i in 0..150 {
            bus.emit(BusEvent::Custom("tick".into()), json!(i));
        }
        let history = bus.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].data, json!(50));
        assert_eq!(history[99].data, json!(149));
        assert_eq!(history[0].event.name(), "tick");
    }

    #[test]
    fn wire_names() {
        assert_eq!(BusEvent::ChatMessageReceived.name(), "CHAT_MESSAGE_RECEIVED");
        assert_eq!(
            serde_json::to_value(BusEvent::UploadCompleted).unwrap(),
            json!("UPLOAD_COMPLETED")
        );
    }
}
