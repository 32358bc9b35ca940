//! Application state store.
//!
//! A single [`AppState`] value is the source of truth for everything a
//! front end renders. Updates are shallow merges ([`StateUpdate`]) followed
//! by a synchronous notification of every subscriber, in subscription order,
//! with the full new snapshot. Chat history is append-only and can only
//! grow through [`StateStore::add_chat_message`].

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::listeners::{lock, ListenerRegistry, Subscription};
use crate::models::{ChatMessage, HealthStatus, Preferences, Role};
use crate::storage::Storage;

/// Storage key of the persisted [`Preferences`].
pub const PREFERENCES_KEY: &str = "userPreferences";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub filename: Option<String>,
    pub percent: u8,
    pub in_progress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppState {
    pub messages: Vec<ChatMessage>,
    pub current_topic: Option<String>,
    pub upload: UploadProgress,
    pub is_loading: bool,
    pub health: Option<HealthStatus>,
    pub preferences: Preferences,
}

/// Partial update: `None` fields leave the current value untouched.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub current_topic: Option<Option<String>>,
    pub upload: Option<UploadProgress>,
    pub is_loading: Option<bool>,
    pub health: Option<HealthStatus>,
    pub preferences: Option<Preferences>,
}

impl StateUpdate {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.current_topic = Some(Some(topic.into()));
        self
    }

    pub fn upload(mut self, upload: UploadProgress) -> Self {
        self.upload = Some(upload);
        self
    }

    pub fn loading(mut self, loading: bool) -> Self {
        self.is_loading = Some(loading);
        self
    }

    pub fn health(mut self, health: HealthStatus) -> Self {
        self.health = Some(health);
        self
    }

    pub fn preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = Some(preferences);
        self
    }

    fn apply(self, state: &mut AppState) {
        if let Some(topic) = self.current_topic {
            state.current_topic = topic;
        }
        if let Some(upload) = self.upload {
            state.upload = upload;
        }
        if let Some(loading) = self.is_loading {
            state.is_loading = loading;
        }
        if let Some(health) = self.health {
            state.health = Some(health);
        }
        if let Some(preferences) = self.preferences {
            state.preferences = preferences;
        }
    }
}

pub type StateListener = dyn Fn(&AppState) + Send + Sync;

struct Inner {
    state: AppState,
    last_message_id: u64,
}

pub struct StateStore {
    inner: Mutex<Inner>,
    subscribers: ListenerRegistry<(), StateListener>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(Preferences::default())
    }
}

impl StateStore {
    pub fn new(preferences: Preferences) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: AppState {
                    preferences,
                    ..AppState::default()
                },
                last_message_id: 0,
            }),
            subscribers: ListenerRegistry::new(),
        }
    }

    /// Build a store with preferences read from `storage`. Missing or
    /// unreadable preferences fall back to defaults.
    pub async fn load(storage: &Storage) -> Self {
        let preferences = storage
            .get_or(PREFERENCES_KEY, Preferences::default())
            .await;
        Self::new(preferences)
    }

    pub async fn save_preferences(&self, storage: &Storage) -> anyhow::Result<()> {
        let preferences = self.snapshot().preferences;
        storage.set(PREFERENCES_KEY, &preferences).await
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AppState) + Send + Sync + 'static,
    {
        self.subscribers.add((), Arc::new(callback), false)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.total()
    }

    pub fn snapshot(&self) -> AppState {
        lock(&self.inner).state.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.inner).state.messages.clone()
    }

    /// Merge `update`, then notify subscribers. Returns the new snapshot.
    pub fn set_state(&self, update: StateUpdate) -> AppState {
        let snapshot = {
            let mut inner = lock(&self.inner);
            update.apply(&mut inner.state);
            inner.state.clone()
        };
        self.notify(&snapshot);
        snapshot
    }

    pub fn add_chat_message(&self, role: Role, content: impl Into<String>) -> ChatMessage {
        let (message, snapshot) = {
            let mut inner = lock(&self.inner);
            let now = Utc::now();
            let millis = now.timestamp_millis().max(0) as u64;
            let id = if millis > inner.last_message_id {
                millis
            } else {
                inner.last_message_id + 1
            };
            inner.last_message_id = id;

            let message = ChatMessage {
                id,
                role,
                content: content.into(),
                created_at: now,
            };
            inner.state.messages.push(message.clone());
            (message, inner.state.clone())
        };
        self.notify(&snapshot);
        message
    }

    fn notify(&self, snapshot: &AppState) {
        for subscriber in self.subscribers.snapshot(&()) {
            subscriber(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Theme;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn merge_applies_before_notification() {
        let store = StateStore::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = store.subscribe(move |state| {
            s.lock()
                .unwrap()
                .push((state.current_topic.clone(), state.is_loading));
        });

        store.set_state(StateUpdate::default().topic("sound").loading(true));
        store.set_state(StateUpdate::default().loading(false));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Some("sound".to_string()), true),
                (Some("sound".to_string()), false)
            ]
        );
    }

    #[test]
    fn subscribers_run_in_order() {
        let store = StateStore::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let o = order.clone();
            let _ = store.subscribe(move |_| o.lock().unwrap().push(i));
        }
        store.set_state(StateUpdate::default().loading(true));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_inside_notification() {
        let store = Arc::new(StateStore::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let c = calls.clone();
        let s = slot.clone();
        let sub = store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = s.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        let later = Arc::new(AtomicUsize::new(0));
        let l = later.clone();
        let _keep = store.subscribe(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });

        store.set_state(StateUpdate::default().loading(true));
        store.set_state(StateUpdate::default().loading(false));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(later.load(Ordering::SeqCst), 2);
        assert_eq!(store.subscriber_count(), 1);
    }

    #[test]
    fn subscribe_inside_notification_takes_effect_next_time() {
        let store = Arc::new(StateStore::default());
        let added = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&store);
        let a = added.clone();
        let _sub = store.subscribe(move |_| {
            if let Some(store) = weak.upgrade() {
                let a = a.clone();
                let _ = store.subscribe(move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        store.set_state(StateUpdate::default().loading(true));
        assert_eq!(added.load(Ordering::SeqCst), 0);
        assert_eq!(store.subscriber_count(), 2);
    }

    #[test]
    fn chat_messages_append_with_increasing_ids() {
        let store = StateStore::default();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let _sub = store.subscribe(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        let mut last = 0;
        for i in 0..20 {
            let msg = store.add_chat_message(Role::User, format!("q{}", i));
            assert!(msg.id > last);
            last = msg.id;
        }
        let messages = store.messages();
        assert_eq!(messages.len(), 20);
        assert_eq!(messages[0].content, "q0");
        assert_eq!(messages[19].content, "q19");
        assert_eq!(notified.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn preferences_load_defaults_on_corruption() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Storage::open_path(&tmp.path().join("s.sqlite"), "ai_tutor", Duration::ZERO)
            .await
            .unwrap();

        storage
            .set(PREFERENCES_KEY, &serde_json::json!({"theme": 42}))
            .await
            .unwrap();
        let store = StateStore::load(&storage).await;
        assert_eq!(store.snapshot().preferences, Preferences::default());

        let dark = Preferences {
            theme: Theme::Dark,
            auto_scroll: false,
            notifications_enabled: true,
        };
        store.set_state(StateUpdate::default().preferences(dark.clone()));
        store.save_preferences(&storage).await.unwrap();

        let reloaded = StateStore::load(&storage).await;
        assert_eq!(reloaded.snapshot().preferences, dark);
    }
}
