//! Best-effort usage telemetry.
//!
//! Events are buffered in memory and delivered in batches through an
//! [`AnalyticsSink`]: in a background task once `batch_size` events
//! accumulate, on a fixed interval ([`spawn_flush_loop`]), and once more at
//! exit ([`Analytics::shutdown`]). [`Analytics::track`] never waits on the
//! sink. Flushes run one at a time.
//!
//! Delivery is at-least-once. A failed batch is put back in front of any
//! events tracked while it was in flight, so order is preserved and nothing
//! is dropped, except that the buffer is capped at `max_buffered_events`
//! and the oldest events are discarded beyond that. Nothing here ever
//! returns an error to the caller.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{user_agent, ApiClient};
use crate::config::AnalyticsConfig;
use crate::listeners::lock;
use crate::models::{AnalyticsEvent, AnalyticsEventType};

/// Destination for flushed batches.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn deliver(&self, events: &[AnalyticsEvent]) -> anyhow::Result<()>;
}

/// Posts batches to `POST /analytics/events`.
pub struct HttpSink {
    client: ApiClient,
}

impl HttpSink {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnalyticsSink for HttpSink {
    async fn deliver(&self, events: &[AnalyticsEvent]) -> anyhow::Result<()> {
        self.client.post_analytics(events).await?;
        Ok(())
    }
}

pub struct Analytics {
    session_id: Uuid,
    url: String,
    user_agent: String,
    enabled: bool,
    batch_size: usize,
    max_buffered: usize,
    buffer: Mutex<Vec<AnalyticsEvent>>,
    /// Held for the whole of a flush, so batches leave in order.
    flush_gate: tokio::sync::Mutex<()>,
    flush_scheduled: AtomicBool,
    sink: Arc<dyn AnalyticsSink>,
}

impl Analytics {
    /// `url` is recorded on every event as its ambient location (the
    /// backend base URL for this client).
    pub fn new(
        config: &AnalyticsConfig,
        session_id: Uuid,
        url: impl Into<String>,
        sink: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Self {
            session_id,
            url: url.into(),
            user_agent: user_agent(),
            enabled: config.enabled,
            batch_size: config.batch_size.max(1),
            max_buffered: config.max_buffered_events,
            buffer: Mutex::new(Vec::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            flush_scheduled: AtomicBool::new(false),
            sink,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn pending(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Buffer one event. A full batch schedules a background flush.
    ///
    /// Non-object `data` is wrapped as `{"value": data}`; `null` becomes an
    /// empty payload. Outside a tokio runtime the batch waits for the next
    /// timer tick or [`Analytics::shutdown`].
    pub fn track(self: &Arc<Self>, event_type: AnalyticsEventType, data: Value) {
        if !self.enabled {
            return;
        }
        let payload = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let event = AnalyticsEvent {
            event_type,
            timestamp: Utc::now(),
            session_id: self.session_id,
            payload,
            url: self.url.clone(),
            user_agent: self.user_agent.clone(),
        };

        let full = {
            let mut buffer = lock(&self.buffer);
            buffer.push(event);
            self.enforce_cap(&mut buffer);
            buffer.len() >= self.batch_size
        };
        if full {
            self.schedule_flush();
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        runtime.spawn(async move {
            this.flush().await;
        });
    }

    /// Attempt one delivery of everything buffered.
    ///
    /// Returns the number of events delivered (0 on failure or when empty).
    pub async fn flush(&self) -> usize {
        let _gate = self.flush_gate.lock().await;
        self.flush_scheduled.store(false, Ordering::Release);
        let batch = std::mem::take(&mut *lock(&self.buffer));
        if batch.is_empty() {
            return 0;
        }

        match self.sink.deliver(&batch).await {
            Ok(()) => {
                tracing::debug!(events = batch.len(), "analytics batch delivered");
                batch.len()
            }
            Err(e) => {
                tracing::debug!(events = batch.len(), error = %e, "analytics delivery failed, re-queueing");
                let mut buffer = lock(&self.buffer);
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                self.enforce_cap(&mut buffer);
                0
            }
        }
    }

    fn enforce_cap(&self, buffer: &mut Vec<AnalyticsEvent>) {
        if self.max_buffered > 0 && buffer.len() > self.max_buffered {
            let excess = buffer.len() - self.max_buffered;
            buffer.drain(..excess);
            tracing::warn!(dropped = excess, "analytics buffer full, dropped oldest events");
        }
    }

    /// Final best-effort flush, after any in-flight one; returns how many
    /// events remain undelivered.
    pub async fn shutdown(&self) -> usize {
        self.flush().await;
        self.pending()
    }
}

/// Flush `analytics` every `every`, independent of batch size. The first
/// flush happens one full interval after spawning.
pub fn spawn_flush_loop(analytics: Arc<Analytics>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            analytics.flush().await;
        }
    })
}
