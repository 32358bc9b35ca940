//! Headless UI controller.
//!
//! [`Services`] is built once per process and owns one instance of every
//! service (storage, event bus, error handler, analytics, state store, API
//! client). Front ends (the `tutor` CLI, or an embedding GUI) drive user
//! actions through it and render from the state store and event bus.
//!
//! ```text
//! input ──▶ Services::ask ──▶ ApiClient ──▶ StateStore ──▶ subscribers
//!                 │                              │
//!                 ├──▶ Analytics                 └──▶ EventBus ──▶ listeners
//!                 └──▶ ErrorHandler (on failure)
//! ```

use anyhow::Result;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::analytics::{spawn_flush_loop, Analytics, AnalyticsSink, HttpSink};
use crate::api::ApiClient;
use crate::config::Config;
use crate::error::ApiError;
use crate::error_handler::{ErrorHandler, MessageOptions};
use crate::event_bus::{BusEvent, EventBus};
use crate::models::{
    AnalyticsEventType, ChatMessage, ChatResponse, HealthStatus, Preferences, Role, Theme,
    UploadResult,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::{StateStore, StateUpdate, UploadProgress};
use crate::storage::Storage;

pub struct Services {
    pub config: Config,
    pub session_id: Uuid,
    pub storage: Storage,
    pub bus: Arc<EventBus>,
    pub errors: Arc<ErrorHandler>,
    pub analytics: Arc<Analytics>,
    pub state: StateStore,
    pub api: ApiClient,
    retry: RetryPolicy,
    flush_task: Option<JoinHandle<()>>,
}

/// Answer to one question, as rendered by a front end.
#[derive(Debug, Clone)]
pub struct Answer {
    pub message: ChatMessage,
    pub response: ChatResponse,
}

impl Services {
    /// Build every service, delivering analytics to the backend.
    pub async fn start(config: Config) -> Result<Self> {
        let api = ApiClient::new(&config)?;
        let sink = Arc::new(HttpSink::new(api.clone()));
        Self::start_with_sink(config, sink).await
    }

    pub async fn start_with_sink(config: Config, sink: Arc<dyn AnalyticsSink>) -> Result<Self> {
        let session_id = Uuid::new_v4();
        let api = ApiClient::new(&config)?;
        let storage = Storage::open(&config).await?;
        let bus = Arc::new(EventBus::new());
        let errors = Arc::new(ErrorHandler::with_bus(bus.clone()));
        let analytics = Arc::new(Analytics::new(
            &config.analytics,
            session_id,
            api.base_url(),
            sink,
        ));
        let state = StateStore::load(&storage).await;
        let retry = RetryPolicy::from_config(&config.api);

        tracing::debug!(%session_id, base_url = api.base_url(), "services started");
        analytics
            .track(AnalyticsEventType::SessionStart, json!({}));

        Ok(Self {
            config,
            session_id,
            storage,
            bus,
            errors,
            analytics,
            state,
            api,
            retry,
            flush_task: None,
        })
    }

    /// Start the periodic analytics flush (`[analytics].flush_interval_secs`).
    /// Long-lived front ends call this; one-shot commands rely on shutdown.
    pub fn start_flush_timer(&mut self) {
        if self.flush_task.is_none() && self.config.analytics.enabled {
            let every = Duration::from_secs(self.config.analytics.flush_interval_secs.max(1));
            self.flush_task = Some(spawn_flush_loop(self.analytics.clone(), every));
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn user_message(&self, error: &anyhow::Error) -> String {
        self.errors.user_message(error, MessageOptions::default())
    }

    fn fail(&self, error: ApiError, context: &str) -> anyhow::Error {
        let error = anyhow::Error::new(error);
        self.errors.handle(&error, context);
        error
    }

    pub async fn upload(&self, path: &Path) -> Result<UploadResult> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.state.set_state(
            StateUpdate::default()
                .loading(true)
                .upload(UploadProgress {
                    filename: Some(filename.clone()),
                    percent: 0,
                    in_progress: true,
                }),
        );
        self.bus
            .emit(BusEvent::UploadStarted, json!({ "filename": filename }));

        let result = with_retry(self.retry, "upload", || self.api.upload_document(path)).await;

        match result {
            Ok(upload) => {
                self.state.set_state(
                    StateUpdate::default()
                        .topic(upload.topic_id.clone())
                        .loading(false)
                        .upload(UploadProgress {
                            filename: Some(upload.filename.clone()),
                            percent: 100,
                            in_progress: false,
                        }),
                );
                self.state
                    .add_chat_message(Role::System, welcome_message(&upload));
                self.bus.emit(
                    BusEvent::UploadCompleted,
                    serde_json::to_value(&upload).unwrap_or_default(),
                );
                self.analytics
                    .track(
                        AnalyticsEventType::FileUploaded,
                        json!({ "filename": upload.filename, "chunks": upload.chunk_count }),
                    );
                Ok(upload)
            }
            Err(e) => {
                self.state.set_state(
                    StateUpdate::default()
                        .loading(false)
                        .upload(UploadProgress::default()),
                );
                let kind = e.kind();
                let error = self.fail(e, "upload");
                self.bus.emit(
                    BusEvent::UploadFailed,
                    json!({ "filename": filename, "message": self.user_message(&error) }),
                );
                self.analytics
                    .track(
                        AnalyticsEventType::Error,
                        json!({ "context": "upload", "kind": kind }),
                    );
                Err(error)
            }
        }
    }

    /// Ask about the current topic (or the configured default topic).
    pub async fn ask(&self, question: &str) -> Result<Answer> {
        let topic = self
            .state
            .snapshot()
            .current_topic
            .unwrap_or_else(|| self.config.chat.default_topic.clone());
        self.ask_topic(question, &topic).await
    }

    pub async fn ask_topic(&self, question: &str, topic: &str) -> Result<Answer> {
        if let Err(e) = self.api.validate_question(question) {
            return Err(self.fail(e, "chat"));
        }

        let sent = self.state.add_chat_message(Role::User, question.trim());
        self.bus.emit(
            BusEvent::ChatMessageSent,
            json!({ "id": sent.id, "topic_id": topic }),
        );
        self.analytics
            .track(
                AnalyticsEventType::QuestionAsked,
                json!({ "topic_id": topic, "length": question.chars().count() }),
            );
        self.state.set_state(StateUpdate::default().loading(true));

        let result = with_retry(self.retry, "chat", || {
            self.api.send_question(question, topic)
        })
        .await;
        self.state.set_state(StateUpdate::default().loading(false));

        match result {
            Ok(response) => {
                let message = self
                    .state
                    .add_chat_message(Role::Assistant, response.answer.clone());
                self.bus.emit(
                    BusEvent::ChatMessageReceived,
                    json!({
                        "id": message.id,
                        "answer": response.answer,
                        "image": response.image,
                    }),
                );
                self.analytics
                    .track(
                        AnalyticsEventType::AnswerReceived,
                        json!({
                            "topic_id": topic,
                            "has_image": response.image.is_some(),
                            "context_chunks": response.context_chunks.len(),
                        }),
                    );
                Ok(Answer { message, response })
            }
            Err(e) => {
                let kind = e.kind();
                let error = self.fail(e, "chat");
                self.analytics
                    .track(
                        AnalyticsEventType::Error,
                        json!({ "context": "chat", "kind": kind }),
                    );
                Err(error)
            }
        }
    }

    /// Refresh the health indicator; emits `HealthChanged` on transitions.
    pub async fn check_health(&self) -> HealthStatus {
        let status = self.api.get_health().await;
        let previous = self.state.snapshot().health;
        self.state.set_state(StateUpdate::default().health(status));
        if previous != Some(status) {
            self.bus.emit(
                BusEvent::HealthChanged,
                json!({ "status": status, "previous": previous }),
            );
        }
        status
    }

    pub async fn set_preferences(&self, preferences: Preferences) -> Result<()> {
        let previous_theme = self.state.snapshot().preferences.theme;
        let theme = preferences.theme;
        self.state
            .set_state(StateUpdate::default().preferences(preferences));
        self.state.save_preferences(&self.storage).await?;
        if theme != previous_theme {
            self.announce_theme(theme);
        }
        Ok(())
    }

    pub async fn set_theme(&self, theme: Theme) -> Result<()> {
        let mut preferences = self.state.snapshot().preferences;
        preferences.theme = theme;
        self.set_preferences(preferences).await
    }

    fn announce_theme(&self, theme: Theme) {
        self.bus
            .emit(BusEvent::ThemeChanged, json!({ "theme": theme }));
        self.analytics
            .track(AnalyticsEventType::ThemeChanged, json!({ "theme": theme }));
    }

    /// Exit hook: final analytics flush and preference save.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
        self.analytics
            .track(AnalyticsEventType::SessionEnd, json!({}));
        let left = self.analytics.shutdown().await;
        if left > 0 {
            tracing::debug!(undelivered = left, "analytics events not delivered at exit");
        }
        if let Err(e) = self.state.save_preferences(&self.storage).await {
            self.errors.handle(&e, "shutdown");
        }
        self.storage.close().await;
    }
}

pub fn welcome_message(upload: &UploadResult) -> String {
    format!(
        "Processed {} into {} chunks. Ask me anything about it!",
        upload.filename, upload.chunk_count
    )
}
