//! Central sink for handled and unhandled errors.
//!
//! [`ErrorHandler::handle`] normalizes an error into an [`ErrorLogEntry`],
//! keeps it in a bounded rolling log, and reports it via `tracing`. When
//! attached to an [`EventBus`] it also emits [`BusEvent::ErrorRaised`] with
//! the user-facing message so a front end can show a notification.
//!
//! Failures nobody handles reach the handler through the supervisor
//! functions: [`supervise`] for the entry point, [`spawn_supervised`] for
//! background tasks, and [`install_panic_hook`] for panics.

use chrono::Utc;
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{ApiError, ErrorKind};
use crate::event_bus::{panic_message, BusEvent, EventBus};
use crate::history::RingBuffer;
use crate::listeners::lock;
use crate::models::ErrorLogEntry;

/// Number of entries kept in the rolling error log.
pub const LOG_CAPACITY: usize = 100;

pub mod messages {
    pub const RATE_LIMITED: &str = "Too many requests. Please wait a moment and try again.";
    pub const UNAUTHORIZED: &str = "You are not authorized to perform this action.";
    pub const SERVER_ERROR: &str = "The server encountered an error. Please try again later.";
    pub const TIMEOUT: &str =
        "The request took too long. Please check your connection and try again.";
    pub const NETWORK: &str =
        "Unable to reach the tutor service. Please check that the backend is running.";
    pub const GENERIC: &str = "Something went wrong. Please try again.";
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageOptions {
    /// Overrides the status carried by the error itself.
    pub status_code: Option<u16>,
}

impl MessageOptions {
    pub fn status(code: u16) -> Self {
        Self {
            status_code: Some(code),
        }
    }
}

/// Map an error to a fixed, human-readable message.
///
/// Precedence: HTTP status (explicit option first, then the error's own),
/// then the error kind, then the error's own message, then a generic
/// fallback.
pub fn user_message(error: &anyhow::Error, options: MessageOptions) -> String {
    let api = error.downcast_ref::<ApiError>();
    let status = options.status_code.or_else(|| api.and_then(ApiError::status));

    if let Some(status) = status {
        match status {
            429 => return messages::RATE_LIMITED.to_string(),
            401 | 403 => return messages::UNAUTHORIZED.to_string(),
            s if s >= 500 => return messages::SERVER_ERROR.to_string(),
            _ => {}
        }
    }

    let kind = api.map(ApiError::kind).unwrap_or(ErrorKind::Unknown);
    if let Some(msg) = kind_message(kind) {
        return msg.to_string();
    }

    let own = match api {
        Some(api) => api.to_string(),
        None => error.to_string(),
    };
    if own.trim().is_empty() {
        messages::GENERIC.to_string()
    } else {
        own
    }
}

/// Fixed text for kinds whose own message is not fit for users. Validation
/// and not-found errors already describe the problem and fall through.
fn kind_message(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::Timeout => Some(messages::TIMEOUT),
        ErrorKind::Network => Some(messages::NETWORK),
        ErrorKind::Http | ErrorKind::Validation | ErrorKind::Unknown => None,
    }
}

pub struct ErrorHandler {
    log: Mutex<RingBuffer<ErrorLogEntry>>,
    bus: Option<Arc<EventBus>>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(RingBuffer::new(LOG_CAPACITY)),
            bus: None,
        }
    }

    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new()
        }
    }

    /// Log `error` under `context` and return the recorded entry.
    pub fn handle(&self, error: &anyhow::Error, context: &str) -> ErrorLogEntry {
        let kind = crate::error::classify(error);
        let stack: Vec<String> = error.chain().skip(1).map(|c| c.to_string()).collect();
        let entry = ErrorLogEntry {
            timestamp: Utc::now(),
            context: context.to_string(),
            message: error.to_string(),
            stack,
            kind,
        };
        tracing::error!(context, kind = %kind, error = %format!("{:#}", error), "handled error");
        self.record(entry.clone());

        if let Some(bus) = &self.bus {
            bus.emit(
                BusEvent::ErrorRaised,
                json!({
                    "context": context,
                    "kind": kind,
                    "message": user_message(error, MessageOptions::default()),
                }),
            );
        }
        entry
    }

    /// Record a panic. Does not emit on the bus, since this runs inside the
    /// panic hook where a panicking listener would abort the process.
    pub fn handle_panic(&self, context: &str, message: &str, location: Option<String>) -> ErrorLogEntry {
        let entry = ErrorLogEntry {
            timestamp: Utc::now(),
            context: context.to_string(),
            message: message.to_string(),
            stack: location.into_iter().collect(),
            kind: ErrorKind::Unknown,
        };
        self.record(entry.clone());
        entry
    }

    fn record(&self, entry: ErrorLogEntry) {
        lock(&self.log).push(entry);
    }

    pub fn user_message(&self, error: &anyhow::Error, options: MessageOptions) -> String {
        user_message(error, options)
    }

    /// Logged entries, oldest first.
    pub fn entries(&self) -> Vec<ErrorLogEntry> {
        lock(&self.log).to_vec()
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
    }
}

/// Route panics on any thread into `handler`, then run the previous hook.
pub fn install_panic_hook(handler: Arc<ErrorHandler>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = panic_message(info.payload());
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
        handler.handle_panic("panic", message, location);
        previous(info);
    }));
}

/// Run the application entry point, logging any error it returns.
///
/// The error is handed back so the caller can render it.
pub async fn supervise<F, T>(handler: &ErrorHandler, context: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match fut.await {
        Ok(v) => Ok(v),
        Err(e) => {
            handler.handle(&e, context);
            Err(e)
        }
    }
}

/// Spawn a task whose error or panic is routed to `handler` instead of
/// being silently dropped with its `JoinHandle`.
///
/// The returned handle resolves to `None` if the task failed, panicked, or
/// was cancelled.
pub fn spawn_supervised<F, T>(
    handler: Arc<ErrorHandler>,
    context: impl Into<String>,
    fut: F,
) -> JoinHandle<Option<T>>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let context = context.into();
    let task = tokio::spawn(fut);
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                handler.handle(&e, &context);
                None
            }
            Err(join) if join.is_panic() => {
                let panic = join.into_panic();
                handler.handle_panic(&context, panic_message(panic.as_ref()), None);
                None
            }
            Err(_) => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn api(e: ApiError) -> anyhow::Error {
        anyhow::Error::new(e)
    }

    #[test]
    fn status_option_wins_over_kind() {
        for err in [
            api(ApiError::Timeout {
                after: Duration::from_secs(1),
            }),
            api(ApiError::Network("refused".into())),
            api(ApiError::Validation("bad".into())),
            api(ApiError::Chat { status: 500 }),
            anyhow::anyhow!("plain"),
        ] {
            assert_eq!(
                user_message(&err, MessageOptions::status(429)),
                messages::RATE_LIMITED
            );
        }
    }

    #[test]
    fn status_from_error() {
        let err = api(ApiError::Chat { status: 503 });
        assert_eq!(user_message(&err, MessageOptions::default()), messages::SERVER_ERROR);
        let err = api(ApiError::Request {
            status: 401,
            message: "nope".into(),
        });
        assert_eq!(user_message(&err, MessageOptions::default()), messages::UNAUTHORIZED);
        let err = anyhow::anyhow!("whatever");
        assert_eq!(user_message(&err, MessageOptions::status(403)), messages::UNAUTHORIZED);
    }

    #[test]
    fn kind_then_own_message_then_generic() {
        let timeout = api(ApiError::Timeout {
            after: Duration::from_secs(60),
        });
        assert_eq!(user_message(&timeout, MessageOptions::default()), messages::TIMEOUT);

        let network = api(ApiError::Network("connection refused".into()));
        assert_eq!(user_message(&network, MessageOptions::default()), messages::NETWORK);

        let validation = api(ApiError::Validation("File too large (max 50MB)".into()));
        assert_eq!(
            user_message(&validation, MessageOptions::default()),
            "File too large (max 50MB)"
        );

        let with_context = api(ApiError::Validation("Only .pdf files are allowed".into()))
            .context("uploading notes.txt");
        assert_eq!(
            user_message(&with_context, MessageOptions::default()),
            "Only .pdf files are allowed"
        );

        let missing = api(ApiError::NotFound {
            resource: "Missing.pdf".into(),
        });
        assert_eq!(
            user_message(&missing, MessageOptions::default()),
            "not found: Missing.pdf"
        );

        let blank = anyhow::anyhow!("  ");
        assert_eq!(user_message(&blank, MessageOptions::default()), messages::GENERIC);
    }

    #[test]
    fn handle_records_entry_with_chain() {
        let handler = ErrorHandler::new();
        let err = api(ApiError::Chat { status: 500 }).context("asking question");
        let entry = handler.handle(&err, "chat");
        assert_eq!(entry.context, "chat");
        assert_eq!(entry.kind, ErrorKind::Http);
        assert_eq!(entry.message, "asking question");
        assert_eq!(entry.stack, vec!["chat request failed with status 500"]);
        assert_eq!(handler.entries().len(), 1);
    }

    #[test]
    fn log_is_bounded_fifo() {
        let handler = ErrorHandler::new();
        for i in 0..(LOG_CAPACITY + 25) {
            handler.handle(&anyhow::anyhow!("error {}", i), "test");
        }
        let entries = handler.entries();
        assert_eq!(entries.len(), LOG_CAPACITY);
        assert_eq!(entries[0].message, "error 25");
        assert_eq!(entries[LOG_CAPACITY - 1].message, format!("error {}", LOG_CAPACITY + 24));
    }

    #[test]
    fn emits_user_message_on_bus() {
        let bus = Arc::new(EventBus::new());
        let handler = ErrorHandler::with_bus(bus.clone());
        handler.handle(&api(ApiError::Network("down".into())), "health");
        let history = bus.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, BusEvent::ErrorRaised);
        assert_eq!(history[0].data["message"], messages::NETWORK);
        assert_eq!(history[0].data["kind"], "network");
    }

    #[tokio::test]
    async fn supervise_logs_and_returns_error() {
        let handler = ErrorHandler::new();
        let result: anyhow::Result<()> =
            supervise(&handler, "main", async { anyhow::bail!("startup failed") }).await;
        assert!(result.is_err());
        assert_eq!(handler.entries()[0].context, "main");
    }

    #[tokio::test]
    async fn spawn_supervised_routes_task_errors() {
        let handler = Arc::new(ErrorHandler::new());

        let ok = spawn_supervised(handler.clone(), "ok-task", async { Ok(5) });
        assert_eq!(ok.await.unwrap(), Some(5));

        let failed = spawn_supervised(handler.clone(), "flush-loop", async {
            Err::<(), _>(anyhow::anyhow!("sink unavailable"))
        });
        assert_eq!(failed.await.unwrap(), None);

        let entries = handler.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].context, "flush-loop");
        assert_eq!(entries[0].message, "sink unavailable");
    }
}
