//! Core data models shared by the client, state store, and CLI.
//!
//! Wire types mirror the backend's JSON field names via `serde(rename)`;
//! unknown fields in responses are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single entry in the chat history. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Millisecond timestamp, strictly increasing within a session.
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful `POST /upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub topic_id: String,
    #[serde(rename = "chunks_created")]
    pub chunk_count: u64,
    pub filename: String,
}

/// Diagram metadata attached to an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Response of `POST /chat`. Held only while rendering one answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    #[serde(default)]
    pub image: Option<ImageRef>,
    #[serde(default)]
    pub context_chunks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        }
    }
}

/// An uploaded file as reported by `GET /files`.
///
/// The backend may list plain filenames or objects; both deserialize here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FileEntryWire")]
pub struct FileEntry {
    pub filename: String,
    pub size_bytes: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileEntryWire {
    Name(String),
    Object {
        #[serde(alias = "name")]
        filename: String,
        #[serde(default, alias = "size")]
        size_bytes: Option<u64>,
    },
}

impl From<FileEntryWire> for FileEntry {
    fn from(wire: FileEntryWire) -> Self {
        match wire {
            FileEntryWire::Name(filename) => FileEntry {
                filename,
                size_bytes: None,
            },
            FileEntryWire::Object {
                filename,
                size_bytes,
            } => FileEntry {
                filename,
                size_bytes,
            },
        }
    }
}

/// Diagram catalogue for a topic (`GET /images/{topic_id}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCatalog {
    pub topic_id: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub count: usize,
}

/// Service banner returned by `GET /`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub endpoints: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    SessionStart,
    FileUploaded,
    QuestionAsked,
    AnswerReceived,
    ThemeChanged,
    Error,
    SessionEnd,
}

/// One buffered telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    #[serde(rename = "type")]
    pub event_type: AnalyticsEventType,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub payload: Map<String, Value>,
    pub url: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub context: String,
    pub message: String,
    /// Cause chain, outermost first.
    pub stack: Vec<String>,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub theme: Theme,
    pub auto_scroll: bool,
    pub notifications_enabled: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            auto_scroll: true,
            notifications_enabled: true,
        }
    }
}
