//! # AI Tutor
//!
//! Client for a retrieval-augmented AI tutor backend.
//!
//! The backend ingests a PDF, indexes it, and answers questions with grounded
//! text plus a diagram image. This crate is the client side: a typed HTTP
//! client, local preference storage, and the in-process plumbing (state
//! store, event bus, error handler, telemetry batcher) a chat front end is
//! built from. The `tutor` binary is a terminal front end over the same
//! library.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────┐
//! │   CLI    │──▶│  Services    │──▶│ ApiClient  │──▶ backend (HTTP)
//! │ (tutor)  │   │ (controller) │   └────────────┘
//! └──────────┘   └──────┬───────┘
//!        ▲              │
//!        │      ┌───────┼───────────┬──────────────┐
//!        │      ▼       ▼           ▼              ▼
//!        │ ┌─────────┐ ┌─────────┐ ┌────────────┐ ┌───────────┐
//!        └─│StateStore│ │EventBus │ │ErrorHandler│ │ Analytics │
//!          └─────────┘ └─────────┘ └────────────┘ └───────────┘
//!                │
//!                ▼
//!           ┌─────────┐
//!           │ Storage │ (SQLite kv)
//!           └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tutor init                                   # create the local store
//! tutor health                                 # healthy / degraded / unreachable
//! tutor upload ./Sound.pdf                     # index a document
//! tutor ask "How does a bell produce sound?"   # one question
//! tutor chat                                   # interactive session
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed API errors and error kinds |
//! | [`api`] | HTTP client for the backend |
//! | [`retry`] | Caller-side fixed-delay retry |
//! | [`storage`] | Namespaced key-value persistence |
//! | [`event_bus`] | Publish/subscribe with bounded history |
//! | [`state`] | Application state store |
//! | [`error_handler`] | Error log, user messages, supervisor |
//! | [`analytics`] | Batched telemetry |
//! | [`controller`] | Service wiring and user actions |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analytics;
pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod error_handler;
pub mod event_bus;
pub mod history;
pub mod listeners;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod retry;
pub mod state;
pub mod storage;
