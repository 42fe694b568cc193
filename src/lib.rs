//! Client-side synchronization engine for one-to-one tutor/student messaging.
//!
//! [`SyncEngine`] merges optimistic local sends, HTTP responses and WebSocket
//! pushes into one ordered, deduplicated message log per conversation, keeps the
//! tutor's unread directory current, and decides when messages count as read.

pub mod api;
pub mod config;
pub mod errors;
pub mod models;
pub mod service;
pub mod store;
pub mod transport;
pub mod wire;

pub use api::{ChatApi, HttpChatApi};
pub use config::{ClientConfig, ReadTrackingConfig};
pub use errors::SyncError;
pub use models::{Attachment, Identity, Message, MessageState, Role};
pub use service::{AlwaysVisible, EngineUpdate, SyncEngine, VisibilityProbe};
