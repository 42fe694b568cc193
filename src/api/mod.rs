pub mod http;

use async_trait::async_trait;

use crate::errors::SyncError;
use crate::models::{DirectorySnapshot, MessageId, MessageRecord, SendRequest, UserId};

pub use http::HttpChatApi;

/// The request/response endpoints the engine depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Groups with their students and unread counters.
    async fn list_groups(&self) -> Result<DirectorySnapshot, SyncError>;

    /// Backlog of the dialog with `counterpart`, oldest first.
    async fn fetch_dialog(&self, counterpart: UserId) -> Result<Vec<MessageRecord>, SyncError>;

    /// Returns the stored message, echoing the request's `client_id`.
    async fn send_message(&self, request: &SendRequest) -> Result<MessageRecord, SyncError>;

    async fn edit_message(&self, id: MessageId, content: &str) -> Result<MessageRecord, SyncError>;

    async fn delete_message(&self, id: MessageId) -> Result<(), SyncError>;

    async fn mark_read(&self, id: MessageId) -> Result<(), SyncError>;

    async fn mark_notification_read(&self, id: &str) -> Result<(), SyncError>;

    async fn clear_notifications(&self) -> Result<(), SyncError>;
}
