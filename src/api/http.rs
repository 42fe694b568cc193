use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::debug;

use super::ChatApi;
use crate::config::ClientConfig;
use crate::errors::SyncError;
use crate::models::{DirectorySnapshot, MessageId, MessageRecord, SendRequest, UserId};
use crate::wire;

/// [`ChatApi`] over the REST backend, with bearer authentication.
#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(config: &ClientConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
            token: config.auth_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, endpoint: &str, builder: RequestBuilder) -> Result<Response, SyncError> {
        let resp = builder.send().await.map_err(|e| SyncError::network(endpoint, e))?;
        let status = resp.status();
        debug!(endpoint, status = status.as_u16(), "response");
        if !status.is_success() {
            return Err(SyncError::Rejected { endpoint: endpoint.to_string(), status: status.as_u16() });
        }
        Ok(resp)
    }

    async fn json(&self, endpoint: &str, builder: RequestBuilder) -> Result<Value, SyncError> {
        self.execute(endpoint, builder)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| SyncError::decode(endpoint, e))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_groups(&self) -> Result<DirectorySnapshot, SyncError> {
        let endpoint = "list-groups";
        let body = self.json(endpoint, self.request(Method::GET, "/api/list-groups/")).await?;
        wire::directory_snapshot(body).map_err(|e| SyncError::decode(endpoint, e))
    }

    async fn fetch_dialog(&self, counterpart: UserId) -> Result<Vec<MessageRecord>, SyncError> {
        let endpoint = "dialog";
        let body = self
            .json(endpoint, self.request(Method::GET, &format!("/api/dialog/{counterpart}/")))
            .await?;
        let Value::Array(rows) = body else {
            return Err(SyncError::decode(endpoint, "expected a JSON array"));
        };
        rows.into_iter()
            .map(|row| wire::message_record(row).map_err(|e| SyncError::decode(endpoint, e)))
            .collect()
    }

    async fn send_message(&self, request: &SendRequest) -> Result<MessageRecord, SyncError> {
        let endpoint = "send";
        let path = format!("/api/dialog/{}/send/", request.recipient_id);
        let body = self.json(endpoint, self.request(Method::POST, &path).json(request)).await?;
        wire::message_record(body).map_err(|e| SyncError::decode(endpoint, e))
    }

    async fn edit_message(&self, id: MessageId, content: &str) -> Result<MessageRecord, SyncError> {
        let endpoint = "edit";
        let builder = self
            .request(Method::PATCH, &format!("/api/messages/{id}/"))
            .json(&json!({ "content": content }));
        let body = self.json(endpoint, builder).await?;
        wire::message_record(body).map_err(|e| SyncError::decode(endpoint, e))
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), SyncError> {
        self.execute("delete", self.request(Method::DELETE, &format!("/api/messages/{id}/")))
            .await
            .map(drop)
    }

    async fn mark_read(&self, id: MessageId) -> Result<(), SyncError> {
        self.execute("read-ack", self.request(Method::POST, &format!("/api/messages/{id}/read/")))
            .await
            .map(drop)
    }

    async fn mark_notification_read(&self, id: &str) -> Result<(), SyncError> {
        let path = format!("/api/notifications/{id}/mark-read/");
        self.execute("notification-read", self.request(Method::POST, &path))
            .await
            .map(drop)
    }

    async fn clear_notifications(&self) -> Result<(), SyncError> {
        self.execute("notifications-clear", self.request(Method::POST, "/api/notifications/clear/"))
            .await
            .map(drop)
    }
}
