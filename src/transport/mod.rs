pub mod connection;
pub mod registry;

use std::fmt;

use crate::models::UserId;

pub use connection::{Connection, EventKind, Payload, TransportEvent, Unsubscribe};
pub use registry::TransportRegistry;

/// Identifies one live event endpoint. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    /// `ws://host[:port]` or `wss://host[:port]`.
    pub host: String,
    pub path: String,
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        let host = host.into().trim_end_matches('/').to_string();
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self { host, path }
    }

    /// The dialog stream with one counterpart.
    pub fn chat(host: &str, counterpart: UserId) -> Self {
        Self::new(host, format!("/ws/chat/{counterpart}/"))
    }

    pub fn notifications(host: &str) -> Self {
        Self::new(host, "/ws/notify/")
    }

    /// Full socket URL, with the bearer token as a query parameter when present.
    pub fn url(&self, token: Option<&str>) -> String {
        let base = if self.host.starts_with("ws://") || self.host.starts_with("wss://") {
            format!("{}{}", self.host, self.path)
        } else {
            format!("ws://{}{}", self.host, self.path)
        };
        match token {
            Some(token) => {
                let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
                format!("{base}?token={encoded}")
            }
            None => base,
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}
