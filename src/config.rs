use std::time::Duration;

use url::Url;

use crate::errors::SyncError;

const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Viewport heuristics of the read-tracking monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadTrackingConfig {
    /// How long a message must stay visible before it counts as read. Also the
    /// quiet period before a batch of acknowledgements is flushed.
    pub dwell: Duration,
    /// Minimum visible fraction of a message, 0.0..=1.0.
    pub visible_fraction: f32,
    /// Delay before the whole open conversation is marked read.
    pub settle: Duration,
    /// Maximum distance from the bottom of the log, in pixels, for the settle rule.
    pub bottom_proximity_px: f32,
}

impl Default for ReadTrackingConfig {
    fn default() -> Self {
        Self {
            dwell: Duration::from_millis(500),
            visible_fraction: 0.5,
            settle: Duration::from_millis(1500),
            bottom_proximity_px: 200.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    /// `ws://host[:port]` or `wss://host[:port]` of the live event endpoints.
    pub ws_base_url: String,
    pub auth_token: Option<String>,
    pub reconnect_backoff: Duration,
    pub refresh_debounce: Duration,
    pub request_timeout: Duration,
    pub read_tracking: ReadTrackingConfig,
}

impl ClientConfig {
    pub fn new(api_base_url: &str) -> Result<Self, SyncError> {
        let api_base_url = api_base_url.trim_end_matches('/').to_string();
        let ws_base_url = derive_ws_base(&api_base_url)?;
        Ok(Self {
            api_base_url,
            ws_base_url,
            auth_token: None,
            reconnect_backoff: Duration::from_secs(3),
            refresh_debounce: Duration::from_secs(1),
            request_timeout: Duration::from_secs(15),
            read_tracking: ReadTrackingConfig::default(),
        })
    }

    /// Reads `TUTOR_CHAT_*` variables from the process environment.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let api_url = lookup("TUTOR_CHAT_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let mut config = Self::new(&api_url)?;

        if let Some(host) = lookup("TUTOR_CHAT_WS_HOST").filter(|h| !h.trim().is_empty()) {
            config.ws_base_url = if host.starts_with("ws://") || host.starts_with("wss://") {
                host.trim_end_matches('/').to_string()
            } else {
                format!("ws://{}", host.trim_end_matches('/'))
            };
        }
        config.auth_token = lookup("TUTOR_CHAT_TOKEN").filter(|t| !t.is_empty());

        let millis = |key: &str| -> Result<Option<Duration>, SyncError> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|_| SyncError::Config(format!("{key} must be a whole number of milliseconds, got '{raw}'")))
                })
                .transpose()
        };
        if let Some(d) = millis("TUTOR_CHAT_RECONNECT_MS")? {
            config.reconnect_backoff = d;
        }
        if let Some(d) = millis("TUTOR_CHAT_REFRESH_DEBOUNCE_MS")? {
            config.refresh_debounce = d;
        }
        if let Some(d) = millis("TUTOR_CHAT_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = d;
        }
        Ok(config)
    }
}

/// `https://api.example:8443/x` becomes `wss://api.example:8443`.
fn derive_ws_base(api_base_url: &str) -> Result<String, SyncError> {
    let url = Url::parse(api_base_url)
        .map_err(|e| SyncError::Config(format!("invalid API URL '{api_base_url}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| SyncError::Config(format!("API URL '{api_base_url}' has no host")))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    Ok(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}
