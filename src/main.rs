use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tutor_chat_sync::models::{Identity, Role, UserId};
use tutor_chat_sync::{AlwaysVisible, ClientConfig, EngineUpdate, HttpChatApi, SyncEngine};

const VIEWPORT_TICK: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutor_chat_sync=debug".into()),
        )
        .init();

    // ── Wiring ────────────────────────────────────────────────────────────────
    let config = ClientConfig::from_env()?;
    let identity = identity_from_env()?;
    let api = HttpChatApi::new(&config)?;
    info!(api = %config.api_base_url, ws = %config.ws_base_url, "starting headless client");
    let engine = SyncEngine::new(config, Arc::new(api));

    let mut updates = engine.subscribe();
    let logger = engine.clone();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => log_update(&logger, update),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "update log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = engine.set_identity(Some(identity.clone())).await {
        warn!("initial load failed: {e}");
    }

    // ── Selection (tutors only) ───────────────────────────────────────────────
    if identity.role == Role::Tutor {
        if let Ok(group) = std::env::var("TUTOR_CHAT_GROUP_ID") {
            if !engine.select_group(&group) {
                warn!(group, "unknown group");
            }
        }
        if let Some(student) = env_id("TUTOR_CHAT_STUDENT_ID")? {
            if let Err(e) = engine.open_conversation(student).await {
                warn!(student, "could not open conversation: {e}");
            }
        }
    }

    // ── Input loop ────────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut viewport = tokio::time::interval(VIEWPORT_TICK);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = viewport.tick() => {
                engine.observe_viewport(&AlwaysVisible).await;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = engine.send_message(&line, Vec::new()).await {
                        warn!("send failed: {e}");
                    }
                }
                None => {
                    info!("stdin closed");
                    break;
                }
            },
        }
    }

    engine.shutdown();
    Ok(())
}

fn identity_from_env() -> anyhow::Result<Identity> {
    let id = env_id("TUTOR_CHAT_USER_ID")?.context("TUTOR_CHAT_USER_ID must be set")?;
    let role = std::env::var("TUTOR_CHAT_ROLE").context("TUTOR_CHAT_ROLE must be set")?;
    let role = Role::try_from(role).map_err(anyhow::Error::msg)?;
    Ok(match role {
        Role::Tutor => Identity::tutor(id),
        Role::Student => Identity::student(id, env_id("TUTOR_CHAT_COUNTERPART_ID")?),
    })
}

fn env_id(name: &str) -> anyhow::Result<Option<UserId>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} must be a numeric user id")),
        Err(_) => Ok(None),
    }
}

fn log_update(engine: &SyncEngine, update: EngineUpdate) {
    match update {
        EngineUpdate::Conversation(key) => {
            let messages = engine.messages(key);
            if let Some(last) = messages.last() {
                info!(key, count = messages.len(), state = ?last.state, "{}: {}", last.sender_id, last.content);
            }
        }
        EngineUpdate::Directory => {
            for group in engine.groups() {
                info!(group = %group.id, unread = group.unread_count, "{}", group.name);
            }
        }
        EngineUpdate::Notifications => {
            info!(unread = engine.unread_notifications(), "notifications changed");
        }
        EngineUpdate::Connection { endpoint, open } => {
            info!(%endpoint, open, "connection state");
        }
    }
}
