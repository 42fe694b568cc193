//! Wire schema of the REST and live-event endpoints.
//!
//! Server payloads are loosely shaped (ids as numbers or strings, senders as
//! ids or nested objects, several names for the same timestamp). Everything is
//! mapped here, once, into [`MessageRecord`], [`InboundEvent`] and friends so
//! the rest of the crate only matches on canonical types.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    Attachment, DirectorySnapshot, Group, MessageId, MessagePatch, MessageRecord, Notification,
    Student, UserId,
};

/// A live event after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage(MessageRecord),
    Edited(MessagePatch),
    Deleted { id: MessageId },
    ReadReceipt {
        message_ids: Vec<MessageId>,
        reader_id: Option<UserId>,
        /// Author of the messages that were read.
        sender_id: Option<UserId>,
        read_at: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame has no 'type' tag")]
    Untyped,
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("malformed '{kind}' frame: {message}")]
    Malformed { kind: String, message: String },
}

// ── Primitive shapes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireId {
    Num(u64),
    Text(String),
}

impl WireId {
    fn as_u64(&self) -> Option<u64> {
        match self {
            WireId::Num(n) => Some(*n),
            WireId::Text(s) => s.trim().parse().ok(),
        }
    }

    fn into_string(self) -> String {
        match self {
            WireId::Num(n) => n.to_string(),
            WireId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireUser {
    Id(WireId),
    Object { id: WireId },
}

impl WireUser {
    fn id(&self) -> Option<UserId> {
        match self {
            WireUser::Id(id) | WireUser::Object { id } => id.as_u64(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFile {
    Url(String),
    Object {
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
}

impl WireFile {
    fn into_attachment(self) -> Option<Attachment> {
        match self {
            WireFile::Url(url) if !url.is_empty() => Some(Attachment::new(url, None)),
            WireFile::Url(_) => None,
            WireFile::Object { file, url, name } => {
                file.or(url).filter(|u| !u.is_empty()).map(|u| Attachment::new(u, name))
            }
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: WireId,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    sender: Option<WireUser>,
    #[serde(default)]
    sender_id: Option<WireId>,
    #[serde(default)]
    recipient: Option<WireUser>,
    #[serde(default)]
    recipient_id: Option<WireId>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    files: Vec<WireFile>,
    #[serde(default)]
    attachments: Vec<WireFile>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    read_at: Option<String>,
}

impl WireMessage {
    fn into_record(self) -> Result<MessageRecord, String> {
        let id = self.id.as_u64().ok_or("message id is not numeric")?;
        let sender_id = self
            .sender
            .as_ref()
            .and_then(WireUser::id)
            .or_else(|| self.sender_id.as_ref().and_then(WireId::as_u64))
            .ok_or("message has no sender")?;
        let recipient_id = self
            .recipient
            .as_ref()
            .and_then(WireUser::id)
            .or_else(|| self.recipient_id.as_ref().and_then(WireId::as_u64));
        let created_at = [&self.timestamp, &self.created_at, &self.date]
            .into_iter()
            .flatten()
            .find_map(|raw| parse_timestamp(raw))
            .unwrap_or_else(Utc::now);
        let attachments = self
            .files
            .into_iter()
            .chain(self.attachments)
            .filter_map(WireFile::into_attachment)
            .collect();

        Ok(MessageRecord {
            id,
            client_id: self.client_id.filter(|c| !c.is_empty()),
            sender_id,
            recipient_id,
            content: self.content.or(self.text).unwrap_or_default(),
            attachments,
            created_at,
            read_at: self.read_at.as_deref().and_then(parse_timestamp),
        })
    }
}

/// Normalizes one server message object (REST responses and history rows).
pub fn message_record(value: Value) -> Result<MessageRecord, String> {
    serde_json::from_value::<WireMessage>(value)
        .map_err(|e| e.to_string())?
        .into_record()
}

#[derive(Debug, Deserialize)]
struct WireEdit {
    id: WireId,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    files: Option<Vec<WireFile>>,
    #[serde(default)]
    attachments: Option<Vec<WireFile>>,
    #[serde(default)]
    read_at: Option<String>,
}

impl WireEdit {
    fn into_patch(self) -> Result<MessagePatch, String> {
        let id = self.id.as_u64().ok_or("message id is not numeric")?;
        let attachments = self
            .files
            .or(self.attachments)
            .map(|files| files.into_iter().filter_map(WireFile::into_attachment).collect());
        Ok(MessagePatch {
            id,
            content: self.content.or(self.text),
            attachments,
            read_at: self.read_at.as_deref().and_then(parse_timestamp),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireDeleted {
    #[serde(default)]
    id: Option<WireId>,
    #[serde(default)]
    message_id: Option<WireId>,
}

#[derive(Debug, Deserialize)]
struct WireReceipt {
    #[serde(default)]
    message_ids: Vec<WireId>,
    #[serde(default)]
    message_id: Option<WireId>,
    #[serde(default)]
    reader_id: Option<WireId>,
    #[serde(default)]
    user_id: Option<WireId>,
    #[serde(default)]
    sender_id: Option<WireId>,
    #[serde(default)]
    read_at: Option<String>,
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// The object carrying a frame's fields: `message`, `data`, or the frame itself.
fn frame_body(frame: &Value) -> Value {
    ["message", "data"]
        .iter()
        .find_map(|key| frame.get(*key).filter(|v| v.is_object()))
        .unwrap_or(frame)
        .clone()
}

/// Maps one parsed live-event payload onto an [`InboundEvent`].
pub fn normalize_frame(frame: &Value) -> Result<InboundEvent, FrameError> {
    let tag = frame.get("type").and_then(Value::as_str).ok_or(FrameError::Untyped)?;
    // `new-message` and `new_message` are the same event.
    let kind = tag.trim().to_ascii_lowercase().replace('-', "_");
    let body = frame_body(frame);
    let malformed = |message: String| FrameError::Malformed { kind: kind.clone(), message };

    match kind.as_str() {
        "new_message" | "chat_message" | "message" => {
            message_record(body).map(InboundEvent::NewMessage).map_err(malformed)
        }
        "message_edited" | "edited" | "message_updated" => serde_json::from_value::<WireEdit>(body)
            .map_err(|e| e.to_string())
            .and_then(WireEdit::into_patch)
            .map(InboundEvent::Edited)
            .map_err(malformed),
        "message_deleted" | "deleted" => {
            let wire: WireDeleted = serde_json::from_value(body).map_err(|e| malformed(e.to_string()))?;
            wire.id
                .or(wire.message_id)
                .as_ref()
                .and_then(WireId::as_u64)
                .map(|id| InboundEvent::Deleted { id })
                .ok_or_else(|| malformed("no message id".to_string()))
        }
        "read_receipt" | "read" | "messages_read" => {
            let wire: WireReceipt = serde_json::from_value(body).map_err(|e| malformed(e.to_string()))?;
            let message_ids = wire
                .message_ids
                .iter()
                .chain(wire.message_id.as_ref())
                .filter_map(WireId::as_u64)
                .collect();
            Ok(InboundEvent::ReadReceipt {
                message_ids,
                reader_id: wire.reader_id.or(wire.user_id).as_ref().and_then(WireId::as_u64),
                sender_id: wire.sender_id.as_ref().and_then(WireId::as_u64),
                read_at: wire.read_at.as_deref().and_then(parse_timestamp).unwrap_or_else(Utc::now),
            })
        }
        other => Err(FrameError::UnknownType(other.to_string())),
    }
}

// ── Directory ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireGroup {
    group_id: WireId,
    #[serde(default)]
    group_name: Option<String>,
    #[serde(default)]
    students: Vec<WireStudent>,
}

#[derive(Debug, Deserialize)]
struct WireStudent {
    user_id: WireId,
    #[serde(default, rename = "user__full_name")]
    full_name: Option<String>,
    #[serde(default, rename = "user__photo")]
    photo: Option<String>,
    #[serde(default, rename = "user__hemis_id")]
    hemis_id: Option<WireId>,
    #[serde(default)]
    unread_count: u32,
}

/// Normalizes the `list-groups` response. Group counters are recomputed from members.
pub fn directory_snapshot(value: Value) -> Result<DirectorySnapshot, String> {
    let groups: Vec<WireGroup> = serde_json::from_value(value).map_err(|e| e.to_string())?;
    let mut snapshot = DirectorySnapshot::default();
    for group in groups {
        let id = group.group_id.into_string();
        let students: Vec<Student> = group
            .students
            .into_iter()
            .filter_map(|s| {
                Some(Student {
                    id: s.user_id.as_u64()?,
                    full_name: s.full_name.unwrap_or_default(),
                    photo: s.photo.filter(|p| !p.is_empty()),
                    hemis_id: s.hemis_id.map(WireId::into_string),
                    unread_count: s.unread_count,
                })
            })
            .collect();
        snapshot.groups.push(Group {
            id: id.clone(),
            name: group.group_name.unwrap_or_default(),
            unread_count: students.iter().map(|s| s.unread_count).sum(),
        });
        snapshot.roster.insert(id, students);
    }
    Ok(snapshot)
}

// ── Notifications ────────────────────────────────────────────────────────────

/// Builds a feed entry from a notify-channel payload (body under `data` if present).
pub fn notification(payload: &Value) -> Notification {
    let note = payload.get("data").filter(|d| !d.is_null()).unwrap_or(payload);
    let id = note
        .get("id")
        .and_then(|v| serde_json::from_value::<WireId>(v.clone()).ok())
        .map(WireId::into_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let user_id = note
        .get("user_id")
        .or_else(|| note.get("user").and_then(|u| u.get("id")))
        .and_then(|v| serde_json::from_value::<WireId>(v.clone()).ok())
        .and_then(|id| id.as_u64());
    Notification {
        id,
        user_id,
        payload: note.get("payload").cloned().unwrap_or_else(|| note.clone()),
        is_read: note.get("is_read").and_then(Value::as_bool).unwrap_or(false),
        created_at: note
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
    }
}
