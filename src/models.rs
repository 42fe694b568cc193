use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type MessageId = u64;
pub type GroupId = String;

// ── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tutor,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tutor => "tutor",
            Role::Student => "student",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Role {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "tutor" | "teacher" => Ok(Role::Tutor),
            "student" => Ok(Role::Student),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// The logged-in user as exposed by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub role: Role,
    /// The tutor assigned to a student. Unused for tutors.
    #[serde(default)]
    pub assigned_counterpart_id: Option<UserId>,
}

impl Identity {
    pub fn tutor(id: UserId) -> Self {
        Self { id, role: Role::Tutor, assigned_counterpart_id: None }
    }

    pub fn student(id: UserId, tutor_id: Option<UserId>) -> Self {
        Self { id, role: Role::Student, assigned_counterpart_id: tutor_id }
    }

    /// The conversation a student always talks in, if a tutor is assigned.
    pub fn fixed_conversation(&self) -> Option<UserId> {
        match self.role {
            Role::Student => self.assigned_counterpart_id,
            Role::Tutor => None,
        }
    }

    /// Resolves the other party of a 1:1 message relative to this user.
    ///
    /// Returns `None` when the message does not involve this user in a way
    /// that identifies a counterpart.
    pub fn conversation_key(&self, sender_id: UserId, recipient_id: Option<UserId>) -> Option<UserId> {
        if let Some(tutor) = self.fixed_conversation() {
            return Some(tutor);
        }
        if sender_id != self.id {
            return Some(sender_id);
        }
        recipient_id.filter(|r| *r != self.id)
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Inserted optimistically, not yet acknowledged.
    Pending,
    Confirmed,
    /// Send rejected; kept visible for retry or discard.
    Failed,
    /// Tombstone. Hidden from the rendered log until purged.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Document,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "ogg", "mov"];

impl AttachmentKind {
    /// Infers the kind from the extension of a URL, ignoring any query string.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let file = path.rsplit('/').next().unwrap_or(path);
        let ext = match file.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return AttachmentKind::Document,
        };
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            AttachmentKind::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            AttachmentKind::Video
        } else {
            AttachmentKind::Document
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    pub kind: AttachmentKind,
}

impl Attachment {
    pub fn new(url: impl Into<String>, name: Option<String>) -> Self {
        let url = url.into();
        let name = name.filter(|n| !n.is_empty()).unwrap_or_else(|| {
            let path = url.split(['?', '#']).next().unwrap_or(&url);
            path.trim_end_matches('/').rsplit('/').next().unwrap_or(path).to_string()
        });
        let kind = AttachmentKind::from_url(&url);
        Self { name, url, kind }
    }
}

/// A message as the server describes it, after wire normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub client_id: Option<String>,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Fields of an edited message. `None` leaves the local value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePatch {
    pub id: MessageId,
    pub content: Option<String>,
    pub attachments: Option<Vec<Attachment>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl From<MessageRecord> for MessagePatch {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            content: Some(record.content),
            attachments: Some(record.attachments),
            read_at: record.read_at,
        }
    }
}

/// One entry of a conversation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Server id; `None` until confirmed.
    pub id: Option<MessageId>,
    /// Correlation token of a locally originated send.
    pub client_id: Option<String>,
    pub conversation_key: UserId,
    pub sender_id: UserId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub state: MessageState,
}

impl Message {
    pub fn optimistic(
        conversation_key: UserId,
        sender_id: UserId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            id: None,
            client_id: Some(uuid::Uuid::new_v4().to_string()),
            conversation_key,
            sender_id,
            content,
            attachments,
            created_at: Utc::now(),
            read_at: None,
            state: MessageState::Pending,
        }
    }

    pub fn confirmed(record: MessageRecord, conversation_key: UserId) -> Self {
        Self {
            id: Some(record.id),
            client_id: record.client_id,
            conversation_key,
            sender_id: record.sender_id,
            content: record.content,
            attachments: record.attachments,
            created_at: record.created_at,
            read_at: record.read_at,
            state: MessageState::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == MessageState::Pending
    }

    pub fn is_visible(&self) -> bool {
        self.state != MessageState::Deleted
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendRequest {
    #[serde(skip)]
    pub recipient_id: UserId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub client_id: String,
}

// ── Roster ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Always the sum of the members' counters.
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Student {
    pub id: UserId,
    pub full_name: String,
    pub photo: Option<String>,
    pub hemis_id: Option<String>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    pub groups: Vec<Group>,
    pub roster: HashMap<GroupId, Vec<Student>>,
}

// ── Notifications ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: String,
    pub user_id: Option<UserId>,
    pub payload: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_attachment_kind_from_extension() {
        assert_eq!(AttachmentKind::from_url("https://cdn/x/photo.JPG?sig=1"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_url("/media/clip.mov"), AttachmentKind::Video);
        assert_eq!(AttachmentKind::from_url("/media/report.pdf"), AttachmentKind::Document);
        assert_eq!(AttachmentKind::from_url("/media/noext"), AttachmentKind::Document);
    }

    #[test]
    fn attachment_name_defaults_to_last_segment() {
        let a = Attachment::new("https://host/files/essay.docx?x=1", None);
        assert_eq!(a.name, "essay.docx");
        assert_eq!(a.kind, AttachmentKind::Document);
    }

    #[test]
    fn conversation_key_is_the_other_party() {
        let tutor = Identity::tutor(1);
        assert_eq!(tutor.conversation_key(42, Some(1)), Some(42));
        assert_eq!(tutor.conversation_key(1, Some(42)), Some(42));
        assert_eq!(tutor.conversation_key(1, None), None);

        let student = Identity::student(42, Some(1));
        assert_eq!(student.conversation_key(1, Some(42)), Some(1));
        assert_eq!(student.conversation_key(42, None), Some(1));
        assert_eq!(Identity::student(42, None).conversation_key(1, Some(42)), Some(1));
    }

    #[test]
    fn role_accepts_teacher_alias() {
        assert_eq!(Role::try_from("Teacher".to_string()), Ok(Role::Tutor));
        assert!(Role::try_from("admin".to_string()).is_err());
    }
}
