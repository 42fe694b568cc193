use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{
    Attachment, Message, MessageId, MessagePatch, MessageRecord, MessageState, UserId,
};

/// What a reconciliation step did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Appended,
    /// An optimistic entry was replaced at its original position.
    ReplacedPending,
    /// The server id was already present; fields were merged.
    Merged,
    /// Duplicate delivery; nothing changed.
    Ignored,
}

/// Everything needed to re-issue a failed send.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryTicket {
    pub client_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

/// Per-conversation message logs, keyed by the other party's id.
///
/// Each log is ordered by `created_at`, ties kept in insertion order. The
/// only entries ever replaced in place are optimistic ones.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<UserId, Vec<Message>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered view of one conversation: everything except tombstones.
    pub fn visible(&self, key: UserId) -> Vec<&Message> {
        self.conversations
            .get(&key)
            .map(|log| log.iter().filter(|m| m.is_visible()).collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = UserId> + '_ {
        self.conversations.keys().copied()
    }

    /// Finds a live (non-deleted) message by server id in any conversation.
    pub fn find(&self, id: MessageId) -> Option<&Message> {
        self.conversations
            .values()
            .flat_map(|log| log.iter())
            .find(|m| m.id == Some(id) && m.is_visible())
    }

    pub fn find_by_client_id(&self, key: UserId, client_id: &str) -> Option<&Message> {
        self.conversations
            .get(&key)?
            .iter()
            .find(|m| m.client_id.as_deref() == Some(client_id))
    }

    /// Drops every conversation, tombstones included.
    pub fn clear(&mut self) {
        self.conversations.clear();
    }

    // ── Local sends ──────────────────────────────────────────────────────────

    /// Appends an optimistic entry and returns its correlation token.
    pub fn begin_send(
        &mut self,
        key: UserId,
        sender_id: UserId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> String {
        let message = Message::optimistic(key, sender_id, content, attachments);
        let client_id = message.client_id.clone().unwrap_or_default();
        self.conversations.entry(key).or_default().push(message);
        client_id
    }

    /// Reconciles a successful send response with the optimistic entry.
    pub fn confirm_send(&mut self, key: UserId, client_id: &str, record: MessageRecord) -> Applied {
        let log = self.conversations.entry(key).or_default();

        if let Some(pos) = position_by_id(log, record.id) {
            // The live echo got here first.
            let holder = log[pos].client_id.clone();
            if holder.as_deref() != Some(client_id) {
                if let Some(p) = position_pending(log, client_id) {
                    match holder {
                        // The echo was matched to a different in-flight send with the same
                        // content; that send keeps waiting under this entry instead.
                        Some(other) => {
                            log[p].client_id = Some(other);
                            log[pos].client_id = Some(client_id.to_string());
                        }
                        None => {
                            log.remove(p);
                        }
                    }
                }
            }
            let pos = position_by_id(log, record.id).unwrap_or(pos);
            if log[pos].state != MessageState::Deleted {
                merge_record(&mut log[pos], record);
            }
            debug!(key, client_id, "send confirmation merged into existing entry");
            return Applied::Merged;
        }

        let client = Some(client_id.to_string());
        let slot = position_unsettled(log, client_id)
            .or_else(|| {
                log.iter()
                    .rposition(|m| m.is_pending() && m.sender_id == record.sender_id && m.content == record.content)
            });
        match slot {
            Some(pos) => {
                let client_id = record.client_id.clone().or(client);
                replace_at(log, pos, Message { client_id, ..Message::confirmed(record, key) });
                debug!(key, "optimistic send replaced by confirmation");
                Applied::ReplacedPending
            }
            None => {
                insert_ordered(log, Message { client_id: client, ..Message::confirmed(record, key) });
                debug!(key, "confirmation had no optimistic entry; appended");
                Applied::Appended
            }
        }
    }

    /// Marks a pending send as failed. Returns `false` if it is no longer pending.
    pub fn fail_send(&mut self, key: UserId, client_id: &str) -> bool {
        let Some(log) = self.conversations.get_mut(&key) else { return false };
        match position_pending(log, client_id) {
            Some(pos) => {
                log[pos].state = MessageState::Failed;
                true
            }
            None => false,
        }
    }

    /// Turns a failed entry back into a pending one, in place, under a new token.
    pub fn retry(&mut self, key: UserId, client_id: &str) -> Option<RetryTicket> {
        let log = self.conversations.get_mut(&key)?;
        let message = log
            .iter_mut()
            .find(|m| m.state == MessageState::Failed && m.client_id.as_deref() == Some(client_id))?;
        let fresh = uuid::Uuid::new_v4().to_string();
        message.client_id = Some(fresh.clone());
        message.state = MessageState::Pending;
        Some(RetryTicket {
            client_id: fresh,
            content: message.content.clone(),
            attachments: message.attachments.clone(),
        })
    }

    /// Removes a failed entry. Returns whether one was removed.
    pub fn discard(&mut self, key: UserId, client_id: &str) -> bool {
        let Some(log) = self.conversations.get_mut(&key) else { return false };
        let before = log.len();
        log.retain(|m| !(m.state == MessageState::Failed && m.client_id.as_deref() == Some(client_id)));
        log.len() != before
    }

    // ── Inbound events ───────────────────────────────────────────────────────

    /// Applies a pushed message. Delivering the same server id twice is a no-op.
    pub fn apply_new(&mut self, key: UserId, record: MessageRecord) -> Applied {
        let log = self.conversations.entry(key).or_default();
        if position_by_id(log, record.id).is_some() {
            debug!(key, id = record.id, "duplicate delivery ignored");
            return Applied::Ignored;
        }

        // An echo carrying our token also settles a send whose response was lost.
        let slot = record
            .client_id
            .as_deref()
            .and_then(|cid| position_unsettled(log, cid))
            .or_else(|| {
                log.iter()
                    .position(|m| m.is_pending() && m.sender_id == record.sender_id && m.content == record.content)
            });
        match slot {
            Some(pos) => {
                let client_id = record.client_id.clone().or_else(|| log[pos].client_id.clone());
                replace_at(log, pos, Message { client_id, ..Message::confirmed(record, key) });
                Applied::ReplacedPending
            }
            None => {
                insert_ordered(log, Message::confirmed(record, key));
                Applied::Appended
            }
        }
    }

    /// Merges an edit into whichever conversation holds the message. Unknown ids are ignored.
    pub fn apply_edit(&mut self, patch: MessagePatch) -> bool {
        let Some(message) = self
            .conversations
            .values_mut()
            .flat_map(|log| log.iter_mut())
            .find(|m| m.id == Some(patch.id) && m.is_visible())
        else {
            debug!(id = patch.id, "edit for unknown message ignored");
            return false;
        };
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(attachments) = patch.attachments {
            message.attachments = attachments;
        }
        if patch.read_at.is_some() {
            message.read_at = patch.read_at;
        }
        true
    }

    /// Tombstones a message in whichever conversation holds it. Unknown ids are ignored.
    pub fn apply_delete(&mut self, id: MessageId) -> bool {
        let found = self
            .conversations
            .values_mut()
            .flat_map(|log| log.iter_mut())
            .find(|m| m.id == Some(id) && m.is_visible());
        match found {
            Some(message) => {
                message.state = MessageState::Deleted;
                true
            }
            None => {
                debug!(id, "delete for unknown message ignored");
                false
            }
        }
    }

    /// Stamps `read_at` on the given messages. Returns how many changed.
    pub fn apply_read(&mut self, ids: &[MessageId], read_at: DateTime<Utc>) -> usize {
        let wanted: HashSet<MessageId> = ids.iter().copied().collect();
        let mut changed = 0;
        for message in self.conversations.values_mut().flat_map(|log| log.iter_mut()) {
            if message.read_at.is_none() && message.id.is_some_and(|id| wanted.contains(&id)) {
                message.read_at = Some(read_at);
                changed += 1;
            }
        }
        changed
    }

    /// Confirmed messages from the other party that have not been read yet.
    pub fn unread_inbound(&self, key: UserId, local_user: UserId) -> Vec<MessageId> {
        self.visible(key)
            .into_iter()
            .filter(|m| m.state == MessageState::Confirmed && m.sender_id != local_user && m.read_at.is_none())
            .filter_map(|m| m.id)
            .collect()
    }

    // ── History ──────────────────────────────────────────────────────────────

    /// Replaces a conversation with its server backlog while keeping local
    /// entries the backlog does not know about yet.
    pub fn seed(&mut self, key: UserId, records: Vec<MessageRecord>) {
        let previous = self.conversations.remove(&key).unwrap_or_default();
        let tombstoned: HashSet<MessageId> = previous
            .iter()
            .filter(|m| m.state == MessageState::Deleted)
            .filter_map(|m| m.id)
            .collect();

        let mut log: Vec<Message> = records
            .into_iter()
            .filter(|r| !tombstoned.contains(&r.id))
            .map(|r| Message::confirmed(r, key))
            .collect();
        log.sort_by_key(|m| m.created_at);

        let known_ids: HashSet<MessageId> = log.iter().filter_map(|m| m.id).collect();
        let known_clients: HashSet<String> = log.iter().filter_map(|m| m.client_id.clone()).collect();

        let mut local = Vec::new();
        for message in previous {
            match message.id {
                Some(id) if known_ids.contains(&id) => {}
                Some(_) => insert_ordered(&mut log, message),
                None if message.client_id.as_ref().is_some_and(|c| known_clients.contains(c)) => {}
                None => local.push(message),
            }
        }
        log.extend(local);
        self.conversations.insert(key, log);
    }
}

fn position_by_id(log: &[Message], id: MessageId) -> Option<usize> {
    log.iter().position(|m| m.id == Some(id))
}

fn position_pending(log: &[Message], client_id: &str) -> Option<usize> {
    log.iter()
        .position(|m| m.is_pending() && m.client_id.as_deref() == Some(client_id))
}

/// A local send, pending or failed, carrying `client_id`.
fn position_unsettled(log: &[Message], client_id: &str) -> Option<usize> {
    log.iter().position(|m| {
        matches!(m.state, MessageState::Pending | MessageState::Failed) && m.client_id.as_deref() == Some(client_id)
    })
}

fn merge_record(message: &mut Message, record: MessageRecord) {
    message.id = Some(record.id);
    message.content = record.content;
    message.attachments = record.attachments;
    if record.read_at.is_some() {
        message.read_at = record.read_at;
    }
    message.state = MessageState::Confirmed;
}

/// Replaces the entry at `pos`, keeping its slot unless the new timestamp
/// would break the log's order.
fn replace_at(log: &mut Vec<Message>, pos: usize, message: Message) {
    let after_prev = pos == 0 || log[pos - 1].created_at <= message.created_at;
    let before_next = log.get(pos + 1).map_or(true, |next| message.created_at <= next.created_at);
    if after_prev && before_next {
        log[pos] = message;
    } else {
        log.remove(pos);
        insert_ordered(log, message);
    }
}

/// Inserts after the last entry whose timestamp is not later than `message`'s.
fn insert_ordered(log: &mut Vec<Message>, message: Message) {
    let pos = log
        .iter()
        .rposition(|m| m.created_at <= message.created_at)
        .map_or(0, |i| i + 1);
    log.insert(pos, message);
}
