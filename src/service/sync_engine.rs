use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::config::ClientConfig;
use crate::errors::SyncError;
use crate::models::{
    Attachment, Group, GroupId, Identity, Message, MessageId, MessagePatch, Notification, Role,
    SendRequest, Student, UserId,
};
use crate::service::debounce::Debouncer;
use crate::service::history::HistoryLoader;
use crate::service::notifications::NotificationFeed;
use crate::service::read_tracker::{ReadTracker, VisibilityProbe};
use crate::store::{Applied, ConversationStore, DirectoryCache};
use crate::transport::{
    Connection, ConnectionDescriptor, EventKind, Payload, TransportEvent, TransportRegistry, Unsubscribe,
};
use crate::wire::{self, FrameError, InboundEvent};

const MAX_MESSAGE_LENGTH: usize = 4000;
const UPDATE_CAPACITY: usize = 256;

/// Change notifications for observers of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    Conversation(UserId),
    Directory,
    Notifications,
    Connection { endpoint: ConnectionDescriptor, open: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Chat,
    Notifications,
}

struct EngineState {
    identity: Option<Identity>,
    store: ConversationStore,
    directory: DirectoryCache,
    tracker: ReadTracker,
    notifications: NotificationFeed,
    selected_group: Option<GroupId>,
    selected_student: Option<UserId>,
    chat_endpoint: Option<ConnectionDescriptor>,
    chat_listeners: Vec<Unsubscribe>,
    notify_listeners: Vec<Unsubscribe>,
}

impl EngineState {
    /// The conversation currently on screen.
    fn active_key(&self) -> Option<UserId> {
        let identity = self.identity.as_ref()?;
        match identity.role {
            Role::Tutor => self.selected_student,
            Role::Student => identity.fixed_conversation(),
        }
    }
}

struct EngineInner {
    api: Arc<dyn ChatApi>,
    config: ClientConfig,
    registry: TransportRegistry,
    history: HistoryLoader,
    directory_refresh: Debouncer,
    state: Mutex<EngineState>,
    updates: broadcast::Sender<EngineUpdate>,
}

/// Root of the synchronization engine. Cheap to clone; clones share state.
///
/// Must be driven from within a Tokio runtime.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(config: ClientConfig, api: Arc<dyn ChatApi>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let state = EngineState {
            identity: None,
            store: ConversationStore::new(),
            directory: DirectoryCache::new(),
            tracker: ReadTracker::new(config.read_tracking.clone()),
            notifications: NotificationFeed::new(),
            selected_group: None,
            selected_student: None,
            chat_endpoint: None,
            chat_listeners: Vec::new(),
            notify_listeners: Vec::new(),
        };
        Self {
            inner: Arc::new(EngineInner {
                api,
                registry: TransportRegistry::new(config.auth_token.clone(), config.reconnect_backoff),
                history: HistoryLoader::new(),
                directory_refresh: Debouncer::new(config.refresh_debounce),
                state: Mutex::new(state),
                updates,
                config,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.inner.updates.subscribe()
    }

    fn emit(&self, update: EngineUpdate) {
        // No receivers is fine.
        let _ = self.inner.updates.send(update);
    }

    // ── Read-only views ──────────────────────────────────────────────────────

    pub fn identity(&self) -> Option<Identity> {
        self.inner.state.lock().identity.clone()
    }

    pub fn active_conversation(&self) -> Option<UserId> {
        self.inner.state.lock().active_key()
    }

    pub fn selected_group(&self) -> Option<GroupId> {
        self.inner.state.lock().selected_group.clone()
    }

    /// Rendered log of one conversation.
    pub fn messages(&self, key: UserId) -> Vec<Message> {
        self.inner.state.lock().store.visible(key).into_iter().cloned().collect()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.inner.state.lock().directory.groups().to_vec()
    }

    pub fn students(&self, group_id: &str) -> Vec<Student> {
        self.inner.state.lock().directory.students(group_id).to_vec()
    }

    pub fn unread_count(&self, student_id: UserId) -> u32 {
        self.inner.state.lock().directory.unread_count(student_id)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.state.lock().notifications.items().to_vec()
    }

    pub fn unread_notifications(&self) -> usize {
        self.inner.state.lock().notifications.unread_count()
    }

    /// Whether the live stream of the active conversation is currently open.
    pub fn is_chat_connected(&self) -> bool {
        let endpoint = self.inner.state.lock().chat_endpoint.clone();
        endpoint
            .and_then(|e| self.inner.registry.get(&e))
            .is_some_and(|c| c.is_open())
    }

    // ── Identity and selection ───────────────────────────────────────────────

    /// Replaces the logged-in user, dropping everything derived from the previous one.
    pub async fn set_identity(&self, identity: Option<Identity>) -> Result<(), SyncError> {
        let listeners = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.identity == identity {
                return Ok(());
            }
            state.identity = identity.clone();
            state.store.clear();
            state.directory.clear();
            state.notifications.clear();
            state.selected_group = None;
            state.selected_student = None;
            state.chat_endpoint = None;
            state.tracker.set_conversation(None);
            let mut listeners = std::mem::take(&mut state.chat_listeners);
            listeners.append(&mut state.notify_listeners);
            listeners
        };
        for listener in listeners {
            listener.unsubscribe();
        }
        self.inner.history.invalidate();
        self.inner.directory_refresh.cancel();
        self.inner.registry.release_all();
        self.emit(EngineUpdate::Directory);
        self.emit(EngineUpdate::Notifications);

        let Some(identity) = identity else {
            info!("logged out");
            return Ok(());
        };
        info!(user = identity.id, role = %identity.role, "identity set");

        let endpoint = ConnectionDescriptor::notifications(&self.inner.config.ws_base_url);
        let connection = self.inner.registry.acquire(&endpoint);
        let listeners = self.attach(&connection, None, Channel::Notifications);
        self.inner.state.lock().notify_listeners = listeners;

        match identity.role {
            Role::Tutor => self.refresh_directory().await,
            Role::Student => match identity.fixed_conversation() {
                Some(tutor) => self.open_conversation(tutor).await,
                None => {
                    warn!(user = identity.id, "student has no assigned tutor; no conversation to open");
                    Ok(())
                }
            },
        }
    }

    /// Fetches the roster snapshot. Keeps the selected group if it still exists,
    /// otherwise selects the first one.
    pub async fn refresh_directory(&self) -> Result<(), SyncError> {
        let snapshot = self.inner.api.list_groups().await.map_err(|e| {
            warn!("directory refresh failed: {e}");
            e
        })?;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if !state.identity.as_ref().is_some_and(|i| i.role == Role::Tutor) {
                return Ok(());
            }
            state.directory.apply_snapshot(snapshot);
            let keep = state
                .selected_group
                .as_ref()
                .is_some_and(|g| state.directory.group(g).is_some());
            if !keep {
                state.selected_group = state.directory.groups().first().map(|g| g.id.clone());
            }
        }
        self.emit(EngineUpdate::Directory);
        Ok(())
    }

    fn schedule_directory_refresh(&self) {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        self.inner.directory_refresh.schedule(async move {
            if let Some(inner) = weak.upgrade() {
                // Errors are already logged.
                let _ = SyncEngine { inner }.refresh_directory().await;
            }
        });
    }

    /// Switches the tutor to another group. Clears every conversation so nothing
    /// from the previous group leaks into the new one.
    pub fn select_group(&self, group_id: &str) -> bool {
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.directory.group(group_id).is_none() {
                return false;
            }
            if state.selected_group.as_deref() == Some(group_id) {
                return true;
            }
            state.selected_group = Some(group_id.to_string());
            state.selected_student = None;
            state.store.clear();
            state.tracker.set_conversation(None);
        }
        self.inner.history.invalidate();
        self.switch_chat_channel(None);
        self.emit(EngineUpdate::Directory);
        true
    }

    /// Selects the conversation with `key`, connects its live stream and loads its backlog.
    pub async fn open_conversation(&self, key: UserId) -> Result<(), SyncError> {
        let ticket = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let identity = state.identity.as_ref().ok_or(SyncError::NoConversation)?;
            match identity.role {
                Role::Tutor if key != identity.id => state.selected_student = Some(key),
                Role::Student if identity.fixed_conversation() == Some(key) => {}
                _ => return Err(SyncError::NoConversation),
            }
            state.tracker.set_conversation(Some(key));
            self.inner.history.begin(key)
        };
        self.switch_chat_channel(Some(key));
        self.emit(EngineUpdate::Conversation(key));

        match self.inner.history.load(self.inner.api.as_ref(), &ticket).await {
            Ok(Some(records)) => {
                debug!(key, count = records.len(), "history loaded");
                {
                    let mut state = self.inner.state.lock();
                    // Selection may have moved while the response was handed over.
                    if !self.inner.history.is_current(&ticket) {
                        return Ok(());
                    }
                    state.store.seed(key, records);
                }
                self.emit(EngineUpdate::Conversation(key));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(key, "history load failed: {e}");
                Err(e)
            }
        }
    }

    fn switch_chat_channel(&self, key: Option<UserId>) {
        let next = key.map(|k| ConnectionDescriptor::chat(&self.inner.config.ws_base_url, k));
        let (previous, listeners) = {
            let mut state = self.inner.state.lock();
            if state.chat_endpoint == next {
                return;
            }
            let previous = std::mem::replace(&mut state.chat_endpoint, next.clone());
            (previous, std::mem::take(&mut state.chat_listeners))
        };
        for listener in listeners {
            listener.unsubscribe();
        }
        if let Some(previous) = previous {
            self.inner.registry.release(&previous);
        }
        if let Some(endpoint) = next {
            let connection = self.inner.registry.acquire(&endpoint);
            let listeners = self.attach(&connection, key, Channel::Chat);
            self.inner.state.lock().chat_listeners = listeners;
        }
    }

    fn attach(&self, connection: &Connection, channel_key: Option<UserId>, channel: Channel) -> Vec<Unsubscribe> {
        let weak = Arc::downgrade(&self.inner);
        let on_message = connection.on(EventKind::Message, move |event| {
            let (Some(inner), TransportEvent::Message(payload)) = (weak.upgrade(), event) else {
                return;
            };
            SyncEngine { inner }.handle_payload(payload, channel_key, channel);
        });

        let mut listeners = vec![on_message];
        for (kind, open) in [(EventKind::Open, true), (EventKind::Close, false)] {
            let weak = Arc::downgrade(&self.inner);
            let endpoint = connection.descriptor().clone();
            listeners.push(connection.on(kind, move |_| {
                if let Some(inner) = weak.upgrade() {
                    let _ = inner.updates.send(EngineUpdate::Connection { endpoint: endpoint.clone(), open });
                }
            }));
        }
        listeners.push(connection.on(EventKind::Error, |event| {
            if let TransportEvent::Error(reason) = event {
                debug!("transport error: {reason}");
            }
        }));
        listeners
    }

    // ── Inbound events ───────────────────────────────────────────────────────

    fn handle_payload(&self, payload: &Payload, channel_key: Option<UserId>, channel: Channel) {
        let raw;
        let value = match payload {
            Payload::Json(value) => value,
            Payload::Raw(text) if channel == Channel::Notifications => {
                raw = Value::String(text.clone());
                &raw
            }
            Payload::Raw(text) => {
                debug!(bytes = text.len(), "ignoring non-JSON frame");
                return;
            }
        };
        let event = match wire::normalize_frame(value) {
            Ok(event) => event,
            // Everything the notify channel cannot apply as a chat event is a notification.
            Err(e) if channel == Channel::Notifications => {
                debug!("notification frame: {e}");
                self.inner.state.lock().notifications.push(wire::notification(value));
                self.emit(EngineUpdate::Notifications);
                return;
            }
            Err(e @ FrameError::Malformed { .. }) => {
                warn!("dropping frame: {e}");
                return;
            }
            Err(e) => {
                debug!("ignoring frame: {e}");
                return;
            }
        };
        self.apply_event_from(event, channel_key);
    }

    /// Applies one normalized live event.
    pub fn apply_event(&self, event: InboundEvent) {
        self.apply_event_from(event, None)
    }

    fn apply_event_from(&self, event: InboundEvent, channel_key: Option<UserId>) {
        let mut updates = Vec::new();
        let mut refresh = false;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(identity) = state.identity.clone() else {
                debug!("event before login ignored");
                return;
            };
            match event {
                InboundEvent::NewMessage(record) => {
                    let Some(key) = identity
                        .conversation_key(record.sender_id, record.recipient_id)
                        .or(channel_key)
                    else {
                        debug!(id = record.id, "message without a resolvable counterpart ignored");
                        return;
                    };
                    let from_other = record.sender_id != identity.id;
                    let applied = state.store.apply_new(key, record);
                    debug!(key, ?applied, "new message");
                    if applied != Applied::Ignored {
                        updates.push(EngineUpdate::Conversation(key));
                        refresh = from_other && identity.role == Role::Tutor && state.active_key() != Some(key);
                    }
                }
                InboundEvent::Edited(patch) => {
                    let id = patch.id;
                    if state.store.apply_edit(patch) {
                        if let Some(message) = state.store.find(id) {
                            updates.push(EngineUpdate::Conversation(message.conversation_key));
                        }
                    }
                }
                InboundEvent::Deleted { id } => {
                    let key = state.store.find(id).map(|m| m.conversation_key);
                    if state.store.apply_delete(id) {
                        updates.extend(key.map(EngineUpdate::Conversation));
                    }
                }
                InboundEvent::ReadReceipt { message_ids, reader_id, sender_id, read_at } => {
                    let mut keys: Vec<UserId> = message_ids
                        .iter()
                        .filter_map(|id| state.store.find(*id).map(|m| m.conversation_key))
                        .collect();
                    keys.sort_unstable();
                    keys.dedup();
                    if state.store.apply_read(&message_ids, read_at) > 0 {
                        updates.extend(keys.iter().copied().map(EngineUpdate::Conversation));
                    }
                    let read_by_me = reader_id.map_or(true, |r| r == identity.id);
                    if identity.role == Role::Tutor && read_by_me {
                        let target = sender_id.filter(|s| *s != identity.id).or(keys.first().copied());
                        if let Some(target) = target {
                            if state.directory.apply_read_receipt(target).is_some() {
                                updates.push(EngineUpdate::Directory);
                            }
                        }
                    }
                }
            }
        }
        if refresh {
            self.schedule_directory_refresh();
        }
        for update in updates {
            self.emit(update);
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Sends to the active conversation.
    pub async fn send_message(&self, content: &str, attachments: Vec<Attachment>) -> Result<Message, SyncError> {
        let key = self.active_conversation().ok_or(SyncError::NoConversation)?;
        self.send_to(key, content, attachments).await
    }

    /// Inserts an optimistic entry, then reconciles it with the server's answer.
    /// On failure the entry stays in the log as failed and the error is returned.
    pub async fn send_to(&self, key: UserId, content: &str, attachments: Vec<Attachment>) -> Result<Message, SyncError> {
        let content = content.trim().to_string();
        validate_content(&content, !attachments.is_empty())?;

        let request = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let identity = state.identity.as_ref().ok_or(SyncError::NoConversation)?;
            let addressable = match identity.role {
                Role::Tutor => key != identity.id,
                Role::Student => identity.fixed_conversation() == Some(key),
            };
            if !addressable {
                return Err(SyncError::NoConversation);
            }
            let sender = identity.id;
            let client_id = state.store.begin_send(key, sender, content.clone(), attachments.clone());
            SendRequest { recipient_id: key, content, attachments, client_id }
        };
        self.emit(EngineUpdate::Conversation(key));
        self.dispatch(key, request).await
    }

    /// Re-sends a failed message in place under a fresh correlation token.
    pub async fn retry_send(&self, key: UserId, client_id: &str) -> Result<Message, SyncError> {
        let ticket = self
            .inner
            .state
            .lock()
            .store
            .retry(key, client_id)
            .ok_or_else(|| SyncError::NotFailed { client_id: client_id.to_string() })?;
        self.emit(EngineUpdate::Conversation(key));
        let request = SendRequest {
            recipient_id: key,
            content: ticket.content,
            attachments: ticket.attachments,
            client_id: ticket.client_id,
        };
        self.dispatch(key, request).await
    }

    /// Removes a failed message from the log.
    pub fn discard_failed(&self, key: UserId, client_id: &str) -> bool {
        let removed = self.inner.state.lock().store.discard(key, client_id);
        if removed {
            self.emit(EngineUpdate::Conversation(key));
        }
        removed
    }

    async fn dispatch(&self, key: UserId, request: SendRequest) -> Result<Message, SyncError> {
        let result = self.inner.api.send_message(&request).await;
        let outcome = {
            let mut state = self.inner.state.lock();
            match result {
                Ok(record) => {
                    let id = record.id;
                    let fallback = Message::confirmed(record.clone(), key);
                    let applied = state.store.confirm_send(key, &request.client_id, record);
                    debug!(key, id, ?applied, "send confirmed");
                    Ok(state.store.find(id).cloned().unwrap_or(fallback))
                }
                Err(e) => {
                    warn!(key, "send failed: {e}");
                    state.store.fail_send(key, &request.client_id);
                    Err(e)
                }
            }
        };
        self.emit(EngineUpdate::Conversation(key));
        outcome
    }

    // ── Edit / delete ────────────────────────────────────────────────────────

    /// Edits a message on the server, then locally. Nothing changes locally on failure.
    pub async fn edit_message(&self, id: MessageId, content: &str) -> Result<(), SyncError> {
        let content = content.trim();
        {
            let state = self.inner.state.lock();
            let message = state.store.find(id).ok_or(SyncError::UnknownMessage { id })?;
            validate_content(content, !message.attachments.is_empty())?;
        }
        let record = self.inner.api.edit_message(id, content).await?;
        let key = {
            let mut state = self.inner.state.lock();
            state.store.apply_edit(MessagePatch::from(record));
            state.store.find(id).map(|m| m.conversation_key)
        };
        if let Some(key) = key {
            self.emit(EngineUpdate::Conversation(key));
        }
        Ok(())
    }

    /// Deletes a message on the server, then locally. Nothing changes locally on failure.
    pub async fn delete_message(&self, id: MessageId) -> Result<(), SyncError> {
        let key = self
            .inner
            .state
            .lock()
            .store
            .find(id)
            .map(|m| m.conversation_key)
            .ok_or(SyncError::UnknownMessage { id })?;
        self.inner.api.delete_message(id).await?;
        if self.inner.state.lock().store.apply_delete(id) {
            self.emit(EngineUpdate::Conversation(key));
        }
        Ok(())
    }

    // ── Read tracking ────────────────────────────────────────────────────────

    /// Samples the viewport of the active conversation and sends any read
    /// acknowledgements that became due. Returns how many were acknowledged.
    ///
    /// Call this whenever the viewport changes and periodically while it is shown.
    pub async fn observe_viewport(&self, probe: &dyn VisibilityProbe) -> usize {
        let now = Instant::now();
        let (key, due) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let (Some(me), Some(key)) = (state.identity.as_ref().map(|i| i.id), state.active_key()) else {
                return 0;
            };
            state.tracker.set_conversation(Some(key));
            let visible = state.store.visible(key);
            let decision = state.tracker.sample(now, &visible, me, probe);
            let mut due = decision.acknowledge;
            if decision.mark_all {
                debug!(key, "marking whole conversation read");
                let unread = state.store.unread_inbound(key, me);
                due.extend(state.tracker.claim(unread));
            }
            (key, due)
        };
        if due.is_empty() {
            return 0;
        }

        let mut acknowledged = Vec::with_capacity(due.len());
        for id in due {
            match self.inner.api.mark_read(id).await {
                Ok(()) => acknowledged.push(id),
                Err(e) => {
                    warn!(id, "read acknowledgement failed: {e}");
                    self.inner.state.lock().tracker.forget(id);
                }
            }
        }
        if acknowledged.is_empty() {
            return 0;
        }

        {
            let mut state = self.inner.state.lock();
            state.store.apply_read(&acknowledged, Utc::now());
            state.directory.apply_read_receipt(key);
        }
        self.emit(EngineUpdate::Conversation(key));
        self.emit(EngineUpdate::Directory);
        // Local zeroing is an estimate; reconcile with the server's counters.
        if self.identity().is_some_and(|i| i.role == Role::Tutor) {
            self.schedule_directory_refresh();
        }
        acknowledged.len()
    }

    // ── Notifications ────────────────────────────────────────────────────────

    pub async fn mark_notification_read(&self, id: &str) -> bool {
        let found = self.inner.state.lock().notifications.mark_read(id);
        if !found {
            return false;
        }
        self.emit(EngineUpdate::Notifications);
        if let Err(e) = self.inner.api.mark_notification_read(id).await {
            warn!(id, "failed to mark notification read on server: {e}");
        }
        true
    }

    pub async fn clear_notifications(&self) {
        self.inner.state.lock().notifications.clear();
        self.emit(EngineUpdate::Notifications);
        if let Err(e) = self.inner.api.clear_notifications().await {
            warn!("failed to clear notifications on server: {e}");
        }
    }

    /// Closes every connection and cancels pending background work.
    pub fn shutdown(&self) {
        self.inner.directory_refresh.cancel();
        self.inner.history.invalidate();
        self.inner.registry.release_all();
    }
}

fn validate_content(content: &str, has_attachments: bool) -> Result<(), SyncError> {
    if content.is_empty() && !has_attachments {
        return Err(SyncError::EmptyMessage);
    }
    let length = content.chars().count();
    if length > MAX_MESSAGE_LENGTH {
        return Err(SyncError::FieldTooLong {
            field_name: "content".to_string(),
            max_length: MAX_MESSAGE_LENGTH,
            actual_length: length,
        });
    }
    Ok(())
}
