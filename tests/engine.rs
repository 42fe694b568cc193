use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep, timeout};

use tutor_chat_sync::models::{
    DirectorySnapshot, Group, MessageId, MessageRecord, MessageState, SendRequest, Student, UserId,
};
use tutor_chat_sync::wire::InboundEvent;
use tutor_chat_sync::{
    AlwaysVisible, ChatApi, ClientConfig, EngineUpdate, Identity, SyncEngine, SyncError, VisibilityProbe,
};

const TUTOR: UserId = 100;
const STUDENT: UserId = 42;
const WAIT: Duration = Duration::from_secs(5);

// ── In-memory server ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Backend {
    next_id: MessageId,
    snapshot: DirectorySnapshot,
    dialogs: HashMap<UserId, Vec<MessageRecord>>,
    dialog_delay: HashMap<UserId, Duration>,
    sent: Vec<SendRequest>,
    fail_sends: usize,
    send_gate: Option<Arc<Notify>>,
    fail_edits: bool,
    edited: Vec<(MessageId, String)>,
    deleted: Vec<MessageId>,
    read: Vec<MessageId>,
    fail_reads: usize,
    list_calls: usize,
    notifications_read: Vec<String>,
    notifications_cleared: usize,
}

struct MockApi {
    me: UserId,
    backend: Mutex<Backend>,
}

impl MockApi {
    fn new(me: UserId) -> Arc<Self> {
        Arc::new(Self { me, backend: Mutex::new(Backend { next_id: 1000, ..Backend::default() }) })
    }

    fn rejected(endpoint: &str) -> SyncError {
        SyncError::Rejected { endpoint: endpoint.to_string(), status: 500 }
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn list_groups(&self) -> Result<DirectorySnapshot, SyncError> {
        let mut backend = self.backend.lock();
        backend.list_calls += 1;
        Ok(backend.snapshot.clone())
    }

    async fn fetch_dialog(&self, counterpart: UserId) -> Result<Vec<MessageRecord>, SyncError> {
        let delay = self.backend.lock().dialog_delay.get(&counterpart).copied();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        Ok(self.backend.lock().dialogs.get(&counterpart).cloned().unwrap_or_default())
    }

    async fn send_message(&self, request: &SendRequest) -> Result<MessageRecord, SyncError> {
        let gate = {
            let mut backend = self.backend.lock();
            backend.sent.push(request.clone());
            if backend.fail_sends > 0 {
                backend.fail_sends -= 1;
                return Err(Self::rejected("send"));
            }
            backend.send_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut backend = self.backend.lock();
        backend.next_id += 1;
        Ok(MessageRecord {
            id: backend.next_id,
            client_id: Some(request.client_id.clone()),
            sender_id: self.me,
            recipient_id: Some(request.recipient_id),
            content: request.content.clone(),
            attachments: request.attachments.clone(),
            created_at: Utc::now(),
            read_at: None,
        })
    }

    async fn edit_message(&self, id: MessageId, content: &str) -> Result<MessageRecord, SyncError> {
        let mut backend = self.backend.lock();
        if backend.fail_edits {
            return Err(Self::rejected("edit"));
        }
        backend.edited.push((id, content.to_string()));
        Ok(MessageRecord {
            id,
            client_id: None,
            sender_id: self.me,
            recipient_id: None,
            content: content.to_string(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            read_at: None,
        })
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), SyncError> {
        self.backend.lock().deleted.push(id);
        Ok(())
    }

    async fn mark_read(&self, id: MessageId) -> Result<(), SyncError> {
        let mut backend = self.backend.lock();
        if backend.fail_reads > 0 {
            backend.fail_reads -= 1;
            return Err(Self::rejected("read"));
        }
        backend.read.push(id);
        let sender = backend.dialogs.values().flatten().find(|r| r.id == id).map(|r| r.sender_id);
        if let Some(sender) = sender {
            for student in backend.snapshot.roster.values_mut().flatten().filter(|s| s.id == sender) {
                student.unread_count = student.unread_count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn mark_notification_read(&self, id: &str) -> Result<(), SyncError> {
        self.backend.lock().notifications_read.push(id.to_string());
        Ok(())
    }

    async fn clear_notifications(&self) -> Result<(), SyncError> {
        self.backend.lock().notifications_cleared += 1;
        Ok(())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn record(id: MessageId, sender: UserId, recipient: UserId, content: &str, minute: u32) -> MessageRecord {
    MessageRecord {
        id,
        client_id: None,
        sender_id: sender,
        recipient_id: Some(recipient),
        content: content.to_string(),
        attachments: Vec::new(),
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
        read_at: None,
    }
}

fn student(id: UserId, unread: u32) -> Student {
    Student { id, full_name: format!("Student {id}"), photo: None, hemis_id: None, unread_count: unread }
}

fn snapshot(groups: &[(&str, Vec<Student>)]) -> DirectorySnapshot {
    let mut snapshot = DirectorySnapshot::default();
    for (id, students) in groups {
        snapshot.groups.push(Group { id: id.to_string(), name: id.to_uppercase(), unread_count: 0 });
        snapshot.roster.insert(id.to_string(), students.clone());
    }
    snapshot
}

/// Sockets point at a port nobody listens on; live events are injected directly.
fn offline_config() -> ClientConfig {
    let mut config = ClientConfig::new("http://127.0.0.1:9").unwrap();
    config.reconnect_backoff = Duration::from_secs(3600);
    config.refresh_debounce = Duration::from_millis(20);
    config
}

async fn student_engine(api: &Arc<MockApi>) -> SyncEngine {
    let engine = SyncEngine::new(offline_config(), api.clone());
    engine.set_identity(Some(Identity::student(STUDENT, Some(TUTOR)))).await.unwrap();
    engine
}

async fn tutor_engine(api: &Arc<MockApi>) -> SyncEngine {
    let engine = SyncEngine::new(offline_config(), api.clone());
    engine.set_identity(Some(Identity::tutor(TUTOR))).await.unwrap();
    engine
}

struct Viewport {
    visible: Vec<MessageId>,
    bottom: f32,
}

impl VisibilityProbe for Viewport {
    fn visible_fraction(&self, id: MessageId) -> Option<f32> {
        self.visible.contains(&id).then_some(1.0)
    }

    fn distance_from_bottom(&self) -> f32 {
        self.bottom
    }
}

async fn watch(engine: &SyncEngine, probe: &dyn VisibilityProbe, total: Duration) -> usize {
    let step = Duration::from_millis(100);
    let mut acknowledged = 0;
    let mut elapsed = Duration::ZERO;
    while elapsed <= total {
        acknowledged += engine.observe_viewport(probe).await;
        sleep(step).await;
        elapsed += step;
    }
    acknowledged
}

// ── Sending ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn confirmed_send_leaves_exactly_one_entry() {
    let api = MockApi::new(TUTOR);
    api.backend.lock().snapshot = snapshot(&[("g1", vec![student(STUDENT, 0)])]);
    let engine = tutor_engine(&api).await;
    engine.open_conversation(STUDENT).await.unwrap();

    let sent = engine.send_message("  Hello ", Vec::new()).await.unwrap();

    let log = engine.messages(STUDENT);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].state, MessageState::Confirmed);
    assert_eq!(log[0].content, "Hello");
    assert_eq!(log[0].id, sent.id);
    assert_eq!(log[0].client_id.as_deref(), Some(api.backend.lock().sent[0].client_id.as_str()));
}

#[tokio::test]
async fn failed_send_stays_visible_and_retries_in_place() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().fail_sends = 1;
    let engine = student_engine(&api).await;

    let err = engine.send_message("Hello", Vec::new()).await.unwrap_err();
    assert!(err.is_rejected());
    let log = engine.messages(TUTOR);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].state, MessageState::Failed);
    assert_eq!(log[0].content, "Hello");

    let failed_token = log[0].client_id.clone().unwrap();
    let confirmed = engine.retry_send(TUTOR, &failed_token).await.unwrap();

    let log = engine.messages(TUTOR);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].state, MessageState::Confirmed);
    assert_eq!(log[0].id, confirmed.id);

    let sent = api.backend.lock().sent.clone();
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].client_id, sent[1].client_id);
    assert_eq!(sent[1].content, "Hello");

    assert!(matches!(engine.retry_send(TUTOR, &failed_token).await, Err(SyncError::NotFailed { .. })));
}

#[tokio::test]
async fn failed_send_can_be_discarded() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().fail_sends = 1;
    let engine = student_engine(&api).await;

    assert!(engine.send_message("oops", Vec::new()).await.is_err());
    let token = engine.messages(TUTOR)[0].client_id.clone().unwrap();
    assert!(engine.discard_failed(TUTOR, &token));
    assert!(!engine.discard_failed(TUTOR, &token));
    assert!(engine.messages(TUTOR).is_empty());
}

#[tokio::test]
async fn echo_of_a_failed_send_settles_it_in_place() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().fail_sends = 1;
    let engine = student_engine(&api).await;

    // The server stored the message even though the response was lost.
    engine.send_message("Hello", Vec::new()).await.unwrap_err();
    let token = engine.messages(TUTOR)[0].client_id.clone().unwrap();
    engine.apply_event(InboundEvent::NewMessage(MessageRecord {
        client_id: Some(token.clone()),
        ..record(1001, STUDENT, TUTOR, "Hello", 0)
    }));

    let log = engine.messages(TUTOR);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].state, MessageState::Confirmed);
    assert_eq!(log[0].id, Some(1001));
    assert!(matches!(engine.retry_send(TUTOR, &token).await, Err(SyncError::NotFailed { .. })));
}

#[tokio::test]
async fn live_echo_before_response_does_not_duplicate() {
    let api = MockApi::new(STUDENT);
    let gate = Arc::new(Notify::new());
    api.backend.lock().send_gate = Some(gate.clone());
    let engine = student_engine(&api).await;

    let sending = tokio::spawn({
        let engine = engine.clone();
        async move { engine.send_message("Hi there", Vec::new()).await }
    });
    timeout(WAIT, async {
        while engine.messages(TUTOR).is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Echo without a client id: only the weak content match links it.
    engine.apply_event(InboundEvent::NewMessage(MessageRecord {
        id: 1001,
        client_id: None,
        sender_id: STUDENT,
        recipient_id: Some(TUTOR),
        content: "Hi there".into(),
        attachments: Vec::new(),
        created_at: Utc::now(),
        read_at: None,
    }));
    assert_eq!(engine.messages(TUTOR).len(), 1);

    gate.notify_one();
    let confirmed = sending.await.unwrap().unwrap();
    assert_eq!(confirmed.id, Some(1001));

    let log = engine.messages(TUTOR);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, Some(1001));
    assert_eq!(log[0].state, MessageState::Confirmed);
}

#[tokio::test]
async fn invalid_or_unaddressable_sends_are_rejected_without_side_effects() {
    let api = MockApi::new(STUDENT);
    let engine = student_engine(&api).await;

    assert!(matches!(engine.send_message("   ", Vec::new()).await, Err(SyncError::EmptyMessage)));
    let long = "x".repeat(4001);
    assert!(matches!(
        engine.send_message(&long, Vec::new()).await,
        Err(SyncError::FieldTooLong { actual_length: 4001, .. })
    ));
    assert!(matches!(engine.send_to(7, "hi", Vec::new()).await, Err(SyncError::NoConversation)));
    assert!(engine.messages(TUTOR).is_empty());
    assert!(api.backend.lock().sent.is_empty());

    let orphan = SyncEngine::new(offline_config(), MockApi::new(5));
    orphan.set_identity(Some(Identity::student(5, None))).await.unwrap();
    assert_eq!(orphan.active_conversation(), None);
    assert!(matches!(orphan.send_message("hi", Vec::new()).await, Err(SyncError::NoConversation)));
}

// ── Live events ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_push_is_applied_once() {
    let api = MockApi::new(STUDENT);
    let engine = student_engine(&api).await;

    let push = InboundEvent::NewMessage(record(55, TUTOR, STUDENT, "Hi", 0));
    engine.apply_event(push.clone());
    engine.apply_event(push);

    let log = engine.messages(TUTOR);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, Some(55));
}

#[tokio::test]
async fn out_of_order_pushes_render_by_timestamp() {
    let api = MockApi::new(STUDENT);
    let engine = student_engine(&api).await;

    for (id, minute) in [(3, 30), (1, 10), (2, 20)] {
        engine.apply_event(InboundEvent::NewMessage(record(id, TUTOR, STUDENT, "m", minute)));
    }
    let ids: Vec<_> = engine.messages(TUTOR).iter().filter_map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn delete_event_hides_message_and_repeats_are_noops() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().dialogs.insert(TUTOR, vec![record(6, TUTOR, STUDENT, "keep", 0), record(7, TUTOR, STUDENT, "gone", 1)]);
    let engine = student_engine(&api).await;
    assert_eq!(engine.messages(TUTOR).len(), 2);

    engine.apply_event(InboundEvent::Deleted { id: 7 });
    let after_first = engine.messages(TUTOR);
    engine.apply_event(InboundEvent::Deleted { id: 7 });
    assert_eq!(engine.messages(TUTOR), after_first);
    assert_eq!(after_first.iter().filter_map(|m| m.id).collect::<Vec<_>>(), vec![6]);

    // A late duplicate of the deleted message stays hidden.
    engine.apply_event(InboundEvent::NewMessage(record(7, TUTOR, STUDENT, "gone", 1)));
    assert_eq!(engine.messages(TUTOR).len(), 1);
}

#[tokio::test]
async fn edits_and_deletes_for_unknown_ids_change_nothing() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().dialogs.insert(TUTOR, vec![record(6, TUTOR, STUDENT, "hello", 0)]);
    let engine = student_engine(&api).await;
    let before = engine.messages(TUTOR);

    engine.apply_event(InboundEvent::Deleted { id: 999 });
    engine.apply_event(InboundEvent::Edited(record(999, TUTOR, STUDENT, "x", 0).into()));
    assert_eq!(engine.messages(TUTOR), before);

    assert!(matches!(engine.delete_message(999).await, Err(SyncError::UnknownMessage { id: 999 })));
    assert!(matches!(engine.edit_message(999, "x").await, Err(SyncError::UnknownMessage { id: 999 })));
    assert!(api.backend.lock().deleted.is_empty());
}

#[tokio::test]
async fn edit_and_delete_apply_after_the_server_accepts() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().dialogs.insert(TUTOR, vec![record(6, STUDENT, TUTOR, "helo", 0)]);
    let engine = student_engine(&api).await;

    api.backend.lock().fail_edits = true;
    assert!(engine.edit_message(6, "hello").await.is_err());
    assert_eq!(engine.messages(TUTOR)[0].content, "helo");

    api.backend.lock().fail_edits = false;
    engine.edit_message(6, "hello").await.unwrap();
    assert_eq!(engine.messages(TUTOR)[0].content, "hello");

    engine.delete_message(6).await.unwrap();
    assert!(engine.messages(TUTOR).is_empty());
    assert_eq!(api.backend.lock().deleted, vec![6]);
}

// ── Directory ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_receipt_zeroes_student_and_reduces_group_by_prior_count() {
    let api = MockApi::new(TUTOR);
    api.backend.lock().snapshot = snapshot(&[("g1", vec![student(STUDENT, 3), student(43, 1)])]);
    let engine = tutor_engine(&api).await;
    assert_eq!(engine.selected_group().as_deref(), Some("g1"));
    assert_eq!(engine.groups()[0].unread_count, 4);

    // A student reading the tutor's messages does not touch the tutor's counters.
    engine.apply_event(InboundEvent::ReadReceipt {
        message_ids: Vec::new(),
        reader_id: Some(43),
        sender_id: Some(TUTOR),
        read_at: Utc::now(),
    });
    assert_eq!(engine.groups()[0].unread_count, 4);

    engine.apply_event(InboundEvent::ReadReceipt {
        message_ids: Vec::new(),
        reader_id: Some(TUTOR),
        sender_id: Some(STUDENT),
        read_at: Utc::now(),
    });
    assert_eq!(engine.unread_count(STUDENT), 0);
    assert_eq!(engine.unread_count(43), 1);
    assert_eq!(engine.groups()[0].unread_count, 1);
}

#[tokio::test]
async fn push_for_another_conversation_refreshes_directory() {
    let api = MockApi::new(TUTOR);
    api.backend.lock().snapshot = snapshot(&[("g1", vec![student(STUDENT, 0), student(43, 0)])]);
    let engine = tutor_engine(&api).await;
    engine.open_conversation(STUDENT).await.unwrap();
    let calls_before = api.backend.lock().list_calls;

    api.backend.lock().snapshot = snapshot(&[("g1", vec![student(STUDENT, 0), student(43, 1)])]);
    engine.apply_event(InboundEvent::NewMessage(record(5, 43, TUTOR, "ping", 0)));
    engine.apply_event(InboundEvent::NewMessage(record(6, 43, TUTOR, "ping again", 1)));

    timeout(WAIT, async {
        while engine.unread_count(43) != 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // Both pushes collapse into one debounced refresh.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(api.backend.lock().list_calls, calls_before + 1);
    assert_eq!(engine.messages(43).len(), 2);
}

#[tokio::test]
async fn switching_groups_clears_conversations() {
    let api = MockApi::new(TUTOR);
    {
        let mut backend = api.backend.lock();
        backend.snapshot = snapshot(&[("g1", vec![student(STUDENT, 0)]), ("g2", vec![student(43, 0)])]);
        backend.dialogs.insert(STUDENT, vec![record(1, STUDENT, TUTOR, "hi", 0)]);
    }
    let engine = tutor_engine(&api).await;
    engine.open_conversation(STUDENT).await.unwrap();
    assert_eq!(engine.messages(STUDENT).len(), 1);

    assert!(!engine.select_group("nope"));
    assert!(engine.select_group("g2"));
    assert_eq!(engine.active_conversation(), None);
    assert!(engine.messages(STUDENT).is_empty());
    assert_eq!(engine.students("g2")[0].id, 43);
}

#[tokio::test]
async fn stale_history_is_dropped_after_switching() {
    let api = MockApi::new(TUTOR);
    {
        let mut backend = api.backend.lock();
        backend.snapshot = snapshot(&[("g1", vec![student(STUDENT, 0), student(43, 0)])]);
        backend.dialogs.insert(STUDENT, vec![record(1, STUDENT, TUTOR, "old", 0)]);
        backend.dialogs.insert(43, vec![record(2, 43, TUTOR, "new", 0)]);
        backend.dialog_delay.insert(STUDENT, Duration::from_millis(200));
    }
    let engine = tutor_engine(&api).await;

    let slow = tokio::spawn({
        let engine = engine.clone();
        async move { engine.open_conversation(STUDENT).await }
    });
    sleep(Duration::from_millis(20)).await;
    engine.open_conversation(43).await.unwrap();
    slow.await.unwrap().unwrap();

    assert_eq!(engine.active_conversation(), Some(43));
    assert!(engine.messages(STUDENT).is_empty());
    assert_eq!(engine.messages(43).len(), 1);
}

#[tokio::test]
async fn logout_drops_everything() {
    let api = MockApi::new(TUTOR);
    {
        let mut backend = api.backend.lock();
        backend.snapshot = snapshot(&[("g1", vec![student(STUDENT, 2)])]);
        backend.dialogs.insert(STUDENT, vec![record(1, STUDENT, TUTOR, "hi", 0)]);
    }
    let engine = tutor_engine(&api).await;
    engine.open_conversation(STUDENT).await.unwrap();

    engine.set_identity(None).await.unwrap();
    assert_eq!(engine.identity(), None);
    assert!(engine.groups().is_empty());
    assert!(engine.messages(STUDENT).is_empty());
    assert_eq!(engine.active_conversation(), None);
}

// ── Read tracking ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sustained_visibility_sends_one_read_ack() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().dialogs.insert(TUTOR, vec![record(9, TUTOR, STUDENT, "read me", 0)]);
    let engine = student_engine(&api).await;

    let viewport = Viewport { visible: vec![9], bottom: 1000.0 };
    let acknowledged = watch(&engine, &viewport, Duration::from_millis(5500)).await;

    assert_eq!(acknowledged, 1);
    assert_eq!(api.backend.lock().read, vec![9]);
    assert!(engine.messages(TUTOR)[0].read_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_read_ack_is_retried() {
    let api = MockApi::new(STUDENT);
    {
        let mut backend = api.backend.lock();
        backend.dialogs.insert(TUTOR, vec![record(9, TUTOR, STUDENT, "read me", 0)]);
        backend.fail_reads = 1;
    }
    let engine = student_engine(&api).await;

    let viewport = Viewport { visible: vec![9], bottom: 1000.0 };
    watch(&engine, &viewport, Duration::from_secs(4)).await;

    assert_eq!(api.backend.lock().read, vec![9]);
}

#[tokio::test(start_paused = true)]
async fn settling_at_bottom_marks_whole_conversation_read_once() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().dialogs.insert(
        TUTOR,
        vec![
            record(9, TUTOR, STUDENT, "one", 0),
            record(10, TUTOR, STUDENT, "two", 1),
            record(11, STUDENT, TUTOR, "mine", 2),
        ],
    );
    let engine = student_engine(&api).await;

    // Nothing individually visible, but the log sits at the bottom.
    let viewport = Viewport { visible: Vec::new(), bottom: 0.0 };
    watch(&engine, &viewport, Duration::from_secs(5)).await;

    let mut read = api.backend.lock().read.clone();
    read.sort_unstable();
    assert_eq!(read, vec![9, 10]);
}

#[tokio::test(start_paused = true)]
async fn dwell_and_settle_together_ack_each_message_once() {
    let api = MockApi::new(STUDENT);
    api.backend.lock().dialogs.insert(
        TUTOR,
        vec![record(9, TUTOR, STUDENT, "one", 0), record(10, TUTOR, STUDENT, "two", 1)],
    );
    let engine = student_engine(&api).await;

    // At the bottom from the start; the messages come into view just before
    // the settle rule fires, so both rules see them.
    let hidden = Viewport { visible: Vec::new(), bottom: 0.0 };
    watch(&engine, &hidden, Duration::from_millis(900)).await;
    let shown = Viewport { visible: vec![9, 10], bottom: 0.0 };
    watch(&engine, &shown, Duration::from_secs(5)).await;

    let mut read = api.backend.lock().read.clone();
    read.sort_unstable();
    assert_eq!(read, vec![9, 10]);
}

#[tokio::test(start_paused = true)]
async fn tutor_read_ack_clears_directory_counter() {
    let api = MockApi::new(TUTOR);
    {
        let mut backend = api.backend.lock();
        backend.snapshot = snapshot(&[("g1", vec![student(STUDENT, 1), student(43, 2)])]);
        backend.dialogs.insert(STUDENT, vec![record(9, STUDENT, TUTOR, "question", 0)]);
    }
    let engine = tutor_engine(&api).await;
    engine.open_conversation(STUDENT).await.unwrap();

    watch(&engine, &AlwaysVisible, Duration::from_secs(3)).await;

    assert_eq!(api.backend.lock().read, vec![9]);
    assert_eq!(engine.unread_count(STUDENT), 0);
    assert_eq!(engine.groups()[0].unread_count, 2);
}

// ── Live sockets ─────────────────────────────────────────────────────────────

async fn push_server() -> (SocketAddr, oneshot::Sender<()>) {
    async fn chat(ws: WebSocketUpgrade, Path(counterpart): Path<UserId>) -> impl IntoResponse {
        let frame = json!({
            "type": "new-message",
            "message": {
                "id": 77,
                "sender": { "id": counterpart },
                "recipient": STUDENT,
                "content": "Hi",
                "timestamp": "2024-03-01T09:00:00Z"
            }
        });
        ws.on_upgrade(move |socket| greet(socket, vec![frame.to_string()]))
    }

    async fn notify(ws: WebSocketUpgrade) -> impl IntoResponse {
        let frames = vec![
            json!({
                "type": "notification",
                "data": { "id": 7, "payload": { "title": "Deadline moved" }, "is_read": false }
            })
            .to_string(),
            "maintenance tonight".to_string(),
            // Chat-typed but not a message.
            json!({ "type": "message", "data": { "id": 8 } }).to_string(),
        ];
        ws.on_upgrade(move |socket| greet(socket, frames))
    }

    async fn greet(socket: WebSocket, frames: Vec<String>) {
        let (mut sender, mut receiver) = socket.split();
        for frame in frames {
            if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                return;
            }
        }
        while let Some(Ok(_)) = receiver.next().await {}
    }

    let router = Router::new()
        .route("/ws/chat/{counterpart}/", get(chat))
        .route("/ws/notify/", get(notify));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    (addr, shutdown_tx)
}

#[tokio::test]
async fn pushes_arrive_through_live_channels() {
    let (addr, _shutdown) = push_server().await;
    let mut config = offline_config();
    config.ws_base_url = format!("ws://{addr}");
    let api = MockApi::new(STUDENT);
    let engine = SyncEngine::new(config, api.clone());
    let mut updates = engine.subscribe();

    engine.set_identity(Some(Identity::student(STUDENT, Some(TUTOR)))).await.unwrap();

    timeout(WAIT, async {
        while engine.messages(TUTOR).is_empty() || engine.notifications().len() < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(engine.is_chat_connected());

    let log = engine.messages(TUTOR);
    assert_eq!(log[0].id, Some(77));
    assert_eq!(log[0].content, "Hi");

    // Newest first: the malformed chat frame, the plain text, then the notification.
    let notes = engine.notifications();
    assert_eq!(notes.len(), 3);
    assert_eq!(notes[0].id, "8");
    assert_eq!(notes[1].payload, json!("maintenance tonight"));
    assert_eq!(notes[2].id, "7");
    assert_eq!(notes[2].payload, json!({ "title": "Deadline moved" }));
    assert_eq!(engine.unread_notifications(), 3);
    assert!(engine.mark_notification_read("7").await);
    assert!(!engine.mark_notification_read("missing").await);
    assert_eq!(engine.unread_notifications(), 2);
    engine.clear_notifications().await;
    assert!(engine.notifications().is_empty());
    {
        let backend = api.backend.lock();
        assert_eq!(backend.notifications_read, vec!["7".to_string()]);
        assert_eq!(backend.notifications_cleared, 1);
    }

    let mut saw_open = false;
    while let Ok(update) = updates.try_recv() {
        saw_open |= matches!(update, EngineUpdate::Connection { open: true, .. });
    }
    assert!(saw_open);
    engine.shutdown();
    assert!(!engine.is_chat_connected());
}
