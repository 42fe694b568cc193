use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use super::ConnectionDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Close,
    Error,
    Message,
}

/// An inbound frame. Text that is not JSON is passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Raw(String),
}

impl Payload {
    fn parse(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    /// The socket went away, either unexpectedly or through [`Connection::close`].
    Close,
    Error(String),
    Message(Payload),
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Open => EventKind::Open,
            TransportEvent::Close => EventKind::Close,
            TransportEvent::Error(_) => EventKind::Error,
            TransportEvent::Message(_) => EventKind::Message,
        }
    }
}

type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Handle to one reconnecting WebSocket. Clones share the same socket.
///
/// Must be opened from within a Tokio runtime.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    descriptor: ConnectionDescriptor,
    url: String,
    backoff: Duration,
    next_listener: AtomicU64,
    listeners: Mutex<Vec<(u64, EventKind, Listener)>>,
    link: Mutex<Link>,
}

#[derive(Default)]
struct Link {
    /// Present only while the socket is open.
    outbound: Option<mpsc::UnboundedSender<String>>,
    session: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    closed_by_caller: bool,
    /// Bumped per session so a stale session cannot touch newer state.
    generation: u64,
}

impl Connection {
    /// Starts connecting immediately and keeps reconnecting until [`close`](Self::close).
    pub fn open(descriptor: ConnectionDescriptor, token: Option<&str>, backoff: Duration) -> Self {
        let inner = Arc::new(Inner {
            url: descriptor.url(token),
            descriptor,
            backoff,
            next_listener: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            link: Mutex::new(Link::default()),
        });
        inner.start_session();
        Connection { inner }
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.inner.descriptor
    }

    pub fn is_open(&self) -> bool {
        let link = self.inner.link.lock();
        !link.closed_by_caller && link.outbound.is_some()
    }

    /// Whether [`close`](Self::close) has been called on any clone of this handle.
    pub fn is_closed(&self) -> bool {
        self.inner.link.lock().closed_by_caller
    }

    /// Serializes `payload` and queues it. Returns `false` if the socket is not open.
    pub fn send(&self, payload: &Value) -> bool {
        let text = payload.to_string();
        match &self.inner.link.lock().outbound {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    /// Registers a listener. Listeners run synchronously, in subscription order,
    /// on the task that received the event.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Unsubscribe
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, kind, Arc::new(callback)));
        Unsubscribe { inner: Arc::downgrade(&self.inner), id }
    }

    /// Closes the socket and suppresses any further reconnect.
    pub fn close(&self) {
        let timer = {
            let mut link = self.inner.link.lock();
            if link.closed_by_caller {
                return;
            }
            link.closed_by_caller = true;
            link.generation += 1;
            // Dropping the sender ends the session loop, which sends a close frame.
            link.outbound = None;
            link.session = None;
            link.reconnect_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        info!(endpoint = %self.inner.descriptor, "connection closed by caller");
        self.inner.emit(&TransportEvent::Close);
    }
}

/// Removes a listener registered with [`Connection::on`].
pub struct Unsubscribe {
    inner: Weak<Inner>,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().retain(|(id, _, _)| *id != self.id);
        }
    }
}

impl Inner {
    fn emit(&self, event: &TransportEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn start_session(self: &Arc<Self>) {
        let mut link = self.link.lock();
        if link.closed_by_caller {
            return;
        }
        link.generation += 1;
        let generation = link.generation;
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(endpoint = %self.descriptor, generation, "connecting");
        link.session = Some(tokio::spawn(run_session(
            Arc::downgrade(self),
            self.url.clone(),
            generation,
            tx,
            rx,
        )));
    }

    /// Publishes the outbound sender once the handshake completes.
    fn mark_open(&self, generation: u64, tx: mpsc::UnboundedSender<String>) -> bool {
        let mut link = self.link.lock();
        if link.closed_by_caller || link.generation != generation {
            return false;
        }
        link.outbound = Some(tx);
        true
    }

    /// Every attempt ends here, including one that never connected, so
    /// listeners see `Close` after each failed connect as well.
    fn session_ended(self: &Arc<Self>, generation: u64) {
        {
            let mut link = self.link.lock();
            if link.closed_by_caller || link.generation != generation {
                return;
            }
            link.outbound = None;
            link.session = None;
        }
        warn!(endpoint = %self.descriptor, "connection ended");
        self.emit(&TransportEvent::Close);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut link = self.link.lock();
        if link.closed_by_caller {
            return;
        }
        if link.reconnect_timer.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!(endpoint = %self.descriptor, "reconnect already scheduled");
            return;
        }
        info!(endpoint = %self.descriptor, backoff_ms = self.backoff.as_millis() as u64, "scheduling reconnect");
        let weak = Arc::downgrade(self);
        let backoff = self.backoff;
        link.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect();
            }
        }));
    }

    fn reconnect(self: &Arc<Self>) {
        {
            let mut link = self.link.lock();
            link.reconnect_timer = None;
            if link.closed_by_caller || link.outbound.is_some() {
                return;
            }
        }
        self.start_session();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let link = self.link.get_mut();
        if let Some(timer) = link.reconnect_timer.take() {
            timer.abort();
        }
        link.outbound = None;
    }
}

async fn run_session(
    weak: Weak<Inner>,
    url: String,
    generation: u64,
    tx: mpsc::UnboundedSender<String>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    match connect_async(url.as_str()).await {
        Ok((socket, _)) => {
            match weak.upgrade() {
                Some(inner) if inner.mark_open(generation, tx) => {
                    info!(endpoint = %inner.descriptor, "connection open");
                    inner.emit(&TransportEvent::Open);
                }
                _ => return,
            }

            let (mut sink, mut stream) = socket.split();
            loop {
                tokio::select! {
                    outgoing = outbound.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                                warn!("send failed: {e}");
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    incoming = stream.next() => {
                        let event = match incoming {
                            Some(Ok(WsMessage::Text(text))) => TransportEvent::Message(Payload::parse(text)),
                            Some(Ok(WsMessage::Binary(bytes))) => {
                                TransportEvent::Message(Payload::parse(String::from_utf8_lossy(&bytes).into_owned()))
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                debug!(?frame, "server closed the socket");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => TransportEvent::Error(e.to_string()),
                            None => break,
                        };
                        let Some(inner) = weak.upgrade() else { return };
                        let fatal = matches!(event, TransportEvent::Error(_));
                        inner.emit(&event);
                        if fatal {
                            break;
                        }
                    }
                }
            }
        }
        Err(e) => {
            if let Some(inner) = weak.upgrade() {
                warn!(endpoint = %inner.descriptor, "connect failed: {e}");
                inner.emit(&TransportEvent::Error(e.to_string()));
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.session_ended(generation);
    }
}
