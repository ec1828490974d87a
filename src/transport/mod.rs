//! Transport Connection Manager.
//!
//! Owns the single push connection for the active credential, fans inbound
//! frames out to named-event handlers and correlates request acknowledgements.
//! Reconnection is left to the underlying [`PushTransport`]; the manager only
//! mirrors what the transport reports into [`ConnectionState`].

pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::events::{ACK_EVENT, Frame};
use crate::error::{Result, SyncError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub connected: bool,
    /// True from `connect` until the first connect, a terminal error, a
    /// terminal disconnect or the connect guard firing.
    pub loading: bool,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    /// Successful connects so far; anything above one is a reconnect.
    pub connects: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server sent a close frame.
    ServerClosed,
    /// Local teardown.
    ClientClosed,
    /// Stream ended without a close handshake.
    TransportClosed,
    /// Keepalive ping went unanswered.
    PingTimeout,
    TransportError(String),
}

impl DisconnectReason {
    /// Conditions after which dependents should stop waiting for the socket.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisconnectReason::ServerClosed | DisconnectReason::TransportClosed)
    }

    /// Whether the transport's own reconnection should kick in.
    pub fn will_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::ServerClosed | DisconnectReason::ClientClosed)
    }
}

/// What a transport reports back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected(DisconnectReason),
    Error(String),
    Frame(Frame),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Frame),
    Close,
}

/// Outbound half handed back by [`PushTransport::open`].
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

/// A push transport that connects on its own task and keeps itself alive.
pub trait PushTransport: Send + Sync + 'static {
    fn open(&self, credential: &str, signals: mpsc::UnboundedSender<TransportSignal>) -> TransportLink;
}

type Handler = Arc<dyn Fn(&Frame) + Send + Sync>;

#[derive(Default)]
struct HandlerRegistry {
    next_id: u64,
    by_event: HashMap<String, Vec<(u64, Handler)>>,
}

pub struct Connection {
    credential: String,
    state: watch::Sender<ConnectionState>,
    handlers: Mutex<HandlerRegistry>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_ack: AtomicU64,
    outbound: mpsc::UnboundedSender<Outbound>,
    guard: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().by_event.values().map(Vec::len).sum()
    }

    /// Registers `handler` for frames named `event`. The handler stays live
    /// until the returned [`Subscription`] is disposed or dropped.
    pub fn subscribe<F>(self: &Arc<Self>, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let mut registry = self.handlers.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.by_event.entry(event.to_string()).or_default().push((id, Arc::new(handler)));
        Subscription { connection: Arc::downgrade(self), event: event.to_string(), id }
    }

    fn unsubscribe(&self, event: &str, id: u64) {
        let mut registry = self.handlers.lock();
        if let Some(list) = registry.by_event.get_mut(event) {
            list.retain(|(handler_id, _)| *handler_id != id);
            if list.is_empty() {
                registry.by_event.remove(event);
            }
        }
    }

    /// Request/callback: emits `event` with an ack id and waits for the
    /// matching `ack` frame.
    pub async fn request(&self, event: &str, data: Value, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().insert(ack_id, tx);

        let frame = Frame { event: event.to_string(), data, ack_id: Some(ack_id) };
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            self.pending_acks.lock().remove(&ack_id);
            return Err(SyncError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => {
                self.pending_acks.lock().remove(&ack_id);
                Err(SyncError::AckTimeout { event: event.to_string(), after: timeout })
            }
        }
    }

    fn handle_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Connected => {
                self.cancel_guard();
                log::info!("push transport connected");
                self.state.send_modify(|s| {
                    s.connected = true;
                    s.loading = false;
                    s.last_error = None;
                    s.reconnect_attempts = 0;
                    s.connects += 1;
                });
            }
            TransportSignal::Reconnecting { attempt } => {
                log::debug!("push transport reconnecting (attempt {attempt})");
                self.state.send_if_modified(|s| {
                    let changed = s.reconnect_attempts != attempt;
                    s.reconnect_attempts = attempt;
                    changed
                });
            }
            TransportSignal::Disconnected(reason) => {
                let terminal = reason.is_terminal();
                log::info!("push transport disconnected: {reason:?}");
                if terminal {
                    self.cancel_guard();
                }
                self.state.send_if_modified(|s| {
                    let before = s.clone();
                    s.connected = false;
                    if terminal {
                        s.loading = false;
                    }
                    *s != before
                });
            }
            TransportSignal::Error(message) => {
                self.cancel_guard();
                log::warn!("push transport error: {message}");
                self.state.send_modify(|s| {
                    s.loading = false;
                    s.last_error = Some(message);
                });
            }
            TransportSignal::Frame(frame) => self.dispatch(frame),
        }
    }

    fn dispatch(&self, frame: Frame) {
        if frame.event == ACK_EVENT {
            match frame.ack_id.and_then(|id| self.pending_acks.lock().remove(&id)) {
                Some(tx) => {
                    let _ = tx.send(frame.data);
                }
                None => log::debug!("ack {:?} has no pending request", frame.ack_id),
            }
            return;
        }

        // Snapshot so handlers can (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .by_event
            .get(&frame.event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            log::debug!("no subscriber for `{}`", frame.event);
        }
        for handler in handlers {
            handler(&frame);
        }
    }

    fn arm_guard(self: &Arc<Self>, timeout: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(conn) = weak.upgrade() {
                conn.guard_expired(timeout);
            }
        });
        *self.guard.lock() = Some(handle);
    }

    fn guard_expired(&self, timeout: Duration) {
        if self.guard.lock().take().is_none() {
            return;
        }
        let fired = self.state.send_if_modified(|s| {
            if s.connected || !s.loading {
                return false;
            }
            s.loading = false;
            true
        });
        if fired {
            log::warn!("push transport not connected after {timeout:?}; continuing in background");
        }
    }

    fn cancel_guard(&self) {
        if let Some(handle) = self.guard.lock().take() {
            handle.abort();
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_guard();
        let _ = self.outbound.send(Outbound::Close);
        self.pending_acks.lock().clear();
        self.state.send_replace(ConnectionState::default());
    }
}

/// Disposer returned by [`Connection::subscribe`]. Dropping it has the same
/// effect as calling [`Subscription::dispose`].
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    connection: Weak<Connection>,
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.upgrade() {
            conn.unsubscribe(&self.event, self.id);
        }
    }
}

/// Supervises the connection of the active credential.
pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    connect_timeout: Duration,
    active: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>, connect_timeout: Duration) -> Self {
        Self { transport, connect_timeout, active: Mutex::new(None) }
    }

    /// Returns the live connection for `credential`, opening one if needed.
    /// A different credential tears the previous connection down first.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, credential: &str) -> Arc<Connection> {
        let mut active = self.active.lock();
        if let Some(conn) = active.as_ref() {
            if conn.credential == credential && !conn.is_closed() {
                return conn.clone();
            }
            conn.shutdown();
        }

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let link = self.transport.open(credential, signal_tx);
        let (state, _) = watch::channel(ConnectionState { loading: true, ..Default::default() });
        let conn = Arc::new(Connection {
            credential: credential.to_string(),
            state,
            handlers: Mutex::new(HandlerRegistry::default()),
            pending_acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(0),
            outbound: link.outbound,
            guard: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        conn.arm_guard(self.connect_timeout);

        let weak = Arc::downgrade(&conn);
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let Some(conn) = weak.upgrade() else { break };
                if conn.is_closed() {
                    break;
                }
                conn.handle_signal(signal);
            }
        });

        *active = Some(conn.clone());
        conn
    }

    pub fn current(&self) -> Option<Arc<Connection>> {
        self.active.lock().clone()
    }

    /// Explicit teardown; resets the connection state.
    pub fn disconnect(&self) {
        if let Some(conn) = self.active.lock().take() {
            conn.shutdown();
        }
    }
}
