//! Connection manager: one WebSocket per client, events dispatched in arrival order.
//!
//! The reader task is the only consumer of the socket; every text frame goes
//! through the decoder, the status projector and then to subscribers, one at a
//! time. Outbound frames go through a single writer task. Reconnection is left
//! to the caller.

use crate::client::ClientError;
use crate::config::ClientConfig;
use crate::event::{decode, HydraEvent};
use crate::status::{project, ConnectionState, HeadStatus};
use crate::types::HydraUTxOs;
use anyhow::Context;
use futures_util::{SinkExt, Stream, StreamExt};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

type Callback = Box<dyn FnMut(&HydraEvent) + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    // Id of the subscriber whose callback is running on this thread.
    static DISPATCHING: Cell<Option<u64>> = const { Cell::new(None) };
}

struct SubscriberSlot {
    id: u64,
    active: AtomicBool,
    callback: Mutex<Callback>,
}

/// Registered event callbacks, invoked in registration order.
#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    slots: Mutex<Vec<Arc<SubscriberSlot>>>,
}

impl Subscribers {
    fn add(self: &Arc<Self>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.slots).push(Arc::new(SubscriberSlot {
            id,
            active: AtomicBool::new(true),
            callback: Mutex::new(callback),
        }));
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber. Returns once no invocation of it is in progress,
    /// unless called from inside that same callback.
    fn remove(&self, id: u64) {
        let slot = {
            let mut slots = lock(&self.slots);
            let pos = slots.iter().position(|s| s.id == id);
            pos.map(|p| slots.remove(p))
        };
        let Some(slot) = slot else { return };
        slot.active.store(false, Ordering::Release);
        let reentrant = DISPATCHING.with(|d| d.get() == Some(id));
        if !reentrant {
            drop(lock(&slot.callback));
        }
    }

    fn dispatch(&self, event: &HydraEvent) {
        let slots: Vec<_> = lock(&self.slots).clone();
        for slot in slots {
            let mut callback = lock(&slot.callback);
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            let outer = DISPATCHING.with(|d| d.replace(Some(slot.id)));
            let result = catch_unwind(AssertUnwindSafe(|| (&mut **callback)(event)));
            DISPATCHING.with(|d| d.set(outer));
            if result.is_err() {
                tracing::warn!(subscriber = slot.id, tag = event.tag(), "subscriber panicked");
            }
        }
    }

    fn len(&self) -> usize {
        lock(&self.slots).len()
    }
}

/// Handle of a registered event callback. Dropping it unsubscribes.
///
/// Once [Subscription::unsubscribe] returns (or the handle is dropped) the
/// callback is never invoked again, even for frames already being dispatched.
#[must_use = "dropping a Subscription unsubscribes the callback"]
pub struct Subscription {
    id: u64,
    registry: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// State shared between the connection handle and its reader task.
pub(crate) struct Shared {
    status: watch::Sender<HeadStatus>,
    state: watch::Sender<ConnectionState>,
    snapshot: RwLock<Option<Arc<HydraUTxOs>>>,
    head_id: RwLock<Option<String>>,
    subscribers: Arc<Subscribers>,
    events: broadcast::Sender<HydraEvent>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Shared {
    fn new() -> Self {
        let (status, _) = watch::channel(HeadStatus::Disconnected);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(256);
        Self {
            status,
            state,
            snapshot: RwLock::new(None),
            head_id: RwLock::new(None),
            subscribers: Arc::new(Subscribers::default()),
            events,
            outbox: Mutex::new(None),
        }
    }

    /// Mirror a connection transition into the head status while no lifecycle
    /// status is known.
    fn mirror(&self, state: ConnectionState) {
        let next = HeadStatus::from(state);
        self.status.send_if_modified(|s| {
            if s.is_connection_level() && *s != next {
                *s = next;
                true
            } else {
                false
            }
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.mirror(state);
    }

    /// Tear down the transport side and deliver the terminal event. Idempotent.
    fn close_transport(&self, reason: String, error: bool) {
        lock(&self.outbox).take();
        let changed = self.state.send_if_modified(|s| {
            if *s != ConnectionState::Disconnected {
                *s = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        self.mirror(ConnectionState::Disconnected);
        if error {
            tracing::warn!(reason = %reason, "hydra connection lost");
        } else {
            tracing::info!(reason = %reason, "hydra connection closed");
        }
        self.dispatch(HydraEvent::disconnected(reason, error));
    }

    fn dispatch_text(&self, text: &str) {
        self.dispatch(decode(text));
    }

    fn dispatch(&self, event: HydraEvent) {
        tracing::debug!(tag = event.tag(), "hydra event");
        if let Some(next) = project(&event) {
            self.status.send_if_modified(|s| {
                if *s == next {
                    return false;
                }
                tracing::info!(from = %s, to = %next, "head status changed");
                *s = next;
                true
            });
        }
        if let Some(utxo) = event.snapshot_utxo() {
            let utxo = Arc::new(utxo.clone());
            *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(utxo);
        }
        if let Some(id) = event.head_id() {
            let mut head_id = self.head_id.write().unwrap_or_else(PoisonError::into_inner);
            if head_id.as_deref() != Some(id) {
                *head_id = Some(id.to_string());
            }
        }
        self.subscribers.dispatch(&event);
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

struct Tasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Duplex connection to a hydra node.
pub struct Connection {
    endpoint: String,
    handshake_timeout: Duration,
    disconnect_timeout: Duration,
    shared: Arc<Shared>,
    tasks: Mutex<Option<Tasks>>,
    // Set by disconnect() while a handshake is in flight.
    cancelled: AtomicBool,
    cancel: Notify,
}

impl Connection {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.ws_endpoint(),
            handshake_timeout: config.handshake_timeout,
            disconnect_timeout: config.disconnect_timeout,
            shared: Arc::new(Shared::new()),
            tasks: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open the socket and start dispatching. No-op unless disconnected.
    ///
    /// A failed handshake is reported to subscribers as a terminal
    /// `Disconnected` event and returned as [ClientError::Transport].
    pub async fn connect(&self) -> Result<(), ClientError> {
        let claimed = self.shared.state.send_if_modified(|s| {
            if *s == ConnectionState::Disconnected {
                self.cancelled.store(false, Ordering::Release);
                *s = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            tracing::debug!("connect ignored: connection already active");
            return Ok(());
        }
        self.shared.mirror(ConnectionState::Connecting);
        tracing::info!(url = %self.endpoint, "connecting to hydra node");

        let handshake = timeout(self.handshake_timeout, connect_async(self.endpoint.as_str()));
        let mut ws = tokio::select! {
            result = handshake => match result {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => return Err(self.handshake_failed(format!("handshake failed: {}", e))),
                Err(_) => return Err(self.handshake_failed("handshake timed out".to_string())),
            },
            _ = self.cancel.notified() => return Err(self.handshake_cancelled()),
        };
        if self.cancelled.load(Ordering::Acquire) {
            let _ = ws.close(None).await;
            return Err(self.handshake_cancelled());
        }
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *lock(&self.shared.outbox) = Some(out_tx);
        self.shared.set_state(ConnectionState::Connected);
        tracing::info!(url = %self.endpoint, "connected to hydra node");

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(reason = %e, "hydra send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            // Flushes a pending reply to a close started by the node.
            if let Err(e) = sink.close().await {
                tracing::debug!(reason = %e, "hydra sink close");
            }
        });
        let shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            let (reason, error) = match read_loop(&shared, &mut stream).await {
                Ok(reason) => (reason, false),
                Err(e) => (format!("{:#}", e), true),
            };
            shared.close_transport(reason, error);
        });
        *lock(&self.tasks) = Some(Tasks { reader, writer });
        if self.cancelled.load(Ordering::Acquire) {
            self.disconnect().await;
            return Err(self.handshake_cancelled());
        }
        Ok(())
    }

    fn handshake_cancelled(&self) -> ClientError {
        let reason = "connect cancelled by disconnect".to_string();
        self.shared.close_transport(reason.clone(), false);
        ClientError::Transport(reason)
    }

    fn handshake_failed(&self, reason: String) -> ClientError {
        self.shared.close_transport(reason.clone(), true);
        ClientError::Transport(reason)
    }

    /// Close the socket, waiting up to the disconnect timeout for the close handshake.
    ///
    /// A pending [Connection::connect] is cancelled and returns an error.
    pub async fn disconnect(&self) {
        let Some(tasks) = lock(&self.tasks).take() else {
            if self.state() != ConnectionState::Disconnected {
                tracing::debug!("cancelling pending handshake");
                self.cancelled.store(true, Ordering::Release);
                self.cancel.notify_waiters();
            }
            return;
        };
        if let Some(out) = lock(&self.shared.outbox).as_ref() {
            let _ = out.send(Message::Close(None));
        }
        let Tasks { mut reader, writer } = tasks;
        if timeout(self.disconnect_timeout, &mut reader).await.is_err() {
            tracing::warn!("close handshake timed out, dropping connection");
            reader.abort();
        }
        writer.abort();
        self.shared
            .close_transport("closed by client".to_string(), false);
    }

    /// Queue a JSON command for the writer task.
    pub fn send(&self, command: &serde_json::Value) -> Result<(), ClientError> {
        let outbox = lock(&self.shared.outbox);
        let tx = outbox.as_ref().ok_or(ClientError::NotConnected)?;
        let text = serde_json::to_string(command).map_err(ClientError::Serialize)?;
        tx.send(Message::Text(text))
            .map_err(|_| ClientError::NotConnected)?;
        tracing::debug!(command = command.get("tag").and_then(|t| t.as_str()).unwrap_or(""), "hydra command queued");
        Ok(())
    }

    pub fn status(&self) -> HeadStatus {
        *self.shared.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<HeadStatus> {
        self.shared.status.subscribe()
    }

    pub fn snapshot_utxo(&self) -> Option<Arc<HydraUTxOs>> {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn head_id(&self) -> Option<String> {
        self.shared
            .head_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&HydraEvent) + Send + 'static,
    {
        self.shared.subscribers.add(Box::new(callback))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HydraEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Install an in-memory outbox and mark the connection as connected.
    #[cfg(test)]
    pub(crate) fn attach_outbox(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outbox) = Some(tx);
        self.shared.set_state(ConnectionState::Connected);
        rx
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, text: &str) {
        self.shared.dispatch_text(text);
    }

    #[cfg(test)]
    pub(crate) fn drop_transport(&self, reason: &str) {
        self.shared.close_transport(reason.to_string(), true);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }
}

async fn read_loop<S>(shared: &Shared, stream: &mut S) -> anyhow::Result<String>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg.context("hydra websocket")? {
            Message::Text(text) => shared.dispatch_text(&text),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed".to_string());
                return Ok(reason);
            }
            Message::Binary(_) => tracing::debug!("ignoring binary frame"),
            _ => continue,
        }
    }
    Ok("stream ended".to_string())
}
