//! WebSocket sessions: send queues, pending acknowledgments and the
//! per-socket read/write loop with its heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use hail_core::events::{Frame, OutboundEvent};
use hail_core::{DeliveryError, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Heartbeat;
use crate::transport::{AckReceiver, Transport};

/// One live WebSocket session.
pub struct Connection {
    pub session_id: SessionId,
    pub opened_at: DateTime<Utc>,
    tx: mpsc::Sender<String>,
    pending_acks: DashMap<u64, oneshot::Sender<Value>>,
    next_ack: AtomicU64,
    last_pong: Mutex<Instant>,
    closed: CancellationToken,
}

impl Connection {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            session_id: SessionId::new(),
            opened_at: Utc::now(),
            tx,
            pending_acks: DashMap::new(),
            next_ack: AtomicU64::new(1),
            last_pong: Mutex::new(Instant::now()),
            closed: CancellationToken::new(),
        }
    }

    fn send_frame(&self, frame: &Frame) -> bool {
        let Some(json) = frame.to_json() else {
            return false;
        };
        match self.tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_pong.lock().elapsed() < timeout
    }

    /// Hand a client acknowledgment to whoever is waiting on it.
    pub fn resolve_ack(&self, ack_id: u64, reply: Value) -> bool {
        match self.pending_acks.remove(&ack_id) {
            Some((_, waiter)) => waiter.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    fn close(&self) {
        self.closed.cancel();
        // Dropping the senders fails every in-flight acknowledged send.
        self.pending_acks.clear();
    }
}

/// Every live WebSocket session, by session id.
pub struct ConnectionHub {
    connections: DashMap<SessionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionHub {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Open a session and return it with the receiving end of its send queue.
    pub fn register(&self) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let connection = Arc::new(Connection::new(tx));
        self.connections
            .insert(connection.session_id.clone(), Arc::clone(&connection));
        (connection, rx)
    }

    /// Remove a session and signal its socket task to close.
    pub fn unregister(&self, session_id: &SessionId) -> bool {
        match self.connections.remove(session_id) {
            Some((_, connection)) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Connection>> {
        self.connections.get(session_id).map(|c| Arc::clone(c.value()))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close every session, as on shutdown. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.connections.iter().map(|c| c.key().clone()).collect();
        ids.iter().filter(|id| self.unregister(id)).count()
    }
}

#[async_trait]
impl Transport for ConnectionHub {
    fn exists(&self, session_id: &SessionId) -> bool {
        self.connections.contains_key(session_id)
    }

    async fn terminate(&self, session_id: &SessionId) -> bool {
        let removed = self.unregister(session_id);
        if removed {
            tracing::info!(session_id = %session_id, "Terminated session");
        }
        removed
    }

    fn emit(&self, session_id: &SessionId, event: OutboundEvent) -> bool {
        match self.get(session_id) {
            Some(connection) => connection.send_frame(&event.into_frame(None)),
            None => false,
        }
    }

    fn emit_with_ack(
        &self,
        session_id: &SessionId,
        event: OutboundEvent,
    ) -> Result<AckReceiver, DeliveryError> {
        let connection = self
            .get(session_id)
            .ok_or_else(|| DeliveryError::NotConnected(session_id.clone()))?;

        let ack_id = connection.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        connection.pending_acks.insert(ack_id, tx);

        if !connection.send_frame(&event.into_frame(Some(ack_id))) {
            connection.pending_acks.remove(&ack_id);
            return Err(DeliveryError::NotConnected(session_id.clone()));
        }

        let weak = Arc::downgrade(&connection);
        Ok(AckReceiver::new(rx, move || {
            if let Some(connection) = weak.upgrade() {
                connection.pending_acks.remove(&ack_id);
            }
        }))
    }
}

/// Drive one WebSocket: forward queued frames out, route acknowledgments to
/// their waiters, pass event frames to `on_event`, and ping on the heartbeat.
///
/// Returns when the client closes, stops answering pings, or the session is
/// terminated. The session is unregistered before returning.
pub async fn drive(
    socket: WebSocket,
    connection: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    hub: Arc<ConnectionHub>,
    heartbeat: Heartbeat,
    on_event: mpsc::Sender<(String, Value)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let session_id = connection.session_id.clone();

    // Writer task: queued frames, pings, and the close frame on termination
    let writer_conn = Arc::clone(&connection);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if !writer_conn.is_alive(heartbeat.timeout) {
                        tracing::info!(session_id = %writer_conn.session_id, "Heartbeat timed out");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_conn.closed.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader task: inbound frames
    let reader_conn = Arc::clone(&connection);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(Frame::Ack { ack, data }) => {
                        if !reader_conn.resolve_ack(ack, data) {
                            tracing::debug!(session_id = %reader_conn.session_id, ack, "Late or unknown ack");
                        }
                    }
                    Ok(Frame::Event { event, data, .. }) => {
                        if on_event.send((event, data)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %reader_conn.session_id, error = %e, "Malformed frame");
                    }
                },
                WsMessage::Pong(_) => reader_conn.record_pong(),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let writer_abort = writer.abort_handle();
    let reader_abort = reader.abort_handle();
    tokio::select! {
        _ = writer => reader_abort.abort(),
        _ = reader => writer_abort.abort(),
    }

    hub.unregister(&session_id);
}
