//! Per-connection plumbing
//!
//! Each WebSocket connection runs three cooperating tasks: a sender draining
//! the outbound queue (plus heartbeat pings), an inactivity watchdog, and
//! the read loop feeding the coordinator. The outbound path never blocks:
//! a full queue drops the connection instead of stalling a broadcaster.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FileConfig;
use crate::metrics::ServerMetrics;

use super::coordinator::Coordinator;
use super::hub::Hub;
use super::protocol::{ClientMessage, ServerMessage};

/// WebSocket close code 1008 (policy violation), sent on inactivity timeout.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// How often the watchdog samples the last-activity timestamp.
const WATCHDOG_TICK: Duration = Duration::from_secs(60);

/// Cheap, cloneable sending side of a connection. This is what the hub
/// stores in its membership table.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        outbound: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            cancel,
            metrics,
        }
    }

    /// Enqueue a message without blocking. A full queue means the peer is
    /// not draining; the connection is closed rather than stalling the
    /// sender.
    pub fn send(&self, msg: ServerMessage) {
        match self.outbound.try_send(msg) {
            Ok(()) => self.metrics.message_sent(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %self.id, "outbound queue full, dropping connection");
                self.metrics.message_dropped();
                self.cancel.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Identity a connection gains once its participant joins or creates a
/// session. Attached server-side to every inbound message.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub session_id: String,
    pub participant_id: String,
    pub user_name: String,
}

/// State shared between the connection's tasks and the coordinator.
pub struct Connection {
    pub handle: ConnectionHandle,
    identity: RwLock<Option<ClientIdentity>>,
    last_activity: RwLock<Instant>,
    timed_out: AtomicBool,
}

impl Connection {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            identity: RwLock::new(None),
            last_activity: RwLock::new(Instant::now()),
            timed_out: AtomicBool::new(false),
        }
    }

    pub async fn identity(&self) -> Option<ClientIdentity> {
        self.identity.read().await.clone()
    }

    /// Bind this connection to its participant. Happens exactly once, when
    /// the participant is created or joins.
    pub async fn assign_identity(&self, identity: ClientIdentity) {
        let mut slot = self.identity.write().await;
        if slot.is_some() {
            warn!(connection = %self.handle.id, "identity already assigned, ignoring");
            return;
        }
        *slot = Some(identity);
    }

    async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Relaxed);
    }

    fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Relaxed)
    }
}

/// Drive one upgraded WebSocket until it closes, times out, or overflows.
pub async fn serve_connection(
    socket: WebSocket,
    coordinator: Arc<Coordinator>,
    hub: Arc<Hub>,
    config: Arc<FileConfig>,
    metrics: Arc<ServerMetrics>,
) {
    metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(config.websocket.outbound_buffer_msgs);
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::new(tx, cancel.clone(), metrics.clone());
    let conn = Arc::new(Connection::new(handle));
    info!(connection = %conn.handle.id, "websocket connected");

    // Sender: drains the outbound queue and keeps the peer alive with pings.
    let sender_conn = conn.clone();
    let sender_cancel = cancel.clone();
    let ping_every = config.websocket.ping_interval();
    let sender_task = async move {
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + ping_every,
            ping_every,
        );
        loop {
            tokio::select! {
                _ = sender_cancel.cancelled() => {
                    let frame = sender_conn.timed_out().then(|| CloseFrame {
                        code: CLOSE_POLICY_VIOLATION,
                        reason: "inactivity timeout".into(),
                    });
                    let _ = ws_sender.send(Message::Close(frame)).await;
                    break;
                }
                maybe = rx.recv() => {
                    let Some(msg) = maybe else { break };
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("failed to serialize message: {e}");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    // Watchdog: disconnects peers with no inbound traffic for too long,
    // sending a distinguishable timeout notice first, best-effort.
    let watchdog_conn = conn.clone();
    let watchdog_cancel = cancel.clone();
    let idle_cutoff = config.websocket.inactivity_timeout();
    let watchdog_task = async move {
        let mut check = tokio::time::interval_at(
            tokio::time::Instant::now() + WATCHDOG_TICK,
            WATCHDOG_TICK,
        );
        loop {
            tokio::select! {
                _ = watchdog_cancel.cancelled() => break,
                _ = check.tick() => {
                    if watchdog_conn.idle_for().await > idle_cutoff {
                        warn!(
                            connection = %watchdog_conn.handle.id,
                            idle_secs = idle_cutoff.as_secs(),
                            "inactive too long, disconnecting"
                        );
                        watchdog_conn.handle.send(ServerMessage::Timeout {
                            message: "Disconnected due to inactivity. Please start again."
                                .to_string(),
                        });
                        // Give the sender a moment to flush the notice.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        watchdog_conn.mark_timed_out();
                        watchdog_cancel.cancel();
                        break;
                    }
                }
            }
        }
    };

    // Read loop: one message at a time, malformed payloads skipped.
    let read_conn = conn.clone();
    let read_cancel = cancel.clone();
    let read_metrics = metrics.clone();
    let input_task = async move {
        loop {
            tokio::select! {
                _ = read_cancel.cancelled() => break,
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            read_conn.touch().await;
                            read_metrics.message_received();
                            let msg = match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    warn!(
                                        connection = %read_conn.handle.id,
                                        "discarding malformed message: {e}"
                                    );
                                    continue;
                                }
                            };
                            coordinator.handle_message(&read_conn, msg).await;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            read_conn.touch().await;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!(connection = %read_conn.handle.id, "discarding binary frame");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(connection = %read_conn.handle.id, "peer closed connection");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(connection = %read_conn.handle.id, "websocket error: {e}");
                            read_metrics.websocket_error();
                            break;
                        }
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("sender task ended"),
        _ = watchdog_task => debug!("watchdog task ended"),
        _ = input_task => debug!("read loop ended"),
    }
    cancel.cancel();

    // Leaving the session group fires the disconnect callback, which handles
    // participant removal and host failover.
    if let Some(identity) = conn.identity().await {
        debug!(
            connection = %conn.handle.id,
            user = %identity.user_name,
            "leaving session group"
        );
        hub.unregister(&identity.session_id, conn.handle.id).await;
    }

    metrics.connection_closed();
    info!(connection = %conn.handle.id, "websocket closed");
}
