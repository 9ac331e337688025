//! Connection hub
//!
//! Membership table for live connections, grouped by session. Broadcasts
//! snapshot the group before sending, so a racing unregister sees either
//! the before or after roster, never a torn view, and the membership lock
//! is never held across a send.

use std::collections::HashMap;
use std::sync::OnceLock;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::ConnectionHandle;
use super::protocol::ServerMessage;

/// Identity of a connection that has just been removed from its group. The
/// disconnect callback observes a roster already missing this party.
#[derive(Debug, Clone)]
pub struct DisconnectedClient {
    pub session_id: String,
    pub participant_id: String,
    pub user_name: String,
}

type DisconnectFn = Box<dyn Fn(DisconnectedClient) + Send + Sync>;

struct Member {
    participant_id: String,
    user_name: String,
    handle: ConnectionHandle,
}

/// Groups live connections by session and routes outbound messages.
///
/// The hub knows nothing about the domain: disconnect consequences are an
/// injected callback, wired once at startup.
pub struct Hub {
    groups: RwLock<HashMap<String, Vec<Member>>>,
    on_disconnect: OnceLock<DisconnectFn>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            on_disconnect: OnceLock::new(),
        }
    }

    /// Install the disconnect callback. Only the first call takes effect.
    pub fn set_disconnect_handler(&self, handler: impl Fn(DisconnectedClient) + Send + Sync + 'static) {
        if self.on_disconnect.set(Box::new(handler)).is_err() {
            warn!("disconnect handler already set, ignoring");
        }
    }

    /// Add a connection under its session's group. Callers only register
    /// once the connection has an assigned session.
    pub async fn register(
        &self,
        session_id: &str,
        participant_id: &str,
        user_name: &str,
        handle: ConnectionHandle,
    ) {
        let mut groups = self.groups.write().await;
        let connection_id = handle.id;
        groups.entry(session_id.to_string()).or_default().push(Member {
            participant_id: participant_id.to_string(),
            user_name: user_name.to_string(),
            handle,
        });
        debug!(
            connection = %connection_id,
            participant = participant_id,
            session = session_id,
            "connection registered"
        );
    }

    /// Remove a connection from its group, dropping the group entry when it
    /// empties. Fires the disconnect callback exactly once per removed
    /// connection, after removal.
    pub async fn unregister(&self, session_id: &str, connection_id: Uuid) {
        let removed = {
            let mut groups = self.groups.write().await;
            let Some(members) = groups.get_mut(session_id) else {
                return;
            };
            let Some(index) = members
                .iter()
                .position(|m| m.handle.id == connection_id)
            else {
                return;
            };
            let member = members.remove(index);
            if members.is_empty() {
                groups.remove(session_id);
            }
            member
        };

        debug!(
            connection = %connection_id,
            participant = %removed.participant_id,
            session = session_id,
            "connection unregistered"
        );

        if let Some(handler) = self.on_disconnect.get() {
            handler(DisconnectedClient {
                session_id: session_id.to_string(),
                participant_id: removed.participant_id,
                user_name: removed.user_name,
            });
        }
    }

    /// Deliver to every connection currently in the session's group.
    pub async fn broadcast(&self, session_id: &str, msg: &ServerMessage) {
        let handles = self.snapshot(session_id, |_| true).await;
        for handle in handles {
            handle.send(msg.clone());
        }
    }

    /// Deliver to every group member except one participant.
    pub async fn broadcast_except(
        &self,
        session_id: &str,
        except_participant_id: &str,
        msg: &ServerMessage,
    ) {
        let handles = self
            .snapshot(session_id, |m| m.participant_id != except_participant_id)
            .await;
        for handle in handles {
            handle.send(msg.clone());
        }
    }

    /// Deliver to the first connection owned by a participant. At most one
    /// is expected in normal operation.
    pub async fn send_to_participant(
        &self,
        session_id: &str,
        participant_id: &str,
        msg: &ServerMessage,
    ) {
        let target = {
            let groups = self.groups.read().await;
            groups.get(session_id).and_then(|members| {
                members
                    .iter()
                    .find(|m| m.participant_id == participant_id)
                    .map(|m| m.handle.clone())
            })
        };
        if let Some(handle) = target {
            handle.send(msg.clone());
        }
    }

    async fn snapshot(
        &self,
        session_id: &str,
        keep: impl Fn(&Member) -> bool,
    ) -> Vec<ConnectionHandle> {
        let groups = self.groups.read().await;
        groups
            .get(session_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| keep(m))
                    .map(|m| m.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServerMetrics;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn test_handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle =
            ConnectionHandle::new(tx, CancellationToken::new(), Arc::new(ServerMetrics::new()));
        (handle, rx)
    }

    fn error_msg(text: &str) -> ServerMessage {
        ServerMessage::Error {
            message: text.to_string(),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_group_members() {
        let hub = Hub::new();
        let (a, mut a_rx) = test_handle(8);
        let (b, mut b_rx) = test_handle(8);
        hub.register("s1", "alice", "Alice", a).await;
        hub.register("s1", "bob", "Bob", b).await;

        hub.broadcast("s1", &error_msg("hello")).await;

        assert!(matches!(a_rx.recv().await, Some(ServerMessage::Error { .. })));
        assert!(matches!(b_rx.recv().await, Some(ServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_one_session() {
        let hub = Hub::new();
        let (a, mut a_rx) = test_handle(8);
        let (b, mut b_rx) = test_handle(8);
        hub.register("s1", "alice", "Alice", a).await;
        hub.register("s2", "bob", "Bob", b).await;

        hub.broadcast("s1", &error_msg("hello")).await;

        assert!(a_rx.recv().await.is_some());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_except_skips_one_participant() {
        let hub = Hub::new();
        let (a, mut a_rx) = test_handle(8);
        let (b, mut b_rx) = test_handle(8);
        hub.register("s1", "alice", "Alice", a).await;
        hub.register("s1", "bob", "Bob", b).await;

        hub.broadcast_except("s1", "alice", &error_msg("hello")).await;

        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_to_participant_targets_one_connection() {
        let hub = Hub::new();
        let (a, mut a_rx) = test_handle(8);
        let (b, mut b_rx) = test_handle(8);
        hub.register("s1", "alice", "Alice", a).await;
        hub.register("s1", "bob", "Bob", b).await;

        hub.send_to_participant("s1", "bob", &error_msg("psst")).await;

        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unregister_fires_disconnect_callback_once() {
        let hub = Hub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = calls.clone();
        hub.set_disconnect_handler(move |gone| {
            assert_eq!(gone.session_id, "s1");
            assert_eq!(gone.participant_id, "alice");
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
        });

        let (a, _a_rx) = test_handle(8);
        let connection_id = a.id;
        hub.register("s1", "alice", "Alice", a).await;

        hub.unregister("s1", connection_id).await;
        hub.unregister("s1", connection_id).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Group entry removed once empty: a later broadcast is a no-op.
        hub.broadcast("s1", &error_msg("hello")).await;
    }

    #[tokio::test]
    async fn unregistered_connection_stops_receiving_broadcasts() {
        let hub = Hub::new();
        let (a, mut a_rx) = test_handle(8);
        let (b, mut b_rx) = test_handle(8);
        let a_id = a.id;
        hub.register("s1", "alice", "Alice", a).await;
        hub.register("s1", "bob", "Bob", b).await;

        hub.unregister("s1", a_id).await;
        hub.broadcast("s1", &error_msg("hello")).await;

        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_the_connection() {
        let hub = Hub::new();
        let (a, _a_rx) = test_handle(1);
        let handle = a.clone();
        hub.register("s1", "alice", "Alice", a).await;

        hub.broadcast("s1", &error_msg("first")).await;
        assert!(!handle.is_closing());

        // Receiver never drains: the second send overflows and the
        // connection is cancelled instead of blocking the broadcaster.
        hub.broadcast("s1", &error_msg("second")).await;
        assert!(handle.is_closing());
    }
}
