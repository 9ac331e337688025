//! Message coordinator
//!
//! Interprets inbound client messages, drives session operations, and
//! issues hub broadcasts. Depends on the hub one-directionally; the hub
//! reaches back only through the narrow disconnect callback installed by
//! [`attach_disconnect_handler`].

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::metrics::ServerMetrics;
use crate::session::{Phase, Session, SessionError, SessionRegistry};

use super::connection::{ClientIdentity, Connection};
use super::hub::{DisconnectedClient, Hub};
use super::protocol::{ClientMessage, DrawnNote, NoteDraft, RevealedNote, ServerMessage};
use super::validation::{check_participant_limit, validate_note_content, validate_user_name};

const COMPLETE_MESSAGE: &str = "All notes have been read. Thank you for participating!";

pub struct Coordinator {
    hub: Arc<Hub>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
}

/// Wire the hub's disconnect callback to the coordinator. The callback only
/// captures the coordinator behind a narrow closure; the hub itself stays
/// domain-agnostic.
pub fn attach_disconnect_handler(hub: &Hub, coordinator: Arc<Coordinator>) {
    hub.set_disconnect_handler(move |gone| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.handle_disconnect(gone).await;
        });
    });
}

impl Coordinator {
    pub fn new(hub: Arc<Hub>, registry: Arc<SessionRegistry>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            hub,
            registry,
            metrics,
        }
    }

    pub async fn handle_message(&self, conn: &Connection, msg: ClientMessage) {
        debug!(connection = %conn.handle.id, message = ?msg, "handling message");
        match msg {
            ClientMessage::ValidateSession { session_code } => {
                self.validate_session(conn, &session_code).await;
            }
            ClientMessage::CreateSession { user_name } => {
                self.create_session(conn, &user_name).await;
            }
            ClientMessage::JoinSession {
                session_code,
                user_name,
            } => {
                self.join_session(conn, &session_code, &user_name).await;
            }
            ClientMessage::StartWriting => self.start_writing(conn).await,
            ClientMessage::SubmitNotes { notes } => self.submit_notes(conn, notes).await,
            ClientMessage::DrawNote => self.draw_note(conn).await,
            ClientMessage::NoteRead { note_id } => self.note_read(conn, note_id.as_deref()).await,
            ClientMessage::RemoveParticipant { participant_id } => {
                self.remove_participant(conn, &participant_id).await;
            }
        }
    }

    /// A connection's participant left: remove them from the session, fail
    /// the host role over if needed, and drop the session once empty.
    pub async fn handle_disconnect(&self, gone: DisconnectedClient) {
        let Ok(session) = self.registry.get_by_id(&gone.session_id).await else {
            debug!(participant = %gone.participant_id, "session already gone for disconnecting client");
            return;
        };

        let removed = match session.remove_participant(&gone.participant_id).await {
            Ok(removed) => removed,
            Err(e) => {
                debug!(participant = %gone.participant_id, "disconnect cleanup skipped: {e}");
                return;
            }
        };

        let was_host = removed.is_host;
        if was_host {
            if let Some(new_host) = session.promote_new_host().await {
                info!(session = %session.code, new_host = %new_host.id, "host reassigned");
            }
        }

        if session.participant_count().await == 0 {
            if self.registry.remove(&session.id).await.is_ok() {
                info!(session = %session.code, "empty session removed");
                self.metrics.session_evicted();
            }
            return;
        }

        self.hub
            .broadcast(
                &session.id,
                &ServerMessage::ParticipantLeft {
                    participant: removed,
                    participants: session.participant_list().await,
                    was_host,
                    was_removed: false,
                },
            )
            .await;
        info!(
            session = %session.code,
            participant = %gone.participant_id,
            user = %gone.user_name,
            was_host,
            "participant left"
        );
    }

    async fn validate_session(&self, conn: &Connection, session_code: &str) {
        let code = session_code.trim();
        if code.is_empty() {
            conn.handle.send(ServerMessage::SessionValidation {
                valid: false,
                error: Some("session code required".to_string()),
            });
            return;
        }

        match self.registry.get_by_code(code).await {
            Ok(_) => {
                conn.handle.send(ServerMessage::SessionValidation {
                    valid: true,
                    error: None,
                });
            }
            Err(_) => {
                debug!(code, "session validation failed");
                conn.handle.send(ServerMessage::SessionValidation {
                    valid: false,
                    error: Some("session not found".to_string()),
                });
            }
        }
    }

    async fn create_session(&self, conn: &Connection, user_name: &str) {
        if conn.identity().await.is_some() {
            return self.send_error(
                conn,
                &SessionError::Validation("already in a session".to_string()),
            );
        }
        let name = match validate_user_name(user_name) {
            Ok(name) => name,
            Err(e) => return self.send_error(conn, &e),
        };

        let session = self.registry.create(&name).await;
        self.metrics.session_created();
        let Some(host) = session.host().await else {
            return self.send_error(conn, &SessionError::NotFound("participant"));
        };

        conn.assign_identity(ClientIdentity {
            session_id: session.id.clone(),
            participant_id: host.id.clone(),
            user_name: host.name.clone(),
        })
        .await;
        self.hub
            .register(&session.id, &host.id, &host.name, conn.handle.clone())
            .await;

        conn.handle.send(ServerMessage::SessionCreated {
            session_code: session.code.clone(),
            session_id: session.id.clone(),
            user_id: host.id.clone(),
            user_name: host.name,
            participants: session.participant_list().await,
            phase: session.phase().await,
        });
    }

    async fn join_session(&self, conn: &Connection, session_code: &str, user_name: &str) {
        if conn.identity().await.is_some() {
            return self.send_error(
                conn,
                &SessionError::Validation("already in a session".to_string()),
            );
        }
        let name = match validate_user_name(user_name) {
            Ok(name) => name,
            Err(e) => return self.send_error(conn, &e),
        };
        let session = match self.registry.get_by_code(session_code).await {
            Ok(session) => session,
            Err(e) => return self.send_error(conn, &e),
        };
        if let Err(e) = check_participant_limit(session.participant_count().await) {
            return self.send_error(conn, &e);
        }

        let participant = match session.add_participant(&name).await {
            Ok(participant) => participant,
            Err(e) => return self.send_error(conn, &e),
        };

        conn.assign_identity(ClientIdentity {
            session_id: session.id.clone(),
            participant_id: participant.id.clone(),
            user_name: participant.name.clone(),
        })
        .await;
        self.hub
            .register(&session.id, &participant.id, &participant.name, conn.handle.clone())
            .await;

        let participants = session.participant_list().await;
        conn.handle.send(ServerMessage::SessionJoined {
            session_code: session.code.clone(),
            session_id: session.id.clone(),
            user_id: participant.id.clone(),
            user_name: participant.name.clone(),
            participants: participants.clone(),
            phase: session.phase().await,
        });
        self.hub
            .broadcast_except(
                &session.id,
                &participant.id,
                &ServerMessage::ParticipantJoined {
                    participant: participant.clone(),
                    participants,
                },
            )
            .await;
        info!(session = %session.code, participant = %participant.id, "participant joined");
    }

    async fn start_writing(&self, conn: &Connection) {
        let Some((identity, session)) = self.identified(conn).await else {
            return;
        };
        if identity.participant_id != session.host_id().await {
            return self.send_error(
                conn,
                &SessionError::Forbidden("only the host can start the writing phase"),
            );
        }
        if let Err(e) = session.start_writing().await {
            return self.send_error(conn, &e);
        }

        let participants = session.participant_list().await;
        let total_notes_needed = participants.len().saturating_sub(1);
        self.hub
            .broadcast(
                &session.id,
                &ServerMessage::PhaseChanged {
                    phase: session.phase().await,
                    participants: Some(participants),
                    total_notes_needed: Some(total_notes_needed),
                    current_reader: None,
                },
            )
            .await;
        info!(session = %session.code, "writing phase started");
    }

    async fn submit_notes(&self, conn: &Connection, notes: Vec<NoteDraft>) {
        let Some((identity, session)) = self.identified(conn).await else {
            return;
        };

        for draft in &notes {
            let content = match validate_note_content(&draft.content) {
                Ok(content) => content,
                Err(e) => return self.send_error(conn, &e),
            };
            if let Err(e) = session
                .add_note(&identity.participant_id, &draft.recipient_id, &content)
                .await
            {
                warn!(session = %session.code, "rejected note: {e}");
                return self.send_error(conn, &e);
            }
        }

        conn.handle
            .send(ServerMessage::NotesSubmitted { success: true });

        // Every ordered pair covered: move straight to reading.
        let participant_count = session.participant_count().await;
        let expected = participant_count * participant_count.saturating_sub(1);
        if session.note_count().await == expected {
            match session.start_reading().await {
                Ok(()) => {
                    self.hub
                        .broadcast(
                            &session.id,
                            &ServerMessage::PhaseChanged {
                                phase: session.phase().await,
                                participants: None,
                                total_notes_needed: None,
                                current_reader: session.current_reader().await,
                            },
                        )
                        .await;
                    info!(session = %session.code, "reading phase started");
                }
                Err(e) => warn!(session = %session.code, "could not start reading: {e}"),
            }
        }
    }

    async fn draw_note(&self, conn: &Connection) {
        let Some((identity, session)) = self.identified(conn).await else {
            return;
        };
        if !self.is_current_reader(&session, &identity.participant_id).await {
            return self.send_error(conn, &SessionError::Forbidden("not your turn"));
        }

        let available = session.available_notes_for(&identity.participant_id).await;
        if available.is_empty() {
            // Nothing drawable for this reader; pass the turn on.
            info!(
                session = %session.code,
                reader = %identity.participant_id,
                "no available notes, auto-advancing turn"
            );
            session.advance_turn().await;
            self.broadcast_turn_outcome(&session).await;
            return;
        }

        let note = {
            let mut rng = rand::rng();
            available[rng.random_range(0..available.len())].clone()
        };
        let recipient = session
            .participant_name(&note.recipient_id)
            .await
            .unwrap_or_default();

        let remaining = session.unread_count().await.saturating_sub(1);
        let total = session.note_count().await;
        self.hub
            .broadcast(
                &session.id,
                &ServerMessage::NoteDrawn {
                    note: DrawnNote {
                        id: note.id,
                        content: note.content,
                        recipient,
                    },
                    remaining,
                    total,
                },
            )
            .await;
        info!(session = %session.code, reader = %identity.participant_id, "note drawn");
    }

    async fn note_read(&self, conn: &Connection, note_id: Option<&str>) {
        let Some((identity, session)) = self.identified(conn).await else {
            return;
        };
        if !self.is_current_reader(&session, &identity.participant_id).await {
            return self.send_error(conn, &SessionError::Forbidden("not your turn"));
        }

        match note_id {
            Some(note_id) => {
                if let Err(e) = session.mark_note_read(note_id).await {
                    warn!(session = %session.code, "could not mark note read: {e}");
                }
            }
            None => warn!(session = %session.code, "note_read without a noteId"),
        }

        session.advance_turn().await;
        self.broadcast_turn_outcome(&session).await;
    }

    async fn remove_participant(&self, conn: &Connection, participant_id: &str) {
        let Some((identity, session)) = self.identified(conn).await else {
            return;
        };
        if identity.participant_id != session.host_id().await {
            return self.send_error(
                conn,
                &SessionError::Forbidden("only the host can remove participants"),
            );
        }
        if participant_id == identity.participant_id {
            return self.send_error(conn, &SessionError::Forbidden("cannot remove yourself"));
        }

        let removed = match session.remove_participant(participant_id).await {
            Ok(removed) => removed,
            Err(e) => return self.send_error(conn, &e),
        };

        self.hub
            .send_to_participant(
                &session.id,
                participant_id,
                &ServerMessage::Kicked {
                    message: "You have been removed from the session by the host".to_string(),
                },
            )
            .await;
        self.hub
            .broadcast(
                &session.id,
                &ServerMessage::ParticipantLeft {
                    participant: removed,
                    participants: session.participant_list().await,
                    was_host: false,
                    was_removed: true,
                },
            )
            .await;
        info!(session = %session.code, participant = participant_id, "participant removed by host");
    }

    /// After a turn advance: announce the new reader, or the completed
    /// session with its anonymized notes.
    async fn broadcast_turn_outcome(&self, session: &Arc<Session>) {
        if session.phase().await == Phase::Complete {
            self.metrics.session_completed();
            let notes = session
                .notes()
                .await
                .into_iter()
                .map(|note| RevealedNote {
                    id: note.id,
                    content: note.content,
                    recipient_id: note.recipient_id,
                })
                .collect();
            self.hub
                .broadcast(
                    &session.id,
                    &ServerMessage::SessionComplete {
                        message: COMPLETE_MESSAGE.to_string(),
                        notes,
                    },
                )
                .await;
            info!(session = %session.code, "session complete");
            return;
        }

        let Some(reader) = session.current_reader().await else {
            return;
        };
        let remaining = session.unread_count().await;
        let total = session.note_count().await;
        self.hub
            .broadcast(
                &session.id,
                &ServerMessage::TurnChanged {
                    reader,
                    remaining,
                    total,
                },
            )
            .await;
    }

    async fn is_current_reader(&self, session: &Arc<Session>, participant_id: &str) -> bool {
        session
            .current_reader()
            .await
            .is_some_and(|reader| reader.id == participant_id)
    }

    /// Resolve the connection's identity and session, reporting an error to
    /// the client when either is missing.
    async fn identified(&self, conn: &Connection) -> Option<(ClientIdentity, Arc<Session>)> {
        let Some(identity) = conn.identity().await else {
            self.send_error(conn, &SessionError::NotFound("session"));
            return None;
        };
        match self.registry.get_by_id(&identity.session_id).await {
            Ok(session) => Some((identity, session)),
            Err(e) => {
                self.send_error(conn, &e);
                None
            }
        }
    }

    fn send_error(&self, conn: &Connection, err: &SessionError) {
        debug!(connection = %conn.handle.id, "rejected: {err}");
        conn.handle.send(ServerMessage::Error {
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::ConnectionHandle;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    struct TestClient {
        conn: Arc<Connection>,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        fn new(metrics: &Arc<ServerMetrics>) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let handle = ConnectionHandle::new(tx, CancellationToken::new(), metrics.clone());
            Self {
                conn: Arc::new(Connection::new(handle)),
                rx,
            }
        }

        async fn next(&mut self) -> ServerMessage {
            timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timed out waiting for message")
                .expect("channel closed")
        }
    }

    struct Harness {
        hub: Arc<Hub>,
        registry: Arc<SessionRegistry>,
        coordinator: Arc<Coordinator>,
        metrics: Arc<ServerMetrics>,
    }

    fn harness() -> Harness {
        let metrics = Arc::new(ServerMetrics::new());
        let hub = Arc::new(Hub::new());
        let registry = Arc::new(SessionRegistry::new());
        let coordinator = Arc::new(Coordinator::new(
            hub.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        attach_disconnect_handler(&hub, coordinator.clone());
        Harness {
            hub,
            registry,
            coordinator,
            metrics,
        }
    }

    /// Create a session for Alice and join Bob; returns both clients plus
    /// their participant ids and the session code.
    async fn two_person_session(h: &Harness) -> (TestClient, TestClient, String, String, String) {
        let mut alice = TestClient::new(&h.metrics);
        h.coordinator
            .handle_message(
                &alice.conn,
                ClientMessage::CreateSession {
                    user_name: "Alice".to_string(),
                },
            )
            .await;
        let (code, alice_id) = match alice.next().await {
            ServerMessage::SessionCreated {
                session_code,
                user_id,
                participants,
                phase,
                ..
            } => {
                assert_eq!(phase, Phase::Joining);
                assert_eq!(participants.len(), 1);
                (session_code, user_id)
            }
            other => panic!("expected session_created, got {other:?}"),
        };

        let mut bob = TestClient::new(&h.metrics);
        h.coordinator
            .handle_message(
                &bob.conn,
                ClientMessage::JoinSession {
                    session_code: code.to_lowercase(),
                    user_name: "Bob".to_string(),
                },
            )
            .await;
        let bob_id = match bob.next().await {
            ServerMessage::SessionJoined {
                user_id,
                participants,
                ..
            } => {
                assert_eq!(participants.len(), 2);
                user_id
            }
            other => panic!("expected session_joined, got {other:?}"),
        };
        match alice.next().await {
            ServerMessage::ParticipantJoined { participant, .. } => {
                assert_eq!(participant.id, bob_id);
            }
            other => panic!("expected participant_joined, got {other:?}"),
        }

        (alice, bob, alice_id, bob_id, code)
    }

    #[tokio::test]
    async fn validate_session_reports_existence() {
        let h = harness();
        let (_alice, _bob, _, _, code) = two_person_session(&h).await;

        let mut probe = TestClient::new(&h.metrics);
        h.coordinator
            .handle_message(
                &probe.conn,
                ClientMessage::ValidateSession {
                    session_code: code.to_lowercase(),
                },
            )
            .await;
        assert!(matches!(
            probe.next().await,
            ServerMessage::SessionValidation { valid: true, .. }
        ));

        h.coordinator
            .handle_message(
                &probe.conn,
                ClientMessage::ValidateSession {
                    session_code: "ZZZZZZ".to_string(),
                },
            )
            .await;
        assert!(matches!(
            probe.next().await,
            ServerMessage::SessionValidation { valid: false, .. }
        ));
    }

    #[tokio::test]
    async fn create_session_rejects_blank_names() {
        let h = harness();
        let mut client = TestClient::new(&h.metrics);
        h.coordinator
            .handle_message(
                &client.conn,
                ClientMessage::CreateSession {
                    user_name: "   ".to_string(),
                },
            )
            .await;
        assert!(matches!(client.next().await, ServerMessage::Error { .. }));
        assert_eq!(h.registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn only_the_host_starts_writing() {
        let h = harness();
        let (mut alice, mut bob, _, _, _) = two_person_session(&h).await;

        h.coordinator
            .handle_message(&bob.conn, ClientMessage::StartWriting)
            .await;
        match bob.next().await {
            ServerMessage::Error { message } => assert!(message.contains("host")),
            other => panic!("expected error, got {other:?}"),
        }

        h.coordinator
            .handle_message(&alice.conn, ClientMessage::StartWriting)
            .await;
        for client in [&mut alice, &mut bob] {
            match client.next().await {
                ServerMessage::PhaseChanged {
                    phase,
                    total_notes_needed,
                    ..
                } => {
                    assert_eq!(phase, Phase::Writing);
                    assert_eq!(total_notes_needed, Some(1));
                }
                other => panic!("expected phase_changed, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn full_two_person_flow_reaches_completion() {
        let h = harness();
        let (mut alice, mut bob, alice_id, bob_id, _) = two_person_session(&h).await;

        h.coordinator
            .handle_message(&alice.conn, ClientMessage::StartWriting)
            .await;
        alice.next().await;
        bob.next().await;

        h.coordinator
            .handle_message(
                &alice.conn,
                ClientMessage::SubmitNotes {
                    notes: vec![NoteDraft {
                        recipient_id: bob_id.clone(),
                        content: "Thanks for everything, Bob".to_string(),
                    }],
                },
            )
            .await;
        assert!(matches!(
            alice.next().await,
            ServerMessage::NotesSubmitted { success: true }
        ));

        h.coordinator
            .handle_message(
                &bob.conn,
                ClientMessage::SubmitNotes {
                    notes: vec![NoteDraft {
                        recipient_id: alice_id.clone(),
                        content: "Right back at you, Alice".to_string(),
                    }],
                },
            )
            .await;
        assert!(matches!(
            bob.next().await,
            ServerMessage::NotesSubmitted { success: true }
        ));

        // 2 × 1 notes in: automatic transition to reading.
        let mut reader_id = match (alice.next().await, bob.next().await) {
            (
                ServerMessage::PhaseChanged {
                    phase,
                    current_reader: Some(reader),
                    ..
                },
                ServerMessage::PhaseChanged { .. },
            ) => {
                assert_eq!(phase, Phase::Reading);
                reader.id
            }
            other => panic!("expected phase_changed pair, got {other:?}"),
        };

        // Two notes to read; each reader draws the note addressed to
        // themselves (two-person exception), reads it, and passes the turn.
        for round in 0..2 {
            let reader_conn = if reader_id == alice_id {
                alice.conn.clone()
            } else {
                bob.conn.clone()
            };

            // The other participant may not draw.
            let off_turn = if reader_id == alice_id {
                &mut bob
            } else {
                &mut alice
            };
            h.coordinator
                .handle_message(&off_turn.conn.clone(), ClientMessage::DrawNote)
                .await;
            match off_turn.next().await {
                ServerMessage::Error { message } => assert!(message.contains("turn")),
                other => panic!("expected error, got {other:?}"),
            }

            h.coordinator
                .handle_message(&reader_conn, ClientMessage::DrawNote)
                .await;
            let note_id = match (alice.next().await, bob.next().await) {
                (ServerMessage::NoteDrawn { note, total, .. }, ServerMessage::NoteDrawn { .. }) => {
                    assert_eq!(total, 2);
                    note.id
                }
                other => panic!("expected note_drawn pair, got {other:?}"),
            };

            h.coordinator
                .handle_message(
                    &reader_conn,
                    ClientMessage::NoteRead {
                        note_id: Some(note_id),
                    },
                )
                .await;

            if round == 0 {
                reader_id = match (alice.next().await, bob.next().await) {
                    (
                        ServerMessage::TurnChanged {
                            reader, remaining, ..
                        },
                        ServerMessage::TurnChanged { .. },
                    ) => {
                        assert_eq!(remaining, 1);
                        reader.id
                    }
                    other => panic!("expected turn_changed pair, got {other:?}"),
                };
            } else {
                match (alice.next().await, bob.next().await) {
                    (
                        ServerMessage::SessionComplete { notes, .. },
                        ServerMessage::SessionComplete { .. },
                    ) => assert_eq!(notes.len(), 2),
                    other => panic!("expected session_complete pair, got {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn host_can_kick_but_not_self() {
        let h = harness();
        let (mut alice, mut bob, alice_id, bob_id, _) = two_person_session(&h).await;

        h.coordinator
            .handle_message(
                &alice.conn,
                ClientMessage::RemoveParticipant {
                    participant_id: alice_id.clone(),
                },
            )
            .await;
        match alice.next().await {
            ServerMessage::Error { message } => assert!(message.contains("yourself")),
            other => panic!("expected error, got {other:?}"),
        }

        h.coordinator
            .handle_message(
                &bob.conn,
                ClientMessage::RemoveParticipant {
                    participant_id: alice_id.clone(),
                },
            )
            .await;
        assert!(matches!(bob.next().await, ServerMessage::Error { .. }));

        h.coordinator
            .handle_message(
                &alice.conn,
                ClientMessage::RemoveParticipant {
                    participant_id: bob_id.clone(),
                },
            )
            .await;
        assert!(matches!(bob.next().await, ServerMessage::Kicked { .. }));
        for client in [&mut alice, &mut bob] {
            match client.next().await {
                ServerMessage::ParticipantLeft {
                    participant,
                    was_removed,
                    was_host,
                    participants,
                } => {
                    assert_eq!(participant.id, bob_id);
                    assert!(was_removed);
                    assert!(!was_host);
                    assert_eq!(participants.len(), 1);
                }
                other => panic!("expected participant_left, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn host_disconnect_fails_over_to_remaining_participant() {
        let h = harness();
        let (alice, mut bob, alice_id, bob_id, _) = two_person_session(&h).await;

        let identity = alice.conn.identity().await.expect("alice has identity");
        h.hub
            .unregister(&identity.session_id, alice.conn.handle.id)
            .await;

        match bob.next().await {
            ServerMessage::ParticipantLeft {
                participant,
                was_host,
                participants,
                ..
            } => {
                assert_eq!(participant.id, alice_id);
                assert!(was_host);
                assert_eq!(participants.len(), 1);
                assert!(participants[0].is_host);
            }
            other => panic!("expected participant_left, got {other:?}"),
        }

        let session = h.registry.get_by_id(&identity.session_id).await.unwrap();
        assert_eq!(session.host_id().await, bob_id);
    }

    #[tokio::test]
    async fn last_disconnect_removes_the_session() {
        let h = harness();
        let (alice, bob, _, _, _) = two_person_session(&h).await;
        let session_id = alice.conn.identity().await.unwrap().session_id;

        h.hub.unregister(&session_id, alice.conn.handle.id).await;
        h.hub.unregister(&session_id, bob.conn.handle.id).await;

        // Disconnect handling runs in spawned tasks; wait for the registry
        // to empty out.
        timeout(Duration::from_secs(1), async {
            while h.registry.active_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not removed");
    }

    #[tokio::test]
    async fn messages_before_joining_are_rejected() {
        let h = harness();
        let mut loner = TestClient::new(&h.metrics);

        h.coordinator
            .handle_message(&loner.conn, ClientMessage::StartWriting)
            .await;
        assert!(matches!(loner.next().await, ServerMessage::Error { .. }));

        h.coordinator
            .handle_message(&loner.conn, ClientMessage::DrawNote)
            .await;
        assert!(matches!(loner.next().await, ServerMessage::Error { .. }));
    }
}
