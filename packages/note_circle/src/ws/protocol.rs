//! WebSocket protocol types
//!
//! Envelope format is `{"type": "...", "data": {...}}` with snake_case type
//! names and camelCase payload keys. Connection-derived context (session id,
//! participant id, display name) is attached server-side from the owning
//! connection, never taken from the peer.

use serde::{Deserialize, Serialize};

use crate::session::{Participant, Phase};

/// One note draft inside a `submit_notes` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDraft {
    pub recipient_id: String,
    pub content: String,
}

/// A drawn note as shown to the whole group: recipient by display name,
/// author never revealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawnNote {
    pub id: String,
    pub content: String,
    pub recipient: String,
}

/// A note in the end-of-session reveal. Still anonymous: recipient id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealedNote {
    pub id: String,
    pub content: String,
    pub recipient_id: String,
}

/// Messages sent FROM the client TO the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Check whether a join code refers to a live session, without joining.
    #[serde(rename_all = "camelCase")]
    ValidateSession { session_code: String },

    /// Create a new session with the sender as host.
    #[serde(rename_all = "camelCase")]
    CreateSession { user_name: String },

    /// Join an existing session by code.
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_code: String,
        user_name: String,
    },

    /// Host-only: move the session into the writing phase.
    StartWriting,

    /// Submit the sender's notes, one per recipient.
    SubmitNotes { notes: Vec<NoteDraft> },

    /// Draw a random note; only valid for the current reader.
    DrawNote,

    /// Mark the drawn note as read and pass the turn on.
    #[serde(rename_all = "camelCase")]
    NoteRead {
        #[serde(default)]
        note_id: Option<String>,
    },

    /// Host-only: remove a participant from the session.
    #[serde(rename_all = "camelCase")]
    RemoveParticipant { participant_id: String },
}

/// Messages sent FROM the server TO clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to `validate_session`.
    SessionValidation {
        valid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Confirmation to the host after `create_session`.
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_code: String,
        session_id: String,
        user_id: String,
        user_name: String,
        participants: Vec<Participant>,
        phase: Phase,
    },

    /// Confirmation to the joiner after `join_session`.
    #[serde(rename_all = "camelCase")]
    SessionJoined {
        session_code: String,
        session_id: String,
        user_id: String,
        user_name: String,
        participants: Vec<Participant>,
        phase: Phase,
    },

    /// Broadcast to the rest of the group when someone joins.
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        participant: Participant,
        participants: Vec<Participant>,
    },

    /// Broadcast when someone leaves, is removed, or disconnects.
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        participant: Participant,
        participants: Vec<Participant>,
        was_host: bool,
        #[serde(default)]
        was_removed: bool,
    },

    /// Unicast to a participant removed by the host.
    Kicked { message: String },

    /// Best-effort notice before an inactivity disconnect.
    Timeout { message: String },

    /// Broadcast on every phase transition.
    #[serde(rename_all = "camelCase")]
    PhaseChanged {
        phase: Phase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participants: Option<Vec<Participant>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_notes_needed: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_reader: Option<Participant>,
    },

    /// Acknowledgement of a `submit_notes` request.
    NotesSubmitted { success: bool },

    /// Broadcast when the turn passes to a new reader.
    TurnChanged {
        reader: Participant,
        remaining: usize,
        total: usize,
    },

    /// Broadcast when the current reader draws a note.
    NoteDrawn {
        note: DrawnNote,
        remaining: usize,
        total: usize,
    },

    /// Broadcast once every note has been read.
    SessionComplete {
        message: String,
        notes: Vec<RevealedNote>,
    },

    /// Recoverable error, reported only to the originating connection.
    Error { message: String },
}
