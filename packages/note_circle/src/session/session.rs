//! Session state machine
//!
//! A session moves strictly forward through JOINING → WRITING → READING →
//! COMPLETE. All mutable state lives behind a single `RwLock`; every
//! operation takes the lock for its full duration, so observers always see
//! a consistent roster/notes/turn view.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::error::SessionError;

/// Current phase of a note circle session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Joining,
    Writing,
    Reading,
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Joining => "JOINING",
            Phase::Writing => "WRITING",
            Phase::Reading => "READING",
            Phase::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

/// A person in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub is_host: bool,
    pub joined_at: DateTime<Utc>,
}

/// One appreciation note from one participant to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub recipient_id: String,
    pub read: bool,
}

/// Consistent snapshot used by the registry sweep to decide eviction.
#[derive(Debug, Clone, Copy)]
pub struct SweepView {
    pub phase: Phase,
    pub participant_count: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct SessionState {
    phase: Phase,
    participants: HashMap<String, Participant>,
    notes: Vec<Note>,
    host_id: String,
    current_turn: u64,
    completed_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Participants in stable sorted order by id, so every caller derives
    /// the same turn order from the same counter value.
    fn sorted_participants(&self) -> Vec<&Participant> {
        let mut participants: Vec<&Participant> = self.participants.values().collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }

    /// Notes the given reader may draw: unread, not authored by them, and in
    /// sessions with more than two people, not addressed to them either. With
    /// exactly two participants a reader may draw a note addressed to
    /// themselves, since nobody else could.
    fn available_notes(&self, reader_id: &str) -> Vec<&Note> {
        let participant_count = self.participants.len();
        self.notes
            .iter()
            .filter(|note| !note.read)
            .filter(|note| note.author_id != reader_id)
            .filter(|note| participant_count <= 2 || note.recipient_id != reader_id)
            .collect()
    }

    fn current_reader(&self) -> Option<&Participant> {
        if self.phase != Phase::Reading {
            return None;
        }
        let order = self.sorted_participants();
        if order.is_empty() {
            return None;
        }
        let index = (self.current_turn % order.len() as u64) as usize;
        Some(order[index])
    }
}

/// One instance of the group activity.
///
/// `id`, `code` and `created_at` are fixed at creation; everything else is
/// guarded by the internal lock. The registry owns the session's lifetime,
/// the session owns its own fields — no other component mutates them.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
}

impl Session {
    /// Create a session in JOINING phase with the host as sole participant.
    pub fn new(host_name: &str, code: String) -> Self {
        let host = Participant {
            id: generate_id(),
            name: host_name.to_string(),
            is_host: true,
            joined_at: Utc::now(),
        };
        let host_id = host.id.clone();

        Self {
            id: generate_id(),
            code,
            created_at: Utc::now(),
            state: RwLock::new(SessionState {
                phase: Phase::Joining,
                participants: HashMap::from([(host_id.clone(), host)]),
                notes: Vec::new(),
                host_id,
                current_turn: 0,
                completed_at: None,
            }),
        }
    }

    /// Add a new (non-host) participant. Only valid while JOINING.
    pub async fn add_participant(&self, name: &str) -> Result<Participant, SessionError> {
        let mut state = self.state.write().await;

        if state.phase != Phase::Joining {
            return Err(SessionError::AlreadyStarted);
        }

        let participant = Participant {
            id: generate_id(),
            name: name.to_string(),
            is_host: false,
            joined_at: Utc::now(),
        };
        state
            .participants
            .insert(participant.id.clone(), participant.clone());
        Ok(participant)
    }

    /// Move from JOINING to WRITING. Requires at least two participants.
    pub async fn start_writing(&self) -> Result<(), SessionError> {
        let mut state = self.state.write().await;

        if state.phase != Phase::Joining {
            return Err(SessionError::InvalidTransition {
                required: Phase::Joining,
                current: state.phase,
            });
        }
        if state.participants.len() < 2 {
            return Err(SessionError::NotEnoughParticipants);
        }

        state.phase = Phase::Writing;
        Ok(())
    }

    /// Record a note from `author_id` to `recipient_id`. Only valid while
    /// WRITING; each ordered (author, recipient) pair may have one note.
    pub async fn add_note(
        &self,
        author_id: &str,
        recipient_id: &str,
        content: &str,
    ) -> Result<Note, SessionError> {
        let mut state = self.state.write().await;

        if state.phase != Phase::Writing {
            return Err(SessionError::InvalidTransition {
                required: Phase::Writing,
                current: state.phase,
            });
        }
        if !state.participants.contains_key(author_id) {
            return Err(SessionError::NotFound("author"));
        }
        if !state.participants.contains_key(recipient_id) {
            return Err(SessionError::NotFound("recipient"));
        }
        if author_id == recipient_id {
            return Err(SessionError::SelfReference);
        }
        if state
            .notes
            .iter()
            .any(|note| note.author_id == author_id && note.recipient_id == recipient_id)
        {
            return Err(SessionError::Duplicate);
        }

        let note = Note {
            id: generate_id(),
            content: content.to_string(),
            author_id: author_id.to_string(),
            recipient_id: recipient_id.to_string(),
            read: false,
        };
        state.notes.push(note.clone());
        Ok(note)
    }

    /// Move from WRITING to READING. Requires every ordered pair to have
    /// exactly one note: N × (N − 1) notes total.
    pub async fn start_reading(&self) -> Result<(), SessionError> {
        let mut state = self.state.write().await;

        if state.phase != Phase::Writing {
            return Err(SessionError::InvalidTransition {
                required: Phase::Writing,
                current: state.phase,
            });
        }
        let expected = state.participants.len() * (state.participants.len() - 1);
        if state.notes.len() != expected {
            return Err(SessionError::Incomplete);
        }

        state.phase = Phase::Reading;
        Ok(())
    }

    /// Flip a note's read flag. Re-marking an already-read note is not an
    /// error, just unnecessary.
    pub async fn mark_note_read(&self, note_id: &str) -> Result<(), SessionError> {
        let mut state = self.state.write().await;

        match state.notes.iter_mut().find(|note| note.id == note_id) {
            Some(note) => {
                note.read = true;
                Ok(())
            }
            None => Err(SessionError::NotFound("note")),
        }
    }

    /// The participant whose turn it is: `current_turn mod N` over the roster
    /// sorted by id. None outside the READING phase.
    pub async fn current_reader(&self) -> Option<Participant> {
        self.state.read().await.current_reader().cloned()
    }

    /// Notes the given reader may currently draw.
    pub async fn available_notes_for(&self, reader_id: &str) -> Vec<Note> {
        self.state
            .read()
            .await
            .available_notes(reader_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Advance to the next reader with at least one available note, skipping
    /// readers with nothing to draw. If a full cycle through the roster finds
    /// nobody, the session completes — even if unread notes technically
    /// remain, which guards against livelock when read flags and
    /// availability filtering disagree.
    pub async fn advance_turn(&self) {
        let mut state = self.state.write().await;

        if state.phase != Phase::Reading {
            return;
        }

        let order: Vec<String> = state
            .sorted_participants()
            .iter()
            .map(|p| p.id.clone())
            .collect();
        if order.is_empty() {
            return;
        }

        for _ in 0..order.len() {
            state.current_turn += 1;
            let index = (state.current_turn % order.len() as u64) as usize;
            if !state.available_notes(&order[index]).is_empty() {
                return;
            }
        }

        // Full cycle with nothing drawable for anyone.
        let unread = state.notes.iter().filter(|note| !note.read).count();
        if unread > 0 {
            // Should be unreachable: availability filtering and read flags
            // have diverged. Complete anyway rather than livelock.
            warn!(
                session = %self.code,
                unread,
                "no reader can draw but unread notes remain, forcing completion"
            );
        }
        state.phase = Phase::Complete;
        if state.completed_at.is_none() {
            state.completed_at = Some(Utc::now());
        }
    }

    /// Remove a participant in any phase. Host failover and emptiness
    /// handling are the coordinator's job, not done here.
    pub async fn remove_participant(&self, participant_id: &str) -> Result<Participant, SessionError> {
        let mut state = self.state.write().await;

        state
            .participants
            .remove(participant_id)
            .ok_or(SessionError::NotFound("participant"))
    }

    /// Make the sorted-by-id first remaining participant the host. Returns
    /// the new host, or None for an empty roster.
    pub async fn promote_new_host(&self) -> Option<Participant> {
        let mut state = self.state.write().await;

        let new_host_id = state.sorted_participants().first().map(|p| p.id.clone())?;
        state.host_id = new_host_id.clone();
        let host = state.participants.get_mut(&new_host_id)?;
        host.is_host = true;
        Some(host.clone())
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase
    }

    pub async fn host_id(&self) -> String {
        self.state.read().await.host_id.clone()
    }

    /// The current host participant, if the roster is non-empty.
    pub async fn host(&self) -> Option<Participant> {
        let state = self.state.read().await;
        state.participants.get(&state.host_id).cloned()
    }

    pub async fn participant_count(&self) -> usize {
        self.state.read().await.participants.len()
    }

    pub async fn participant_name(&self, participant_id: &str) -> Option<String> {
        self.state
            .read()
            .await
            .participants
            .get(participant_id)
            .map(|p| p.name.clone())
    }

    /// Roster in stable sorted order by id.
    pub async fn participant_list(&self) -> Vec<Participant> {
        self.state
            .read()
            .await
            .sorted_participants()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn notes(&self) -> Vec<Note> {
        self.state.read().await.notes.clone()
    }

    pub async fn note_count(&self) -> usize {
        self.state.read().await.notes.len()
    }

    pub async fn unread_count(&self) -> usize {
        self.state
            .read()
            .await
            .notes
            .iter()
            .filter(|note| !note.read)
            .count()
    }

    /// Snapshot for the registry sweep, taken under this session's own lock
    /// so the decision never races a concurrent join.
    pub async fn sweep_view(&self) -> SweepView {
        let state = self.state.read().await;
        SweepView {
            phase: state.phase,
            participant_count: state.participants.len(),
            completed_at: state.completed_at,
        }
    }

    #[cfg(test)]
    pub(crate) async fn backdate_completion(&self, completed_at: DateTime<Utc>) {
        self.state.write().await.completed_at = Some(completed_at);
    }
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
