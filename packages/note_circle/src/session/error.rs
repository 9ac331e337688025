use thiserror::Error;

use super::session::Phase;

/// Domain errors for session operations.
///
/// Every variant is recoverable: the coordinator reports them back to the
/// originating connection as an `error` message and the session and the
/// connection both stay alive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("cannot join: session has already started")]
    AlreadyStarted,

    #[error("requires the {required} phase (currently {current})")]
    InvalidTransition { required: Phase, current: Phase },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("a note for this person has already been written")]
    Duplicate,

    #[error("cannot write a note to yourself")]
    SelfReference,

    #[error("need at least 2 participants to start")]
    NotEnoughParticipants,

    #[error("not all notes have been written")]
    Incomplete,

    #[error("{0}")]
    Forbidden(&'static str),
}
