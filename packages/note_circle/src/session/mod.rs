//! Session domain: state machine, registry, and error taxonomy.

mod error;
mod registry;
mod session;

pub use error::SessionError;
pub use registry::SessionRegistry;
pub use session::{Note, Participant, Phase, Session, SweepView};
