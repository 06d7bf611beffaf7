pub mod config;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod sink;
pub mod telemetry;
pub mod transport;

pub use session::{
    CallSession, EndReason, Participant, SessionConfig, SessionDeps, SessionError, SessionHandle,
    SessionOutcome, SessionParams, SessionStatus,
};

#[cfg(test)]
pub(crate) mod testing;
