use tandem_proto::{Envelope, ProtoError, Signal, new_trace_id};

/// Identity of the active call as seen on the wire.
///
/// Every outbound envelope is produced by [`SessionScope::stamp`], so the
/// session id, reservation id and sender are never supplied by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionScope {
    session_id: String,
    reservation_id: String,
    participant_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Accept,
    ForeignSession,
    Loopback,
}

impl SessionScope {
    pub fn new(
        session_id: impl Into<String>,
        reservation_id: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            reservation_id: reservation_id.into(),
            participant_id: participant_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn reservation_id(&self) -> &str {
        &self.reservation_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn stamp(&self, signal: Signal) -> Result<Envelope, ProtoError> {
        let (kind, payload) = signal.into_parts()?;
        Ok(Envelope {
            kind,
            session_id: self.session_id.clone(),
            reservation_id: self.reservation_id.clone(),
            from: Some(self.participant_id.clone()),
            to: None,
            payload,
            ts: chrono::Utc::now().timestamp_millis(),
            trace_id: new_trace_id(),
        })
    }

    /// Decides whether an inbound envelope belongs to this participant's view
    /// of the session.
    pub fn admit(&self, envelope: &Envelope) -> Admit {
        if envelope.session_id != self.session_id {
            return Admit::ForeignSession;
        }
        if envelope.from.as_deref() == Some(self.participant_id.as_str()) {
            return Admit::Loopback;
        }
        Admit::Accept
    }
}
