use dashmap::DashMap;
use tandem_proto::Envelope;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// What the socket writer task is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(Envelope),
    /// Close the socket with a reason.
    Close(String),
}

#[derive(Debug, Clone)]
struct Member {
    participant: String,
    connection: String,
    initiator: bool,
    tx: mpsc::UnboundedSender<Outbound>,
    last_seen: Instant,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("session is full")]
    Full,
}

/// A forwarding target.
#[derive(Debug, Clone)]
pub struct Peer {
    pub participant: String,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

/// Call rooms keyed by session id. A room holds at most two participants.
#[derive(Debug, Default)]
pub struct Rooms {
    sessions: DashMap<String, Vec<Member>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `participant` on `connection`. Returns the `initiator` flag
    /// for its `JOIN_ACK`: the first member of a room is the initiator, and a
    /// newcomer takes the flag when the initiator has already left. A
    /// participant joining again keeps its flag and moves to the new
    /// connection.
    pub fn join(
        &self,
        session_id: &str,
        participant: &str,
        connection: &str,
        tx: mpsc::UnboundedSender<Outbound>,
        now: Instant,
    ) -> Result<bool, JoinError> {
        let mut room = self.sessions.entry(session_id.to_string()).or_default();

        if let Some(member) = room.iter_mut().find(|m| m.participant == participant) {
            if member.connection != connection {
                let _ = member
                    .tx
                    .send(Outbound::Close("replaced by a newer connection".into()));
            }
            member.connection = connection.to_string();
            member.tx = tx;
            member.last_seen = now;
            return Ok(member.initiator);
        }

        if room.len() >= 2 {
            return Err(JoinError::Full);
        }
        let initiator = !room.iter().any(|m| m.initiator);
        room.push(Member {
            participant: participant.to_string(),
            connection: connection.to_string(),
            initiator,
            tx,
            last_seen: now,
        });
        Ok(initiator)
    }

    /// The other member of the room `connection` belongs to.
    pub fn peer_of(&self, session_id: &str, connection: &str) -> Option<Peer> {
        let room = self.sessions.get(session_id)?;
        if !room.iter().any(|m| m.connection == connection) {
            return None;
        }
        room.iter()
            .find(|m| m.connection != connection)
            .map(|m| Peer {
                participant: m.participant.clone(),
                tx: m.tx.clone(),
            })
    }

    pub fn touch(&self, session_id: &str, connection: &str, now: Instant) {
        if let Some(mut room) = self.sessions.get_mut(session_id) {
            if let Some(member) = room.iter_mut().find(|m| m.connection == connection) {
                member.last_seen = now;
            }
        }
    }

    /// Removes whoever is registered on `connection`. A connection that was
    /// replaced by a re-join removes nothing.
    pub fn leave(&self, session_id: &str, connection: &str) -> Option<String> {
        let mut left = None;
        let mut empty = false;
        if let Some(mut room) = self.sessions.get_mut(session_id) {
            if let Some(index) = room.iter().position(|m| m.connection == connection) {
                left = Some(room.remove(index).participant);
            }
            empty = room.is_empty();
        }
        if empty {
            self.sessions.remove_if(session_id, |_, room| room.is_empty());
        }
        left
    }

    /// Drops members not heard from within `timeout` and asks their sockets
    /// to close. Returns `(session_id, participant)` for each.
    pub fn evict_stale(&self, timeout: Duration, now: Instant) -> Vec<(String, String)> {
        let mut evicted = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session_id = entry.key().clone();
            entry.value_mut().retain(|member| {
                if now.saturating_duration_since(member.last_seen) <= timeout {
                    return true;
                }
                let _ = member.tx.send(Outbound::Close("heartbeat timeout".into()));
                evicted.push((session_id.clone(), member.participant.clone()));
                false
            });
        }
        self.sessions.retain(|_, room| !room.is_empty());
        evicted
    }

    pub fn member_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map(|r| r.len()).unwrap_or(0)
    }
}
