use std::fmt;

use serde::Serialize;

/// Which side of the description exchange this participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    /// The relay flags the first participant of a session as `initiator`, and
    /// that participant waits for the offer. The second one creates it.
    pub fn from_initiator(initiator: bool) -> Self {
        if initiator {
            Role::Answerer
        } else {
            Role::Offerer
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Offerer => "offerer",
            Role::Answerer => "answerer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Joining,
    Joined,
    OfferPending,
    OfferSent,
    AwaitingOffer,
    AnswerSent,
    AwaitingAnswer,
    AwaitingConnected,
    Connected,
    Failed,
    Ended,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Failed | Phase::Ended)
    }

    /// The transition table. Every phase change goes through here.
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Init, Joining) => true,
            (Joining, Joined) => true,
            (Joined, OfferPending) | (Joined, AwaitingOffer) => true,
            (OfferPending, OfferSent) => true,
            (OfferSent, AwaitingAnswer) => true,
            (AwaitingOffer, AnswerSent) => true,
            (AnswerSent, AwaitingConnected) => true,
            (AwaitingAnswer, AwaitingConnected) => true,
            (AwaitingConnected, Connected) => true,
            (from, Failed) => !from.is_terminal() && from != Connected,
            (from, Ended) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Joining => "joining",
            Phase::Joined => "joined",
            Phase::OfferPending => "offer_pending",
            Phase::OfferSent => "offer_sent",
            Phase::AwaitingOffer => "awaiting_offer",
            Phase::AnswerSent => "answer_sent",
            Phase::AwaitingAnswer => "awaiting_answer",
            Phase::AwaitingConnected => "awaiting_connected",
            Phase::Connected => "connected",
            Phase::Failed => "failed",
            Phase::Ended => "ended",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
