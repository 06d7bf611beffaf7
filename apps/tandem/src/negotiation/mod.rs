use std::time::Duration;

use tandem_proto::{
    Envelope, IceCandidate, JoinAck, SdpType, SessionDescription, Signal,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::peer::{PeerConnection, PeerState, SignalingState};
use crate::transport::OutboundSink;

mod candidate_queue;
mod phase;
mod scope;

pub use candidate_queue::{CandidateQueue, FlushReport};
pub use phase::{Phase, Role};
pub use scope::{Admit, SessionScope};

/// How long each waiting phase may last. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationTimeouts {
    pub join_ack: Option<Duration>,
    pub offer: Option<Duration>,
    pub answer: Option<Duration>,
    pub connect: Option<Duration>,
}

impl Default for NegotiationTimeouts {
    fn default() -> Self {
        Self {
            join_ack: Some(Duration::from_secs(15)),
            offer: None,
            answer: Some(Duration::from_secs(30)),
            connect: Some(Duration::from_secs(45)),
        }
    }
}

/// What the session should do after the negotiator handled an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The other participant ended the call.
    Ended,
    /// The relay reported an error. The call is over unless it was already
    /// connected.
    RelayError(String),
    /// The signaling connection went away before the call connected.
    TransportLost(String),
    Failed(String),
}

/// The two things every negotiation step may touch.
pub struct NegotiationIo<'a> {
    pub peer: &'a dyn PeerConnection,
    pub outbound: &'a dyn OutboundSink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationSnapshot {
    pub phase: Phase,
    pub role: Option<Role>,
    pub signaling_open: bool,
    pub joined: bool,
    pub media_ready: bool,
    pub offer_sent: bool,
    pub remote_description_set: bool,
    pub connected_notified: bool,
    pub queued_candidates: usize,
}

/// Drives the offer/answer exchange for one participant.
///
/// All inputs arrive one at a time from the session actor; nothing here is
/// shared. Every phase change goes through [`Phase::can_advance_to`], so an
/// input that arrives late or twice can at worst be ignored.
#[derive(Debug)]
pub struct Negotiator {
    scope: SessionScope,
    phase: Phase,
    phase_entered: Instant,
    role: Option<Role>,
    signaling_open: bool,
    media_ready: bool,
    offer_sent: bool,
    remote_description_set: bool,
    connected_notified: bool,
    candidates: CandidateQueue,
    deferred_offer: Option<SessionDescription>,
}

impl Negotiator {
    pub fn new(scope: SessionScope) -> Self {
        Self {
            scope,
            phase: Phase::Init,
            phase_entered: Instant::now(),
            role: None,
            signaling_open: false,
            media_ready: false,
            offer_sent: false,
            remote_description_set: false,
            connected_notified: false,
            candidates: CandidateQueue::new(),
            deferred_offer: None,
        }
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn snapshot(&self) -> NegotiationSnapshot {
        NegotiationSnapshot {
            phase: self.phase,
            role: self.role,
            signaling_open: self.signaling_open,
            joined: self.role.is_some(),
            media_ready: self.media_ready,
            offer_sent: self.offer_sent,
            remote_description_set: self.remote_description_set,
            connected_notified: self.connected_notified,
            queued_candidates: self.candidates.len(),
        }
    }

    /// When the current phase gives up waiting, and which phase that was.
    pub fn deadline(&self, timeouts: &NegotiationTimeouts) -> Option<(Instant, Phase)> {
        let limit = match self.phase {
            Phase::Joining => timeouts.join_ack,
            Phase::AwaitingOffer => timeouts.offer,
            Phase::AwaitingAnswer => timeouts.answer,
            Phase::AwaitingConnected => timeouts.connect,
            _ => None,
        }?;
        Some((self.phase_entered + limit, self.phase))
    }

    pub fn on_signaling_open(&mut self, io: &NegotiationIo<'_>) {
        self.signaling_open = true;
        if self.advance(Phase::Joining) {
            self.send(io, Signal::Join);
        }
    }

    pub async fn on_media_ready(&mut self, io: &NegotiationIo<'_>) -> Disposition {
        self.media_ready = true;
        self.progress(io).await
    }

    pub async fn on_envelope(&mut self, envelope: Envelope, io: &NegotiationIo<'_>) -> Disposition {
        match self.scope.admit(&envelope) {
            Admit::Accept => {}
            Admit::ForeignSession => {
                debug!(session = %envelope.session_id, kind = %envelope.kind, "ignoring envelope for another session");
                return Disposition::Continue;
            }
            Admit::Loopback => {
                debug!(kind = %envelope.kind, "ignoring our own envelope");
                return Disposition::Continue;
            }
        }
        if self.phase.is_terminal() {
            debug!(kind = %envelope.kind, phase = %self.phase, "ignoring envelope after negotiation finished");
            return Disposition::Continue;
        }

        let signal = match envelope.signal() {
            Ok(signal) => signal,
            Err(err) => {
                warn!(kind = %envelope.kind, trace_id = %envelope.trace_id, error = %err, "dropping malformed envelope");
                return Disposition::Continue;
            }
        };

        match signal {
            Signal::JoinAck(ack) => self.on_join_ack(ack, io).await,
            Signal::Offer(offer) => self.on_offer(offer, io).await,
            Signal::Answer(answer) => self.on_answer(answer, io).await,
            Signal::IceCandidate(candidate) => {
                self.on_remote_candidate(candidate, io).await;
                Disposition::Continue
            }
            Signal::RtcConnected => {
                info!(from = ?envelope.from, "remote participant reports connected");
                Disposition::Continue
            }
            Signal::End => {
                info!(from = ?envelope.from, "remote participant ended the call");
                self.advance(Phase::Ended);
                Disposition::Ended
            }
            Signal::Error(err) => {
                warn!(message = %err.message, "relay reported an error");
                self.advance(Phase::Failed);
                Disposition::RelayError(err.message)
            }
            Signal::Join | Signal::Heartbeat => {
                debug!(kind = %envelope.kind, "ignoring relay-bound envelope");
                Disposition::Continue
            }
        }
    }

    pub fn on_local_candidate(&mut self, candidate: IceCandidate, io: &NegotiationIo<'_>) {
        if !self.signaling_open || self.phase.is_terminal() {
            debug!(candidate = %candidate.candidate, "dropping local candidate; signaling unavailable");
            return;
        }
        self.send(io, Signal::IceCandidate(candidate));
    }

    pub fn on_peer_state(&mut self, state: PeerState, io: &NegotiationIo<'_>) -> Disposition {
        match state {
            PeerState::Connected => {
                if self.advance(Phase::Connected) && !self.connected_notified {
                    self.connected_notified = true;
                    self.send(io, Signal::RtcConnected);
                }
                Disposition::Continue
            }
            PeerState::Failed if !self.phase.is_terminal() && self.phase != Phase::Connected => {
                self.fail("peer connection failed")
            }
            PeerState::Failed | PeerState::Disconnected => {
                warn!(?state, phase = %self.phase, "peer connection degraded");
                Disposition::Continue
            }
            PeerState::New | PeerState::Connecting | PeerState::Closed => {
                debug!(?state, "peer connection state");
                Disposition::Continue
            }
        }
    }

    pub fn on_transport_lost(&mut self, reason: impl Into<String>) -> Disposition {
        let reason = reason.into();
        self.signaling_open = false;
        if self.phase.is_terminal() || self.phase == Phase::Connected {
            info!(%reason, phase = %self.phase, "signaling connection lost");
            return Disposition::Continue;
        }
        warn!(%reason, phase = %self.phase, "signaling connection lost before the call connected");
        self.advance(Phase::Failed);
        Disposition::TransportLost(reason)
    }

    pub fn on_timeout(&mut self, waited_in: Phase) -> Disposition {
        if self.phase != waited_in {
            return Disposition::Continue;
        }
        self.fail(format!("timed out in {waited_in}"))
    }

    /// Local hangup: tells the other side when signaling still works.
    pub fn hang_up(&mut self, outbound: &dyn OutboundSink) {
        if self.signaling_open && !self.phase.is_terminal() {
            match self.scope.stamp(Signal::End) {
                Ok(envelope) => {
                    if let Err(err) = outbound.deliver(envelope) {
                        debug!(error = %err, "could not deliver END");
                    }
                }
                Err(err) => warn!(error = %err, "could not encode END"),
            }
        }
        self.advance(Phase::Ended);
    }

    /// The owner went away without hanging up. Nothing is sent.
    pub fn detach(&mut self) {
        self.advance(Phase::Ended);
    }

    async fn on_join_ack(&mut self, ack: JoinAck, io: &NegotiationIo<'_>) -> Disposition {
        if let Some(role) = self.role {
            debug!(%role, "ignoring duplicate join acknowledgment");
            return Disposition::Continue;
        }
        if self.phase != Phase::Joining {
            warn!(phase = %self.phase, "ignoring join acknowledgment outside of joining");
            return Disposition::Continue;
        }
        let role = Role::from_initiator(ack.initiator);
        self.role = Some(role);
        info!(%role, initiator = ack.initiator, "joined session");
        self.advance(Phase::Joined);
        if role == Role::Answerer {
            self.advance(Phase::AwaitingOffer);
        }
        self.progress(io).await
    }

    /// Re-evaluated whenever one of the offer prerequisites changes.
    async fn progress(&mut self, io: &NegotiationIo<'_>) -> Disposition {
        match (self.phase, self.role) {
            (Phase::Joined, Some(Role::Offerer)) if self.media_ready && self.signaling_open => {
                self.send_offer(io).await
            }
            (Phase::AwaitingOffer, Some(Role::Answerer)) if self.media_ready => {
                match self.deferred_offer.take() {
                    Some(offer) => {
                        debug!("answering offer deferred until local media was ready");
                        self.accept_offer(offer, io).await
                    }
                    None => Disposition::Continue,
                }
            }
            _ => Disposition::Continue,
        }
    }

    async fn send_offer(&mut self, io: &NegotiationIo<'_>) -> Disposition {
        if !self.advance(Phase::OfferPending) {
            return Disposition::Continue;
        }
        let offer = match io.peer.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return self.fail(format!("create offer failed: {err}")),
        };
        if let Err(err) = io.peer.set_local_description(offer.clone()).await {
            return self.fail(format!("applying local offer failed: {err}"));
        }
        self.send(io, Signal::Offer(offer));
        self.offer_sent = true;
        self.advance(Phase::OfferSent);
        self.advance(Phase::AwaitingAnswer);
        Disposition::Continue
    }

    async fn on_offer(&mut self, offer: SessionDescription, io: &NegotiationIo<'_>) -> Disposition {
        match self.role {
            Some(Role::Answerer) => {}
            Some(Role::Offerer) => {
                info!("ignoring offer: this participant is the offerer");
                return Disposition::Continue;
            }
            None => {
                warn!("ignoring offer received before joining");
                return Disposition::Continue;
            }
        }
        if self.phase != Phase::AwaitingOffer {
            debug!(phase = %self.phase, "ignoring offer outside of awaiting_offer");
            return Disposition::Continue;
        }
        let state = io.peer.signaling_state();
        if state != SignalingState::Stable {
            info!(?state, "ignoring offer: signaling state is not stable");
            return Disposition::Continue;
        }
        if offer.sdp_type != SdpType::Offer {
            warn!(sdp_type = ?offer.sdp_type, "ignoring OFFER carrying a non-offer description");
            return Disposition::Continue;
        }
        if !self.media_ready {
            if self.deferred_offer.is_none() {
                debug!("holding offer until local media is attached");
                self.deferred_offer = Some(offer);
            }
            return Disposition::Continue;
        }
        self.accept_offer(offer, io).await
    }

    async fn accept_offer(&mut self, offer: SessionDescription, io: &NegotiationIo<'_>) -> Disposition {
        if let Err(err) = io.peer.set_remote_description(offer).await {
            warn!(error = %err, "dropping offer whose description could not be applied");
            return Disposition::Continue;
        }
        self.remote_description_set = true;
        self.flush_candidates(io).await;

        let answer = match io.peer.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return self.fail(format!("create answer failed: {err}")),
        };
        if let Err(err) = io.peer.set_local_description(answer.clone()).await {
            return self.fail(format!("applying local answer failed: {err}"));
        }
        self.send(io, Signal::Answer(answer));
        self.advance(Phase::AnswerSent);
        self.advance(Phase::AwaitingConnected);
        Disposition::Continue
    }

    async fn on_answer(&mut self, answer: SessionDescription, io: &NegotiationIo<'_>) -> Disposition {
        if self.role != Some(Role::Offerer) {
            info!(role = ?self.role, "ignoring answer: this participant did not offer");
            return Disposition::Continue;
        }
        let state = io.peer.signaling_state();
        if self.phase != Phase::AwaitingAnswer || state != SignalingState::HaveLocalOffer {
            debug!(phase = %self.phase, ?state, "ignoring stale answer");
            return Disposition::Continue;
        }
        if answer.sdp_type != SdpType::Answer {
            warn!(sdp_type = ?answer.sdp_type, "ignoring ANSWER carrying a non-answer description");
            return Disposition::Continue;
        }
        if let Err(err) = io.peer.set_remote_description(answer).await {
            warn!(error = %err, "dropping answer whose description could not be applied");
            return Disposition::Continue;
        }
        self.remote_description_set = true;
        self.flush_candidates(io).await;
        self.advance(Phase::AwaitingConnected);
        Disposition::Continue
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate, io: &NegotiationIo<'_>) {
        if !self.remote_description_set {
            self.candidates.enqueue(candidate);
            return;
        }
        if let Err(err) = io.peer.add_ice_candidate(candidate).await {
            warn!(error = %err, "dropping remote candidate that failed to apply");
        }
    }

    async fn flush_candidates(&mut self, io: &NegotiationIo<'_>) -> FlushReport {
        let peer = io.peer;
        self.candidates
            .flush(|candidate| peer.add_ice_candidate(candidate))
            .await
    }

    fn send(&self, io: &NegotiationIo<'_>, signal: Signal) {
        let kind = signal.kind();
        let envelope = match self.scope.stamp(signal) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%kind, error = %err, "could not encode envelope");
                return;
            }
        };
        let trace_id = envelope.trace_id.clone();
        match io.outbound.deliver(envelope) {
            Ok(()) => debug!(%kind, %trace_id, "sent"),
            Err(err) => warn!(%kind, error = %err, "could not send envelope"),
        }
    }

    /// Fails the negotiation unless the call already connected or finished.
    pub fn fail(&mut self, reason: impl Into<String>) -> Disposition {
        let reason = reason.into();
        if !self.advance(Phase::Failed) {
            warn!(%reason, phase = %self.phase, "failure after the call settled");
            return Disposition::Continue;
        }
        Disposition::Failed(reason)
    }

    fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_advance_to(next) {
            debug!(from = %self.phase, to = %next, "phase transition refused");
            return false;
        }
        info!(from = %self.phase, to = %next, role = ?self.role, "negotiation phase");
        self.phase = next;
        self.phase_entered = Instant::now();
        true
    }
}
