use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_proto::{Envelope, IceCandidate, SdpType, SessionDescription};

use crate::media::{EncodingCap, LocalTrack};
use crate::peer::{PeerConnection, PeerError, SenderId, SignalingState};
use crate::transport::{OutboundSink, TransportError};

/// Peer connection double that follows the offer/answer signaling states and
/// records everything it is asked to do.
#[derive(Default)]
pub(crate) struct RecordingPeer {
    state: Mutex<Option<SignalingState>>,
    pub calls: Mutex<Vec<String>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub senders: Mutex<HashMap<SenderId, String>>,
    pub caps: Mutex<Vec<(SenderId, EncodingCap)>>,
    next_sender: AtomicU32,
    pub reject_remote: AtomicBool,
    pub reject_candidate: Mutex<Option<String>>,
    pub closes: AtomicUsize,
}

impl RecordingPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn force_state(&self, state: SignalingState) {
        *self.state.lock() = Some(state);
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn track_on(&self, sender: SenderId) -> Option<String> {
        self.senders.lock().get(&sender).cloned()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl PeerConnection for RecordingPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_offer");
        Ok(SessionDescription::offer("v=0 recording-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_answer");
        Ok(SessionDescription::answer("v=0 recording-answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record("set_local");
        let next = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        *self.state.lock() = Some(next);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record("set_remote");
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(PeerError::Unsupported("remote description rejected"));
        }
        let next = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        *self.state.lock() = Some(next);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.reject_candidate.lock().as_deref() == Some(candidate.candidate.as_str()) {
            return Err(PeerError::Unsupported("candidate rejected"));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap_or(SignalingState::Stable)
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, PeerError> {
        self.record("add_track");
        let sender = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders.lock().insert(sender, track.id().to_string());
        Ok(sender)
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        self.record("replace_track");
        let mut senders = self.senders.lock();
        let slot = senders.get_mut(&sender).ok_or(PeerError::UnknownSender(sender))?;
        *slot = track.id().to_string();
        Ok(())
    }

    async fn set_encoding_cap(&self, sender: SenderId, cap: EncodingCap) -> Result<(), PeerError> {
        self.caps.lock().push((sender, cap));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = Some(SignalingState::Closed);
        Ok(())
    }
}

/// Outbound sink that keeps every envelope it is handed.
#[derive(Default)]
pub(crate) struct CapturedOutbound {
    pub sent: Mutex<Vec<Envelope>>,
}

impl CapturedOutbound {
    pub fn kinds(&self) -> Vec<tandem_proto::EnvelopeType> {
        self.sent.lock().iter().map(|e| e.kind).collect()
    }
}

impl OutboundSink for CapturedOutbound {
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.sent.lock().push(envelope);
        Ok(())
    }
}
