use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tandem_proto::{IceCandidate, IceServer, SessionDescription};

use crate::media::{EncodingCap, LocalTrack, TrackKind};
use crate::sink::EventSink;

pub mod rtc;

pub use self::rtc::{WebRtcPeer, WebRtcPeerFactory};

/// Signaling sub-state of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
    Unknown,
}

/// Aggregate connection state reported by the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(PeerState),
    RemoteTrack(RemoteTrack),
}

/// The slice of a peer connection the call engine drives.
///
/// The connection holds tracks but does not own them: stopping a
/// [`LocalTrack`] is the media pipeline's job.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    fn signaling_state(&self) -> SignalingState;

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, PeerError>;

    /// Swaps the source feeding an already negotiated sender.
    async fn replace_track(&self, sender: SenderId, track: Arc<LocalTrack>)
    -> Result<(), PeerError>;

    async fn set_encoding_cap(&self, sender: SenderId, cap: EncodingCap) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: EventSink<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("unknown sender {0}")]
    UnknownSender(SenderId),
    #[error("{sender} carries {expected:?} but was given a {actual:?} track")]
    KindMismatch {
        sender: SenderId,
        expected: TrackKind,
        actual: TrackKind,
    },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}
