//! One call, start to finish.
//!
//! A session is a single task that owns the negotiator, the media pipeline,
//! the peer connection and the signaling link. Everything that happens to it
//! (relay messages, connection callbacks, finished device requests, user
//! commands) arrives as a [`SessionEvent`] on one channel and is handled in
//! order.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::media::{
    EncodingCap, LocalStream, MediaConstraints, MediaDevices, MediaError, Preview,
};
use crate::negotiation::{
    NegotiationSnapshot, NegotiationTimeouts, Negotiator, Phase, SessionScope,
};
use crate::peer::{PeerEvent, PeerFactory, PeerState, WebRtcPeerFactory};
use crate::transport::{
    IceProvisionError, IceServerProvider, LinkState, SignalingConnector, SignalingLink,
    TransportError, TransportEvent, WebSocketConnector,
};
use tandem_proto::IceServer;

mod actor;
mod teardown;

pub use teardown::{Teardown, TeardownReport};

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    /// Credential presented to the relay as `Authorization: Bearer`.
    pub bearer_token: String,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: String,
    pub reservation_id: String,
    /// Routing token the relay expects in the websocket URL.
    pub routing_token: Option<String>,
    pub participant: Participant,
}

/// The outside world a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub ice_servers: Arc<dyn IceServerProvider>,
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingConnector>,
}

impl SessionDeps {
    /// webrtc-rs peer connections and websocket signaling.
    pub fn networked(
        ice_servers: Arc<dyn IceServerProvider>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            ice_servers,
            peers: Arc::new(WebRtcPeerFactory),
            devices,
            signaling: Arc::new(WebSocketConnector),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: Url,
    pub heartbeat_interval: Duration,
    pub timeouts: NegotiationTimeouts,
    pub constraints: MediaConstraints,
    pub encoding_cap: EncodingCap,
}

impl SessionConfig {
    pub fn new(relay_url: Url) -> Self {
        Self {
            relay_url,
            heartbeat_interval: Duration::from_secs(10),
            timeouts: NegotiationTimeouts::default(),
            constraints: MediaConstraints::default(),
            encoding_cap: EncodingCap::default(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        let relay_url = Url::parse(&config.relay_url).map_err(SessionError::RelayUrl)?;
        Ok(Self {
            heartbeat_interval: config.heartbeat_interval,
            timeouts: config.timeouts,
            ..Self::new(relay_url)
        })
    }
}

/// What the UI can observe about a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub negotiation: NegotiationSnapshot,
    pub link: Option<LinkState>,
    pub peer: Option<PeerState>,
    pub preview: Preview,
    pub screen_sharing: bool,
    pub remote_tracks: usize,
    pub error: Option<String>,
    pub finished: bool,
}

impl SessionStatus {
    fn initial(negotiation: NegotiationSnapshot) -> Self {
        Self {
            negotiation,
            link: None,
            peer: None,
            preview: Preview::None,
            screen_sharing: false,
            remote_tracks: 0,
            error: None,
            finished: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    /// The handle was dropped without hanging up.
    Detached,
    RemoteEnded,
    RelayError(String),
    TransportLost(String),
    Failed(String),
    StartupFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub phase: Phase,
    pub reason: EndReason,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing {0}")]
    MissingParam(&'static str),
    #[error("invalid relay url: {0}")]
    RelayUrl(#[source] url::ParseError),
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Hangup,
    Detach,
    StartScreenShare,
    StopScreenShare,
    SetMicrophone(bool),
    SetCamera(bool),
}

pub(crate) enum SessionEvent {
    IceServers(Result<Vec<IceServer>, IceProvisionError>),
    MediaAcquired(Result<LocalStream, MediaError>),
    SignalingReady(Result<SignalingLink, TransportError>),
    Transport(TransportEvent),
    Peer(PeerEvent),
    ScreenCaptured(Result<LocalStream, MediaError>),
    ScreenCaptureEnded { track_id: String },
    Command(SessionCommand),
}

impl SessionEvent {
    /// Releases whatever the event carries when nobody is left to handle it.
    fn release(self) {
        match self {
            SessionEvent::MediaAcquired(Ok(stream)) | SessionEvent::ScreenCaptured(Ok(stream)) => {
                let stopped = stream.stop_all();
                debug!(stopped, "stopped media that arrived after teardown");
            }
            SessionEvent::SignalingReady(Ok(link)) => drop(link),
            _ => {}
        }
    }
}

impl From<PeerEvent> for SessionEvent {
    fn from(event: PeerEvent) -> Self {
        SessionEvent::Peer(event)
    }
}

impl From<TransportEvent> for SessionEvent {
    fn from(event: TransportEvent) -> Self {
        SessionEvent::Transport(event)
    }
}

/// Sends `event`, releasing it if the session has already shut down.
fn post(tx: &mpsc::UnboundedSender<SessionEvent>, event: SessionEvent) {
    if let Err(mpsc::error::SendError(event)) = tx.send(event) {
        event.release();
    }
}

pub struct CallSession;

impl CallSession {
    /// Validates the call identity and spawns the session task.
    pub fn start(
        params: SessionParams,
        deps: SessionDeps,
        config: SessionConfig,
    ) -> Result<(SessionHandle, JoinHandle<SessionOutcome>), SessionError> {
        if params.session_id.trim().is_empty() {
            return Err(SessionError::MissingParam("session id"));
        }
        if params.reservation_id.trim().is_empty() {
            return Err(SessionError::MissingParam("reservation id"));
        }
        if params.participant.id.trim().is_empty() {
            return Err(SessionError::MissingParam("participant id"));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(SessionError::ZeroHeartbeat);
        }

        let scope = SessionScope::new(
            params.session_id.clone(),
            params.reservation_id.clone(),
            params.participant.id.clone(),
        );
        let negotiator = Negotiator::new(scope);
        let (status_tx, status_rx) = watch::channel(SessionStatus::initial(negotiator.snapshot()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = actor::SessionActor::new(
            params,
            deps,
            config,
            negotiator,
            events_tx.clone(),
            events_rx,
            status_tx,
        );
        let task = tokio::spawn(actor.run());
        let handle = SessionHandle {
            events: events_tx,
            status: status_rx,
        };
        Ok((handle, task))
    }
}

/// Control surface for a running session. Dropping it ends the session
/// without notifying the other participant.
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn hang_up(&self) -> bool {
        self.command(SessionCommand::Hangup)
    }

    pub fn start_screen_share(&self) -> bool {
        self.command(SessionCommand::StartScreenShare)
    }

    pub fn stop_screen_share(&self) -> bool {
        self.command(SessionCommand::StopScreenShare)
    }

    pub fn set_microphone_enabled(&self, enabled: bool) -> bool {
        self.command(SessionCommand::SetMicrophone(enabled))
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> bool {
        self.command(SessionCommand::SetCamera(enabled))
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    fn command(&self, command: SessionCommand) -> bool {
        self.events.send(SessionEvent::Command(command)).is_ok()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.events.send(SessionEvent::Command(SessionCommand::Detach));
    }
}
