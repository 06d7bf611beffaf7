use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tandem_proto::Envelope;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::sink::EventSink;

pub mod ice;
pub mod websocket;

pub use ice::{HttpIceServerProvider, IceProvisionError, IceServerProvider, StaticIceServers};
pub use websocket::WebSocketConnector;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
    Error,
}

/// Something the signaling connection reports after it has been opened.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Envelope),
    Closed { reason: Option<String> },
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("relay url must use ws or wss, got {0}")]
    UnsupportedScheme(String),
    #[error("invalid bearer token")]
    InvalidToken,
    #[error("websocket connect failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("signaling connection is not open")]
    NotOpen,
    #[error("encode failed: {0}")]
    Encode(#[from] tandem_proto::ProtoError),
}

/// Where and as whom to open the signaling connection.
#[derive(Debug, Clone)]
pub struct SignalingTarget {
    pub relay_url: Url,
    pub session_id: String,
    pub routing_token: Option<String>,
    pub bearer_token: String,
}

impl SignalingTarget {
    /// `{relay}/ws/{session_id}?token={routing_token}`
    pub fn endpoint(&self) -> Result<Url, TransportError> {
        match self.relay_url.scheme() {
            "ws" | "wss" => {}
            other => return Err(TransportError::UnsupportedScheme(other.to_string())),
        }
        let mut url = self.relay_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::UnsupportedScheme(self.relay_url.to_string()))?
            .pop_if_empty()
            .push("ws")
            .push(&self.session_id);
        if let Some(token) = &self.routing_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

/// Opens signaling connections. `connect` resolves once the connection is
/// open; everything after that arrives through `events`.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        target: &SignalingTarget,
        events: EventSink<TransportEvent>,
    ) -> Result<SignalingLink, TransportError>;
}

/// Accepts stamped envelopes for delivery to the relay.
pub trait OutboundSink: Send + Sync {
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Sink used while no signaling connection exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl OutboundSink for Detached {
    fn deliver(&self, _envelope: Envelope) -> Result<(), TransportError> {
        Err(TransportError::NotOpen)
    }
}

/// Handle to an open signaling connection and the task pumping it.
#[derive(Debug)]
pub struct SignalingLink {
    outbound: mpsc::UnboundedSender<Envelope>,
    state: watch::Receiver<LinkState>,
    close: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SignalingLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<Envelope>,
        state: watch::Receiver<LinkState>,
        close: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            outbound,
            state,
            close: Some(close),
            task: Some(task),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open && self.close.is_some()
    }

    /// Closes the connection and waits briefly for the pump to finish.
    /// Only the first call does anything.
    pub async fn close(&mut self) {
        let Some(close) = self.close.take() else {
            return;
        };
        let _ = close.send(());
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                debug!("signaling pump did not stop in time; aborting");
                abort.abort();
            }
        }
    }
}

impl OutboundSink for SignalingLink {
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send(envelope)
            .map_err(|_| TransportError::NotOpen)
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
