use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, StreamExt};
use tandem_proto::{new_trace_id, Envelope, EnvelopeType, JoinAck, RelayError, Signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::rooms::{JoinError, Outbound, Rooms};

const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Shared state for every signaling socket.
#[derive(Clone)]
pub struct RelayState {
    pub rooms: Arc<Rooms>,
    pub config: Arc<Config>,
}

impl RelayState {
    pub fn new(config: Config) -> Self {
        Self {
            rooms: Arc::new(Rooms::new()),
            config: Arc::new(config),
        }
    }

    /// Evicts silent participants every few seconds until the task is aborted.
    pub fn spawn_stale_monitor(&self) -> tokio::task::JoinHandle<()> {
        let rooms = Arc::clone(&self.rooms);
        let timeout = self.config.heartbeat_timeout;
        let period = (timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                for (session_id, participant) in rooms.evict_stale(timeout, Instant::now()) {
                    info!(session = %session_id, %participant, "evicted participant after heartbeat timeout");
                }
            }
        })
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    State(state): State<RelayState>,
) -> Response {
    if let Some(required) = &state.config.required_token {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(required.as_str()) {
            warn!(session = %session_id, "rejecting signaling upgrade without a valid bearer token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: RelayState) {
    let connection = uuid::Uuid::new_v4().to_string();
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(write_outbound(sender, rx, connection.clone()));

    debug!(session = %session_id, %connection, "signaling socket connected");
    let mut joined: Option<String> = None;

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(%connection, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(%connection, error = %err, "signaling socket error");
                break;
            }
        };

        match Envelope::from_json(&text) {
            Ok(envelope) => {
                handle_envelope(&state, &session_id, &connection, &tx, &mut joined, envelope)
            }
            Err(err) => {
                warn!(%connection, error = %err, "undecodable signaling frame");
                reply_error(&tx, &session_id, "", None, format!("invalid envelope: {err}"));
            }
        }
    }

    if let Some(participant) = state.rooms.leave(&session_id, &connection) {
        info!(session = %session_id, %participant, "participant left");
    }
    finish_writer(tx, writer, &connection).await;
    debug!(session = %session_id, %connection, "signaling socket disconnected");
}

/// Drains `rx` into `sender` until every sender handle is gone or a close
/// is requested. Hands the sink back when done.
async fn write_outbound<S>(
    mut sender: S,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    connection: String,
) -> S
where
    S: Sink<Message> + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Envelope(envelope) => {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(kind = %envelope.kind, error = %err, "dropping envelope that failed to encode");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close(reason) => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: axum::extract::ws::close_code::NORMAL,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    debug!(%connection, "signaling writer finished");
    sender
}

/// Lets the writer flush what is already queued, such as an ERROR for the
/// last frame, then gives up after `WRITER_GRACE`.
async fn finish_writer<T>(
    tx: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<T>,
    connection: &str,
) -> Option<T> {
    drop(tx);
    let abort = writer.abort_handle();
    match tokio::time::timeout(WRITER_GRACE, writer).await {
        Ok(joined) => joined.ok(),
        Err(_) => {
            debug!(%connection, "signaling writer did not drain in time; aborting");
            abort.abort();
            None
        }
    }
}

/// Applies one inbound envelope from `connection`.
pub(crate) fn handle_envelope(
    state: &RelayState,
    session_id: &str,
    connection: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    joined: &mut Option<String>,
    envelope: Envelope,
) {
    let reservation_id = envelope.reservation_id.clone();
    if envelope.session_id != session_id {
        reply_error(
            tx,
            session_id,
            &reservation_id,
            envelope.from.clone(),
            "session mismatch".into(),
        );
        return;
    }

    match envelope.kind {
        EnvelopeType::Join => {
            let Some(participant) = envelope.from.clone().filter(|p| !p.is_empty()) else {
                reply_error(tx, session_id, &reservation_id, None, "JOIN requires a sender".into());
                return;
            };
            match state
                .rooms
                .join(session_id, &participant, connection, tx.clone(), Instant::now())
            {
                Ok(initiator) => {
                    info!(session = %session_id, %participant, initiator, "participant joined");
                    *joined = Some(participant.clone());
                    send(
                        tx,
                        session_id,
                        &reservation_id,
                        Some(participant),
                        Signal::JoinAck(JoinAck { initiator }),
                    );
                }
                Err(err @ JoinError::Full) => {
                    warn!(session = %session_id, %participant, "refusing join to a full session");
                    reply_error(tx, session_id, &reservation_id, Some(participant), err.to_string());
                }
            }
        }
        _ if joined.is_none() => {
            reply_error(
                tx,
                session_id,
                &reservation_id,
                envelope.from.clone(),
                format!("{} sent before JOIN", envelope.kind),
            );
        }
        EnvelopeType::Heartbeat => {
            state.rooms.touch(session_id, connection, Instant::now());
        }
        EnvelopeType::Offer
        | EnvelopeType::Answer
        | EnvelopeType::IceCandidate
        | EnvelopeType::RtcConnected
        | EnvelopeType::End => {
            state.rooms.touch(session_id, connection, Instant::now());
            match state.rooms.peer_of(session_id, connection) {
                Some(peer) => {
                    debug!(kind = %envelope.kind, trace_id = %envelope.trace_id, to = %peer.participant, "forwarding");
                    let mut forwarded = envelope;
                    forwarded.to = Some(peer.participant);
                    let _ = peer.tx.send(Outbound::Envelope(forwarded));
                }
                None => {
                    debug!(kind = %envelope.kind, "no other participant to forward to");
                }
            }
        }
        EnvelopeType::JoinAck | EnvelopeType::Error => {
            reply_error(
                tx,
                session_id,
                &reservation_id,
                envelope.from.clone(),
                format!("{} is relay-only", envelope.kind),
            );
        }
    }
}

fn send(
    tx: &mpsc::UnboundedSender<Outbound>,
    session_id: &str,
    reservation_id: &str,
    to: Option<String>,
    signal: Signal,
) {
    let (kind, payload) = match signal.into_parts() {
        Ok(parts) => parts,
        Err(err) => {
            warn!(error = %err, "could not encode relay envelope");
            return;
        }
    };
    let _ = tx.send(Outbound::Envelope(Envelope {
        kind,
        session_id: session_id.to_string(),
        reservation_id: reservation_id.to_string(),
        from: None,
        to,
        payload,
        ts: chrono::Utc::now().timestamp_millis(),
        trace_id: new_trace_id(),
    }));
}

fn reply_error(
    tx: &mpsc::UnboundedSender<Outbound>,
    session_id: &str,
    reservation_id: &str,
    to: Option<String>,
    message: String,
) {
    send(
        tx,
        session_id,
        reservation_id,
        to,
        Signal::Error(RelayError { message }),
    );
}
