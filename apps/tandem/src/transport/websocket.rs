use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tandem_proto::Envelope;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use super::{
    LinkState, SignalingConnector, SignalingLink, SignalingTarget, TransportError, TransportEvent,
};
use crate::sink::EventSink;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling over a websocket to the relay. The bearer token travels in the
/// `Authorization` header; the routing token is part of the URL.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(
        &self,
        target: &SignalingTarget,
        events: EventSink<TransportEvent>,
    ) -> Result<SignalingLink, TransportError> {
        let url = target.endpoint()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(TransportError::Connect)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", target.bearer_token))
            .map_err(|_| TransportError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(session = %target.session_id, relay = %target.relay_url, "opening signaling websocket");
        let (socket, _response) = connect_async(request)
            .await
            .map_err(TransportError::Connect)?;
        info!(session = %target.session_id, "signaling websocket open");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Open);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(pump(socket, outbound_rx, close_rx, state_tx, events));
        Ok(SignalingLink::new(outbound_tx, state_rx, close_tx, task))
    }
}

async fn pump(
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    mut close: oneshot::Receiver<()>,
    state: watch::Sender<LinkState>,
    events: EventSink<TransportEvent>,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = &mut close => {
                // Envelopes queued before the close request (END on hangup) go out first.
                while let Ok(envelope) = outbound.try_recv() {
                    if let Err(err) = send_envelope(&mut sink, &envelope).await {
                        debug!(error = %err, "signaling flush interrupted");
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                state.send_replace(LinkState::Closed);
                debug!("signaling websocket closed locally");
                break;
            }
            Some(envelope) = outbound.recv() => {
                if let Err(err) = send_envelope(&mut sink, &envelope).await {
                    state.send_replace(LinkState::Error);
                    events.emit(TransportEvent::Failed(err.to_string()));
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => forward(&text, &events),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => forward(text, &events),
                    Err(_) => warn!(len = bytes.len(), "ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    state.send_replace(LinkState::Closed);
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    info!(reason = ?reason, "relay closed signaling websocket");
                    events.emit(TransportEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    state.send_replace(LinkState::Error);
                    warn!(error = %err, "signaling websocket error");
                    events.emit(TransportEvent::Failed(err.to_string()));
                    break;
                }
                None => {
                    state.send_replace(LinkState::Closed);
                    events.emit(TransportEvent::Closed { reason: None });
                    break;
                }
            },
        }
    }
}

/// Encoding failures drop the envelope and are not reported as errors.
async fn send_envelope(
    sink: &mut SplitSink<Socket, Message>,
    envelope: &Envelope,
) -> Result<(), tungstenite::Error> {
    let text = match envelope.to_json() {
        Ok(text) => text,
        Err(err) => {
            warn!(kind = %envelope.kind, error = %err, "dropping envelope that failed to encode");
            return Ok(());
        }
    };
    trace!(kind = %envelope.kind, trace_id = %envelope.trace_id, "signaling send");
    sink.send(Message::Text(text)).await
}

fn forward(text: &str, events: &EventSink<TransportEvent>) {
    match Envelope::from_json(text) {
        Ok(envelope) => {
            trace!(kind = %envelope.kind, trace_id = %envelope.trace_id, "signaling recv");
            events.emit(TransportEvent::Message(envelope));
        }
        Err(err) => warn!(error = %err, "skipping undecodable signaling frame"),
    }
}
