#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_call_core::media::{
    EncodingCap, LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaError, TrackKind,
    TrackSource,
};
use tandem_call_core::peer::{
    PeerConnection, PeerError, PeerEvent, PeerFactory, PeerState, RemoteTrack, SenderId,
    SignalingState,
};
use tandem_call_core::sink::EventSink;
use tandem_call_core::transport::{
    IceProvisionError, IceServerProvider, LinkState, SignalingConnector, SignalingLink,
    SignalingTarget, StaticIceServers, TransportError, TransportEvent,
};
use tandem_call_core::{
    CallSession, Participant, SessionConfig, SessionDeps, SessionHandle, SessionOutcome,
    SessionParams, SessionStatus,
};
use tandem_proto::{
    Envelope, EnvelopeType, IceCandidate, IceServer, JoinAck, SdpType, SessionDescription, Signal,
};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use url::Url;

pub const SESSION: &str = "session-1";
pub const RESERVATION: &str = "reservation-1";

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Ordered record of what the fakes were asked to do.
#[derive(Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

pub struct JournaledIce {
    journal: Arc<Journal>,
    fail: bool,
}

#[async_trait]
impl IceServerProvider for JournaledIce {
    async fn fetch(&self) -> Result<Vec<IceServer>, IceProvisionError> {
        self.journal.push("ice");
        if self.fail {
            return Err(IceProvisionError::Status {
                status: 503,
                body: "ice service unavailable".into(),
            });
        }
        StaticIceServers::stun(["stun:stun.test:3478"]).fetch().await
    }
}

/// Peer connection that follows the offer/answer states and reports itself
/// connected once both descriptions are applied. The connection blips
/// (connected, disconnected, connected) the way a real one may.
pub struct FakePeer {
    label: String,
    journal: Arc<Journal>,
    events: EventSink<PeerEvent>,
    state: Mutex<SignalingState>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
    senders: Mutex<HashMap<SenderId, Arc<LocalTrack>>>,
    next_sender: AtomicU32,
    pub remote_candidates: Mutex<Vec<IceCandidate>>,
    pub closes: AtomicUsize,
}

impl FakePeer {
    pub fn track_on(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        let senders = self.senders.lock();
        let mut ids: Vec<_> = senders.keys().copied().collect();
        ids.sort_by_key(|id| id.0);
        ids.into_iter()
            .filter_map(|id| senders.get(&id))
            .find(|track| track.kind() == kind)
            .cloned()
    }

    pub fn sender_count(&self) -> usize {
        self.senders.lock().len()
    }

    fn maybe_connect(&self) {
        let stable = *self.state.lock() == SignalingState::Stable;
        if !stable || !self.has_local.load(Ordering::SeqCst) || !self.has_remote.load(Ordering::SeqCst)
        {
            return;
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        for state in [
            PeerState::Connecting,
            PeerState::Connected,
            PeerState::Disconnected,
            PeerState::Connected,
        ] {
            self.events.emit(PeerEvent::ConnectionState(state));
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        *self.state.lock() = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        self.has_local.store(true, Ordering::SeqCst);
        self.events.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host {}", self.label),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        *self.state.lock() = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        self.has_remote.store(true, Ordering::SeqCst);
        for kind in [TrackKind::Audio, TrackKind::Video] {
            self.events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-{kind}"),
                stream_id: "remote-stream".into(),
                kind,
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, PeerError> {
        let sender = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders.lock().insert(sender, track);
        Ok(sender)
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let mut senders = self.senders.lock();
        let slot = senders
            .get_mut(&sender)
            .ok_or(PeerError::UnknownSender(sender))?;
        *slot = track;
        Ok(())
    }

    async fn set_encoding_cap(&self, _sender: SenderId, _cap: EncodingCap) -> Result<(), PeerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.journal.push("peer-close");
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = SignalingState::Closed;
        Ok(())
    }
}

pub struct FakePeerFactory {
    label: String,
    journal: Arc<Journal>,
    pub created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn peer(&self) -> Arc<FakePeer> {
        self.created
            .lock()
            .first()
            .cloned()
            .expect("no peer connection was created")
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: EventSink<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.journal.push("peer");
        let peer = Arc::new(FakePeer {
            label: self.label.clone(),
            journal: Arc::clone(&self.journal),
            events,
            state: Mutex::new(SignalingState::Stable),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU32::new(0),
            remote_candidates: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Capture devices that remember every track they hand out and journal
/// `track-stop` when one stops. `gate` holds `user_media` until notified.
pub struct FakeDevices {
    journal: Arc<Journal>,
    fail: bool,
    gate: Option<Arc<Notify>>,
    pub issued: Mutex<Vec<Arc<LocalTrack>>>,
}

impl FakeDevices {
    pub fn tracks(&self, source: TrackSource) -> Vec<Arc<LocalTrack>> {
        self.issued
            .lock()
            .iter()
            .filter(|t| t.source() == source)
            .cloned()
            .collect()
    }

    pub fn all_stopped(&self) -> bool {
        self.issued.lock().iter().all(|t| t.is_stopped())
    }

    fn issue(&self, tracks: Vec<Arc<LocalTrack>>) -> LocalStream {
        for track in &tracks {
            let track = Arc::clone(track);
            let journal = Arc::clone(&self.journal);
            tokio::spawn(async move {
                track.ended().await;
                journal.push("track-stop");
            });
        }
        self.issued.lock().extend(tracks.iter().cloned());
        LocalStream::new(tracks)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(&self, _constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        self.journal.push("media");
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(MediaError::PermissionDenied("camera blocked".into()));
        }
        let tracks = vec![
            LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "fake microphone"),
            LocalTrack::new(TrackKind::Video, TrackSource::Camera, "fake camera"),
        ];
        Ok(self.issue(tracks))
    }

    async fn display_media(&self) -> Result<LocalStream, MediaError> {
        let screen = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "fake display");
        Ok(self.issue(vec![screen]))
    }
}


struct Member {
    participant: String,
    connection: u64,
}

struct Connection {
    session_id: String,
    bearer_token: String,
    events: EventSink<TransportEvent>,
}

#[derive(Default)]
struct RelayState {
    next_connection: u64,
    connections: HashMap<u64, Connection>,
    rooms: HashMap<String, Vec<Member>>,
    log: Vec<Envelope>,
}

/// In-process stand-in for the signaling relay: the first joiner is flagged
/// `initiator` and everything else is forwarded to the other member.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    connects: Arc<AtomicU64>,
}

impl MemoryRelay {
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn bearer_tokens(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut tokens: Vec<_> = state
            .connections
            .values()
            .map(|c| c.bearer_token.clone())
            .collect();
        tokens.sort();
        tokens
    }

    /// Kinds sent by `participant`, in order.
    pub fn sent_by(&self, participant: &str) -> Vec<EnvelopeType> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|e| e.from.as_deref() == Some(participant))
            .map(|e| e.kind)
            .collect()
    }

    pub fn count(&self, participant: &str, kind: EnvelopeType) -> usize {
        self.sent_by(participant)
            .into_iter()
            .filter(|k| *k == kind)
            .count()
    }

    /// Closes `participant`'s connection from the relay side.
    pub fn drop_participant(&self, participant: &str, reason: &str) {
        let mut state = self.state.lock();
        let connection = state
            .rooms
            .values()
            .flatten()
            .find(|m| m.participant == participant)
            .map(|m| m.connection);
        let Some(connection) = connection else {
            return;
        };
        for room in state.rooms.values_mut() {
            room.retain(|m| m.connection != connection);
        }
        if let Some(conn) = state.connections.get(&connection) {
            conn.events.emit(TransportEvent::Closed {
                reason: Some(reason.to_string()),
            });
        }
    }

    fn open(&self, target: &SignalingTarget, events: EventSink<TransportEvent>) -> u64 {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            Connection {
                session_id: target.session_id.clone(),
                bearer_token: target.bearer_token.clone(),
                events,
            },
        );
        id
    }

    fn disconnect(&self, connection: u64) {
        let mut state = self.state.lock();
        for room in state.rooms.values_mut() {
            room.retain(|m| m.connection != connection);
        }
    }

    fn route(&self, connection: u64, envelope: Envelope) {
        let mut state = self.state.lock();
        state.log.push(envelope.clone());
        let Some(session_id) = state
            .connections
            .get(&connection)
            .map(|c| c.session_id.clone())
        else {
            return;
        };

        match envelope.kind {
            EnvelopeType::Join => {
                let participant = envelope.from.clone().unwrap_or_default();
                let room = state.rooms.entry(session_id).or_default();
                let initiator = room.is_empty();
                if !room.iter().any(|m| m.participant == participant) {
                    room.push(Member {
                        participant: participant.clone(),
                        connection,
                    });
                }
                let ack = relay_envelope(
                    &envelope,
                    Some(participant),
                    Signal::JoinAck(JoinAck { initiator }),
                );
                if let Some(conn) = state.connections.get(&connection) {
                    conn.events.emit(TransportEvent::Message(ack));
                }
            }
            EnvelopeType::Heartbeat => {}
            _ => {
                let target = state.rooms.get(&session_id).and_then(|room| {
                    room.iter()
                        .find(|m| m.connection != connection)
                        .map(|m| m.connection)
                });
                if let Some(conn) = target.and_then(|id| state.connections.get(&id)) {
                    conn.events.emit(TransportEvent::Message(envelope));
                }
            }
        }
    }
}

fn relay_envelope(request: &Envelope, to: Option<String>, signal: Signal) -> Envelope {
    let (kind, payload) = signal.into_parts().expect("relay signal encodes");
    Envelope {
        kind,
        session_id: request.session_id.clone(),
        reservation_id: request.reservation_id.clone(),
        from: None,
        to,
        payload,
        ts: request.ts,
        trace_id: tandem_proto::new_trace_id(),
    }
}

/// One participant's view of the relay. Journals `signaling` on connect and
/// `link-close` when the link is closed locally.
pub struct RelayConnector {
    relay: MemoryRelay,
    journal: Arc<Journal>,
}

#[async_trait]
impl SignalingConnector for RelayConnector {
    async fn connect(
        &self,
        target: &SignalingTarget,
        events: EventSink<TransportEvent>,
    ) -> Result<SignalingLink, TransportError> {
        self.journal.push("signaling");
        target.endpoint()?;
        let relay = self.relay.clone();
        let journal = Arc::clone(&self.journal);
        let connection = relay.open(target, events);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (state_tx, state_rx) = watch::channel(LinkState::Open);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        while let Ok(envelope) = outbound_rx.try_recv() {
                            relay.route(connection, envelope);
                        }
                        journal.push("link-close");
                        state_tx.send_replace(LinkState::Closed);
                        relay.disconnect(connection);
                        break;
                    }
                    envelope = outbound_rx.recv() => match envelope {
                        Some(envelope) => relay.route(connection, envelope),
                        None => break,
                    },
                }
            }
        });
        Ok(SignalingLink::new(outbound_tx, state_rx, close_tx, task))
    }
}

#[derive(Default)]
pub struct Options {
    pub fail_ice: bool,
    pub fail_media: bool,
    pub media_gate: Option<Arc<Notify>>,
    pub heartbeat: Option<Duration>,
}

pub struct TestParticipant {
    pub id: String,
    pub handle: SessionHandle,
    pub task: JoinHandle<SessionOutcome>,
    pub journal: Arc<Journal>,
    pub peers: Arc<FakePeerFactory>,
    pub devices: Arc<FakeDevices>,
}

pub fn join(relay: &MemoryRelay, id: &str, options: Options) -> TestParticipant {
    let journal = Arc::new(Journal::default());
    let peers = Arc::new(FakePeerFactory {
        label: id.to_string(),
        journal: Arc::clone(&journal),
        created: Mutex::new(Vec::new()),
    });
    let devices = Arc::new(FakeDevices {
        journal: Arc::clone(&journal),
        fail: options.fail_media,
        gate: options.media_gate,
        issued: Mutex::new(Vec::new()),
    });
    let deps = SessionDeps {
        ice_servers: Arc::new(JournaledIce {
            journal: Arc::clone(&journal),
            fail: options.fail_ice,
        }),
        peers: peers.clone(),
        devices: devices.clone(),
        signaling: Arc::new(RelayConnector {
            relay: relay.clone(),
            journal: Arc::clone(&journal),
        }),
    };
    let mut config = SessionConfig::new(Url::parse("ws://relay.test").expect("relay url"));
    if let Some(heartbeat) = options.heartbeat {
        config.heartbeat_interval = heartbeat;
    }
    let params = SessionParams {
        session_id: SESSION.into(),
        reservation_id: RESERVATION.into(),
        routing_token: Some("route-1".into()),
        participant: Participant {
            id: id.to_string(),
            bearer_token: format!("token-{id}"),
        },
    };
    let (handle, task) = CallSession::start(params, deps, config).expect("session starts");
    TestParticipant {
        id: id.to_string(),
        handle,
        task,
        journal,
        peers,
        devices,
    }
}

/// Waits until the published status satisfies `pred`.
pub async fn wait_for(
    handle: &SessionHandle,
    what: &str,
    pred: impl Fn(&SessionStatus) -> bool,
) -> SessionStatus {
    let mut rx = handle.watch_status();
    let waited = tokio::time::timeout(Duration::from_secs(5), async move {
        loop {
            {
                let status = rx.borrow_and_update();
                if pred(&status) {
                    return status.clone();
                }
            }
            if rx.changed().await.is_err() {
                let status = rx.borrow().clone();
                assert!(pred(&status), "session finished before {what}: {status:?}");
                return status;
            }
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub async fn outcome(task: JoinHandle<SessionOutcome>) -> SessionOutcome {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not finish")
        .expect("session task panicked")
}

/// Polls `check` until it holds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
