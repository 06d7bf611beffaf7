use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_proto::{IceCandidate, IceServer, SdpType, SessionDescription};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    PeerConnection, PeerError, PeerEvent, PeerFactory, PeerState, RemoteTrack, SenderId,
    SignalingState,
};
use crate::media::{EncodingCap, LocalTrack, SampleGate, TrackKind};
use crate::sink::EventSink;

/// Builds [`WebRtcPeer`]s with the default codecs and interceptors.
#[derive(Debug, Default, Clone)]
pub struct WebRtcPeerFactory;

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: EventSink<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = WebRtcPeer::connect(ice_servers, events).await?;
        Ok(Arc::new(peer))
    }
}

/// A local track as seen by the connection: the RTP track it feeds and the
/// task copying samples into it.
struct OutboundTrack {
    rtc: Arc<TrackLocalStaticSample>,
    gate: Arc<Mutex<Option<SampleGate>>>,
    pump: JoinHandle<()>,
}

struct SenderEntry {
    sender: Arc<RTCRtpSender>,
    kind: TrackKind,
    track_id: String,
    cap: Option<EncodingCap>,
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    stream_id: String,
    outbound: Mutex<HashMap<String, Arc<OutboundTrack>>>,
    senders: Mutex<HashMap<SenderId, SenderEntry>>,
    next_sender: AtomicU32,
}

impl WebRtcPeer {
    pub async fn connect(
        ice_servers: &[IceServer],
        events: EventSink<PeerEvent>,
    ) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        install_handlers(&pc, events);

        Ok(Self {
            pc,
            stream_id: uuid::Uuid::new_v4().to_string(),
            outbound: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU32::new(0),
        })
    }

    fn outbound_for(&self, track: &Arc<LocalTrack>) -> Arc<OutboundTrack> {
        let mut outbound = self.outbound.lock();
        if let Some(existing) = outbound.get(track.id()) {
            return Arc::clone(existing);
        }

        let codec = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id().to_owned(),
            self.stream_id.clone(),
        ));
        let gate = Arc::new(Mutex::new(None));
        let pump = tokio::spawn(pump_samples(
            Arc::clone(track),
            Arc::clone(&rtc),
            Arc::clone(&gate),
        ));
        let entry = Arc::new(OutboundTrack { rtc, gate, pump });
        outbound.insert(track.id().to_owned(), Arc::clone(&entry));
        entry
    }

    fn apply_cap(&self, track_id: &str, cap: Option<EncodingCap>) {
        if let Some(outbound) = self.outbound.lock().get(track_id) {
            *outbound.gate.lock() = cap.map(SampleGate::new);
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Unspecified => SignalingState::Unknown,
        }
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, PeerError> {
        let outbound = self.outbound_for(&track);
        let rtc: Arc<dyn TrackLocal + Send + Sync> = outbound.rtc.clone();
        let sender = self.pc.add_track(rtc).await?;

        // RTCP has to be read for the interceptors to run.
        let reader = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
        });

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(
            id,
            SenderEntry {
                sender,
                kind: track.kind(),
                track_id: track.id().to_owned(),
                cap: None,
            },
        );
        debug!(sender = %id, track = %track.id(), kind = %track.kind(), "track added to peer connection");
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let (rtp_sender, cap) = {
            let senders = self.senders.lock();
            let entry = senders.get(&sender).ok_or(PeerError::UnknownSender(sender))?;
            if entry.kind != track.kind() {
                return Err(PeerError::KindMismatch {
                    sender,
                    expected: entry.kind,
                    actual: track.kind(),
                });
            }
            (Arc::clone(&entry.sender), entry.cap)
        };

        let outbound = self.outbound_for(&track);
        self.apply_cap(track.id(), cap);
        let rtc: Arc<dyn TrackLocal + Send + Sync> = outbound.rtc.clone();
        rtp_sender.replace_track(Some(rtc)).await?;

        if let Some(entry) = self.senders.lock().get_mut(&sender) {
            entry.track_id = track.id().to_owned();
        }
        debug!(%sender, track = %track.id(), "sender source replaced");
        Ok(())
    }

    async fn set_encoding_cap(&self, sender: SenderId, cap: EncodingCap) -> Result<(), PeerError> {
        let track_id = {
            let mut senders = self.senders.lock();
            let entry = senders
                .get_mut(&sender)
                .ok_or(PeerError::UnknownSender(sender))?;
            if entry.kind != TrackKind::Video {
                return Err(PeerError::Unsupported("encoding caps apply to video senders"));
            }
            entry.cap = Some(cap);
            entry.track_id.clone()
        };
        self.apply_cap(&track_id, Some(cap));
        debug!(%sender, bitrate = cap.max_bitrate_bps, framerate = cap.max_framerate, "sender capped");
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        for (_, outbound) in self.outbound.lock().drain() {
            outbound.pump.abort();
        }
        self.pc.close().await?;
        Ok(())
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        for outbound in self.outbound.lock().values() {
            outbound.pump.abort();
        }
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: EventSink<PeerEvent>) {
    let candidates = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidates = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                trace!("local candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    candidates.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => warn!(error = %err, "could not serialize local candidate"),
            }
        })
    }));

    let states = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(?state, "peer connection state changed");
        states.emit(PeerEvent::ConnectionState(peer_state(state)));
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };
        if let Some(kind) = kind {
            events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
        }
        Box::pin(async {})
    }));
}

async fn pump_samples(
    track: Arc<LocalTrack>,
    rtc: Arc<TrackLocalStaticSample>,
    gate: Arc<Mutex<Option<SampleGate>>>,
) {
    let mut samples = track.subscribe();
    loop {
        match samples.recv().await {
            Ok(sample) => {
                let admitted = gate
                    .lock()
                    .as_mut()
                    .is_none_or(|gate| gate.admit(sample.data.len(), sample.duration));
                if !admitted {
                    continue;
                }
                let sample = Sample {
                    data: sample.data,
                    duration: sample.duration,
                    ..Default::default()
                };
                if let Err(err) = rtc.write_sample(&sample).await {
                    trace!(track = %track.id(), error = %err, "sample write failed");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(track = %track.id(), skipped, "sample pump fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let sdp = description.sdp;
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpType::Rollback => return Err(PeerError::Unsupported("rollback descriptions")),
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp,
    }
}
