use std::sync::Arc;

use tandem_proto::{IceServer, Signal};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{
    EndReason, SessionCommand, SessionConfig, SessionDeps, SessionEvent, SessionOutcome,
    SessionParams, SessionStatus, Teardown, post,
};
use crate::media::{LocalStream, MediaError, MediaPipeline};
use crate::negotiation::{Disposition, NegotiationIo, Negotiator, Phase};
use crate::peer::{PeerConnection, PeerEvent, PeerState};
use crate::sink::EventSink;
use crate::transport::{
    Detached, IceProvisionError, LinkState, OutboundSink, SignalingLink, SignalingTarget,
    TransportError, TransportEvent,
};

pub(super) struct SessionActor {
    params: SessionParams,
    deps: SessionDeps,
    config: SessionConfig,
    negotiator: Negotiator,
    media: MediaPipeline,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    status: watch::Sender<SessionStatus>,
    peer: Option<Arc<dyn PeerConnection>>,
    peer_state: Option<PeerState>,
    link: Option<SignalingLink>,
    link_state: Option<LinkState>,
    heartbeat: Option<Interval>,
    teardown: Teardown,
    finish: Option<EndReason>,
    finished: bool,
    error: Option<String>,
}

fn outbound_of(link: &Option<SignalingLink>) -> &dyn OutboundSink {
    match link {
        Some(link) => link,
        None => &Detached,
    }
}

async fn next_heartbeat(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<(Instant, Phase)>) -> Phase {
    match deadline {
        Some((at, phase)) => {
            tokio::time::sleep_until(at).await;
            phase
        }
        None => std::future::pending().await,
    }
}

impl SessionActor {
    pub(super) fn new(
        params: SessionParams,
        deps: SessionDeps,
        config: SessionConfig,
        negotiator: Negotiator,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        events_rx: mpsc::UnboundedReceiver<SessionEvent>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let media = MediaPipeline::new(config.constraints.clone(), config.encoding_cap);
        Self {
            params,
            deps,
            config,
            negotiator,
            media,
            events_tx,
            events_rx,
            status,
            peer: None,
            peer_state: None,
            link: None,
            link_state: None,
            heartbeat: None,
            teardown: Teardown::default(),
            finish: None,
            finished: false,
            error: None,
        }
    }

    pub(super) async fn run(mut self) -> SessionOutcome {
        info!(
            session = %self.params.session_id,
            participant = %self.params.participant.id,
            "call session starting"
        );
        self.fetch_ice_servers();

        let reason = loop {
            let deadline = self.negotiator.deadline(&self.config.timeouts);
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => self.finish_with(EndReason::Detached),
                },
                _ = next_heartbeat(&mut self.heartbeat) => self.send_heartbeat(),
                phase = expire(deadline) => {
                    warn!(%phase, "negotiation timed out");
                    let disposition = self.negotiator.on_timeout(phase);
                    self.apply(disposition).await;
                }
            }
            if let Some(reason) = self.finish.take() {
                break reason;
            }
            self.publish();
        };

        self.shutdown().await;
        let outcome = SessionOutcome {
            phase: self.negotiator.phase(),
            reason,
        };
        info!(phase = %outcome.phase, reason = ?outcome.reason, "call session finished");
        outcome
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::IceServers(result) => self.on_ice_servers(result).await,
            SessionEvent::MediaAcquired(result) => self.on_media(result).await,
            SessionEvent::SignalingReady(result) => self.on_signaling(result).await,
            SessionEvent::Transport(event) => self.on_transport(event).await,
            SessionEvent::Peer(event) => self.on_peer(event).await,
            SessionEvent::ScreenCaptured(result) => self.on_screen_captured(result).await,
            SessionEvent::ScreenCaptureEnded { track_id } => {
                if self.media.screen_track_id() == Some(track_id.as_str()) {
                    info!("screen capture ended by the source");
                    if let Some(peer) = self.peer.clone() {
                        self.media.stop_screen_share(peer.as_ref()).await;
                    }
                }
            }
            SessionEvent::Command(command) => self.on_command(command).await,
        }
    }

    fn fetch_ice_servers(&self) {
        let provider = Arc::clone(&self.deps.ice_servers);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = provider.fetch().await;
            post(&tx, SessionEvent::IceServers(result));
        });
    }

    async fn on_ice_servers(&mut self, result: Result<Vec<IceServer>, IceProvisionError>) {
        let servers = match result {
            Ok(servers) => servers,
            Err(err) => return self.abort_startup(format!("ice servers: {err}")),
        };
        debug!(count = servers.len(), "creating peer connection");
        let events: EventSink<PeerEvent> = EventSink::from_channel(self.events_tx.clone());
        match self.deps.peers.create(&servers, events).await {
            Ok(peer) => {
                self.peer = Some(peer);
                self.acquire_user_media();
            }
            Err(err) => self.abort_startup(format!("peer connection: {err}")),
        }
    }

    fn acquire_user_media(&self) {
        let devices = Arc::clone(&self.deps.devices);
        let constraints = self.media.constraints().clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = devices.user_media(&constraints).await;
            post(&tx, SessionEvent::MediaAcquired(result));
        });
    }

    async fn on_media(&mut self, result: Result<LocalStream, MediaError>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(err) => return self.abort_startup(format!("local media: {err}")),
        };
        let Some(peer) = self.peer.clone() else {
            stream.stop_all();
            return;
        };
        if let Err(err) = self.media.attach(stream, peer.as_ref()).await {
            return self.abort_startup(format!("attaching local media: {err}"));
        }

        let io = NegotiationIo {
            peer: peer.as_ref(),
            outbound: outbound_of(&self.link),
        };
        let disposition = self.negotiator.on_media_ready(&io).await;
        self.apply(disposition).await;
        if self.finish.is_none() {
            self.open_signaling();
        }
    }

    fn open_signaling(&mut self) {
        let target = SignalingTarget {
            relay_url: self.config.relay_url.clone(),
            session_id: self.params.session_id.clone(),
            routing_token: self.params.routing_token.clone(),
            bearer_token: self.params.participant.bearer_token.clone(),
        };
        let connector = Arc::clone(&self.deps.signaling);
        let events: EventSink<TransportEvent> = EventSink::from_channel(self.events_tx.clone());
        let tx = self.events_tx.clone();
        self.link_state = Some(LinkState::Connecting);
        tokio::spawn(async move {
            let result = connector.connect(&target, events).await;
            post(&tx, SessionEvent::SignalingReady(result));
        });
    }

    async fn on_signaling(&mut self, result: Result<SignalingLink, TransportError>) {
        let link = match result {
            Ok(link) => link,
            Err(err) => {
                error!(error = %err, "signaling connection failed");
                self.link_state = Some(LinkState::Error);
                self.error = Some(err.to_string());
                let disposition = self.negotiator.on_transport_lost(err.to_string());
                return self.apply(disposition).await;
            }
        };
        self.link = Some(link);
        self.link_state = Some(LinkState::Open);

        let period = self.config.heartbeat_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);

        let Some(peer) = self.peer.clone() else {
            return;
        };
        let io = NegotiationIo {
            peer: peer.as_ref(),
            outbound: outbound_of(&self.link),
        };
        self.negotiator.on_signaling_open(&io);
    }

    fn send_heartbeat(&mut self) {
        let Some(link) = self.link.as_ref().filter(|link| link.is_open()) else {
            debug!("skipping heartbeat; signaling is not open");
            return;
        };
        match self.negotiator.scope().stamp(Signal::Heartbeat) {
            Ok(envelope) => {
                if let Err(err) = link.deliver(envelope) {
                    debug!(error = %err, "heartbeat not delivered");
                }
            }
            Err(err) => warn!(error = %err, "could not encode heartbeat"),
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        let disposition = match event {
            TransportEvent::Message(envelope) => {
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                let io = NegotiationIo {
                    peer: peer.as_ref(),
                    outbound: outbound_of(&self.link),
                };
                self.negotiator.on_envelope(envelope, &io).await
            }
            TransportEvent::Closed { reason } => {
                self.heartbeat = None;
                self.link_state = Some(LinkState::Closed);
                let reason = reason.unwrap_or_else(|| "signaling closed by relay".to_string());
                self.negotiator.on_transport_lost(reason)
            }
            TransportEvent::Failed(message) => {
                self.heartbeat = None;
                self.link_state = Some(LinkState::Error);
                self.error = Some(message.clone());
                self.negotiator.on_transport_lost(message)
            }
        };
        self.apply(disposition).await;
    }

    async fn on_peer(&mut self, event: PeerEvent) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let io = NegotiationIo {
            peer: peer.as_ref(),
            outbound: outbound_of(&self.link),
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.negotiator.on_local_candidate(candidate, &io);
            }
            PeerEvent::ConnectionState(state) => {
                self.peer_state = Some(state);
                let disposition = self.negotiator.on_peer_state(state, &io);
                self.apply(disposition).await;
            }
            PeerEvent::RemoteTrack(track) => self.media.on_remote_track(track),
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        debug!(?command, "session command");
        match command {
            SessionCommand::Hangup => {
                self.negotiator.hang_up(outbound_of(&self.link));
                self.finish_with(EndReason::LocalHangup);
            }
            SessionCommand::Detach => {
                self.negotiator.detach();
                self.finish_with(EndReason::Detached);
            }
            SessionCommand::StartScreenShare => {
                if !self.media.begin_screen_share() {
                    debug!("screen share already active or unavailable");
                    return;
                }
                let devices = Arc::clone(&self.deps.devices);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = devices.display_media().await;
                    post(&tx, SessionEvent::ScreenCaptured(result));
                });
            }
            SessionCommand::StopScreenShare => {
                if let Some(peer) = self.peer.clone() {
                    self.media.stop_screen_share(peer.as_ref()).await;
                }
            }
            SessionCommand::SetMicrophone(enabled) => {
                self.media.set_microphone_enabled(enabled);
            }
            SessionCommand::SetCamera(enabled) => {
                self.media.set_camera_enabled(enabled);
            }
        }
    }

    async fn on_screen_captured(&mut self, result: Result<LocalStream, MediaError>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "screen capture failed");
                self.media.abandon_screen_share();
                return;
            }
        };
        let Some(peer) = self.peer.clone() else {
            stream.stop_all();
            return;
        };
        match self.media.apply_screen_share(stream, peer.as_ref()).await {
            Ok(track) => {
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    track.ended().await;
                    let _ = tx.send(SessionEvent::ScreenCaptureEnded {
                        track_id: track.id().to_owned(),
                    });
                });
            }
            Err(err) => warn!(error = %err, "screen share not applied"),
        }
    }

    async fn apply(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Continue => {}
            Disposition::Ended => self.finish_with(EndReason::RemoteEnded),
            Disposition::RelayError(message) => {
                self.error = Some(message.clone());
                self.heartbeat = None;
                if let Some(link) = self.link.as_mut() {
                    link.close().await;
                    self.link_state = Some(LinkState::Closed);
                }
                if self.negotiator.phase() == Phase::Failed {
                    self.finish_with(EndReason::RelayError(message));
                }
            }
            Disposition::TransportLost(reason) => {
                self.finish_with(EndReason::TransportLost(reason));
            }
            Disposition::Failed(reason) => {
                error!(%reason, "call failed");
                self.error = Some(reason.clone());
                self.finish_with(EndReason::Failed(reason));
            }
        }
    }

    fn abort_startup(&mut self, reason: String) {
        error!(%reason, "call session could not start");
        self.error = Some(reason.clone());
        self.negotiator.fail(reason.clone());
        self.finish_with(EndReason::StartupFailed(reason));
    }

    fn finish_with(&mut self, reason: EndReason) {
        if self.finish.is_none() && !self.finished {
            self.finish = Some(reason);
        }
    }

    async fn shutdown(&mut self) {
        self.finished = true;
        self.events_rx.close();
        self.teardown
            .run(
                &mut self.heartbeat,
                &mut self.link,
                self.peer.take(),
                &mut self.media,
            )
            .await;
        while let Ok(event) = self.events_rx.try_recv() {
            event.release();
        }
        if matches!(self.link_state, Some(LinkState::Open | LinkState::Connecting)) {
            self.link_state = Some(LinkState::Closed);
        }
        self.publish();
    }

    fn publish(&self) {
        let status = SessionStatus {
            negotiation: self.negotiator.snapshot(),
            link: self.link_state,
            peer: self.peer_state,
            preview: self.media.preview(),
            screen_sharing: self.media.is_screen_sharing(),
            remote_tracks: self.media.remote().tracks().len(),
            error: self.error.clone(),
            finished: self.finished,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}
