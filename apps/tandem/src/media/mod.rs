use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::peer::{PeerConnection, RemoteTrack, SenderId};

mod devices;
mod gate;

pub use devices::{
    AudioConstraints, EncodingCap, LocalStream, LocalTrack, MediaConstraints, MediaDevices,
    MediaError, MediaSample, Resolution, SyntheticDevices, TrackKind, TrackSource,
    VideoConstraints,
};
pub use gate::SampleGate;

/// What the local preview is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Preview {
    None,
    Camera,
    Screen,
}

/// Tracks received from the other participant, grouped the way the UI shows
/// them: one remote stream per call.
#[derive(Debug, Default, Clone)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }
}

/// Owns local capture and its mapping onto the peer connection's senders.
///
/// There is exactly one video sender. Screen sharing swaps the source
/// feeding it rather than adding a second one, so no renegotiation is needed.
#[derive(Debug)]
pub struct MediaPipeline {
    constraints: MediaConstraints,
    cap: EncodingCap,
    camera: Option<LocalStream>,
    screen: Option<LocalStream>,
    screen_pending: bool,
    audio_sender: Option<SenderId>,
    video_sender: Option<SenderId>,
    preview: Preview,
    remote: RemoteStream,
}

impl MediaPipeline {
    pub fn new(constraints: MediaConstraints, cap: EncodingCap) -> Self {
        Self {
            constraints,
            cap,
            camera: None,
            screen: None,
            screen_pending: false,
            audio_sender: None,
            video_sender: None,
            preview: Preview::None,
            remote: RemoteStream::default(),
        }
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn preview(&self) -> Preview {
        self.preview
    }

    pub fn remote(&self) -> &RemoteStream {
        &self.remote
    }

    pub fn audio_sender(&self) -> Option<SenderId> {
        self.audio_sender
    }

    pub fn video_sender(&self) -> Option<SenderId> {
        self.video_sender
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn screen_track_id(&self) -> Option<&str> {
        self.screen
            .as_ref()
            .and_then(|stream| stream.video())
            .map(|track| track.id())
    }

    /// Adds every camera stream track to the connection and caps the video
    /// sender. The stream is owned by the pipeline from here on, even when
    /// attaching fails part way.
    pub async fn attach(
        &mut self,
        stream: LocalStream,
        peer: &dyn PeerConnection,
    ) -> Result<(), MediaError> {
        let tracks = stream.tracks.clone();
        self.camera = Some(stream);
        self.preview = Preview::Camera;

        for track in tracks {
            let sender = peer.add_track(Arc::clone(&track)).await?;
            match track.kind() {
                TrackKind::Audio => self.audio_sender = Some(sender),
                TrackKind::Video => {
                    self.video_sender = Some(sender);
                    if let Err(err) = peer.set_encoding_cap(sender, self.cap).await {
                        warn!(%sender, error = %err, "could not cap video sender");
                    }
                }
            }
            debug!(track = %track.id(), kind = %track.kind(), %sender, "attached local track");
        }
        Ok(())
    }

    /// Marks a screen share as in flight. Returns `false` when there is
    /// nothing to do: already sharing, already acquiring, or no camera sender
    /// to swap into.
    pub fn begin_screen_share(&mut self) -> bool {
        if self.screen.is_some() || self.screen_pending || self.video_sender.is_none() {
            return false;
        }
        self.screen_pending = true;
        true
    }

    /// Display capture failed or was cancelled before producing a stream.
    pub fn abandon_screen_share(&mut self) {
        self.screen_pending = false;
    }

    /// Swaps the acquired display track into the video sender. Returns the
    /// screen track so the caller can watch for it ending.
    pub async fn apply_screen_share(
        &mut self,
        stream: LocalStream,
        peer: &dyn PeerConnection,
    ) -> Result<Arc<LocalTrack>, MediaError> {
        let pending = std::mem::replace(&mut self.screen_pending, false);
        let (Some(sender), Some(track)) = (self.video_sender, stream.video().cloned()) else {
            stream.stop_all();
            return Err(MediaError::NoVideoSender);
        };
        if !pending || self.screen.is_some() {
            stream.stop_all();
            return Err(MediaError::Cancelled);
        }

        if let Err(err) = peer.replace_track(sender, Arc::clone(&track)).await {
            stream.stop_all();
            return Err(err.into());
        }
        if let Err(err) = peer.set_encoding_cap(sender, self.cap).await {
            warn!(%sender, error = %err, "could not cap screen share sender");
        }
        info!(track = %track.id(), "screen share started");
        self.screen = Some(stream);
        self.preview = Preview::Screen;
        Ok(track)
    }

    /// Puts the camera back on the video sender and stops the display
    /// capture. Calling it when no share is active does nothing.
    pub async fn stop_screen_share(&mut self, peer: &dyn PeerConnection) -> bool {
        self.screen_pending = false;
        let Some(screen) = self.screen.take() else {
            return false;
        };

        let camera = self.camera.as_ref().and_then(|stream| stream.video()).cloned();
        if let (Some(sender), Some(camera)) = (self.video_sender, camera) {
            if let Err(err) = peer.replace_track(sender, camera).await {
                warn!(%sender, error = %err, "could not restore camera after screen share");
            }
        }
        screen.stop_all();
        self.preview = if self.camera.is_some() {
            Preview::Camera
        } else {
            Preview::None
        };
        info!("screen share stopped");
        true
    }

    pub fn set_microphone_enabled(&self, enabled: bool) -> bool {
        self.toggle(TrackKind::Audio, enabled)
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> bool {
        self.toggle(TrackKind::Video, enabled)
    }

    fn toggle(&self, kind: TrackKind, enabled: bool) -> bool {
        let track = self.camera.as_ref().and_then(|stream| match kind {
            TrackKind::Audio => stream.audio(),
            TrackKind::Video => stream.video(),
        });
        match track {
            Some(track) => {
                track.set_enabled(enabled);
                debug!(%kind, enabled, "local track toggled");
                true
            }
            None => false,
        }
    }

    pub fn on_remote_track(&mut self, track: RemoteTrack) {
        if self.remote.tracks.iter().any(|t| t.id == track.id) {
            return;
        }
        info!(track = %track.id, kind = %track.kind, "remote track received");
        self.remote.tracks.push(track);
    }

    /// Stops every local track this pipeline owns. Returns how many were
    /// still running.
    pub fn stop_all(&mut self) -> usize {
        self.screen_pending = false;
        let stopped = [self.screen.take(), self.camera.take()]
            .into_iter()
            .flatten()
            .map(|stream| stream.stop_all())
            .sum();
        self.preview = Preview::None;
        self.remote.tracks.clear();
        stopped
    }
}
