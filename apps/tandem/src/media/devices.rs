use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const SAMPLE_BACKLOG: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// One encoded media frame handed to whatever is sending the track.
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// A local capture track.
///
/// Disabling a track keeps it attached but stops its samples from reaching
/// senders. Stopping is final and happens at most once; `ended` resolves
/// whether the stop came from us or from the capture source itself.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: watch::Sender<bool>,
    samples: broadcast::Sender<MediaSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        let (samples, _) = broadcast::channel(SAMPLE_BACKLOG);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source,
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ended,
            samples,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops capture. Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.ended.send_replace(true);
        debug!(track = %self.id, kind = %self.kind, source = ?self.source, "local track stopped");
        true
    }

    /// Capture ended outside our control, e.g. the user closed the share picker.
    pub fn end(&self) {
        self.stop();
    }

    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.samples.subscribe()
    }

    /// Publishes a captured frame. Disabled or stopped tracks swallow it.
    /// Returns the number of senders that received it.
    pub fn push_sample(&self, sample: MediaSample) -> usize {
        if self.is_stopped() || !self.is_enabled() {
            return 0;
        }
        self.samples.send(sample).unwrap_or(0)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Stops every track; returns how many were still live.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConstraints {
    pub ideal: Resolution,
    pub max: Resolution,
    pub ideal_framerate: u32,
    pub max_framerate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal: Resolution {
                width: 640,
                height: 360,
            },
            max: Resolution {
                width: 1280,
                height: 720,
            },
            ideal_framerate: 24,
            max_framerate: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: VideoConstraints,
}

/// Upper bound applied to an outgoing video sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingCap {
    pub max_bitrate_bps: u64,
    pub max_framerate: u32,
}

impl Default for EncodingCap {
    fn default() -> Self {
        Self {
            max_bitrate_bps: 600_000,
            max_framerate: 24,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device: {0}")]
    NotFound(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("screen share is not available without an attached camera")]
    NoVideoSender,
    #[error("screen share was cancelled")]
    Cancelled,
    #[error("attaching media failed: {0}")]
    Attach(#[from] crate::peer::PeerError),
}

/// Source of capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera and microphone, one track each.
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;

    /// A display capture stream with a single video track.
    async fn display_media(&self) -> Result<LocalStream, MediaError>;
}

/// Devices that produce tracks without touching hardware. Samples are only
/// produced when a caller pushes them.
#[derive(Debug, Default, Clone)]
pub struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let video = &constraints.video;
        let audio = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "synthetic microphone");
        let camera = LocalTrack::new(
            TrackKind::Video,
            TrackSource::Camera,
            format!(
                "synthetic camera {}x{}@{}",
                video.ideal.width, video.ideal.height, video.ideal_framerate
            ),
        );
        Ok(LocalStream::new(vec![audio, camera]))
    }

    async fn display_media(&self) -> Result<LocalStream, MediaError> {
        let screen = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "synthetic display");
        Ok(LocalStream::new(vec![screen]))
    }
}
