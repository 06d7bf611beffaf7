use std::sync::Arc;

use tokio::time::Interval;
use tracing::{info, warn};

use crate::media::MediaPipeline;
use crate::peer::PeerConnection;
use crate::transport::SignalingLink;

/// Releases a session's resources in a fixed order, at most once:
/// heartbeat, signaling link, peer connection, local tracks.
///
/// Any of the resources may be missing when startup stopped part way.
#[derive(Debug, Default)]
pub struct Teardown {
    done: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub heartbeat_stopped: bool,
    pub link_closed: bool,
    pub peer_closed: bool,
    pub tracks_stopped: usize,
}

impl Teardown {
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Returns `None` when teardown already ran.
    pub async fn run(
        &mut self,
        heartbeat: &mut Option<Interval>,
        link: &mut Option<SignalingLink>,
        peer: Option<Arc<dyn PeerConnection>>,
        media: &mut MediaPipeline,
    ) -> Option<TeardownReport> {
        if std::mem::replace(&mut self.done, true) {
            return None;
        }

        let mut report = TeardownReport {
            heartbeat_stopped: heartbeat.take().is_some(),
            ..TeardownReport::default()
        };
        if let Some(mut link) = link.take() {
            link.close().await;
            report.link_closed = true;
        }
        if let Some(peer) = peer {
            if let Err(err) = peer.close().await {
                warn!(error = %err, "peer connection did not close cleanly");
            }
            report.peer_closed = true;
        }
        report.tracks_stopped = media.stop_all();

        info!(
            heartbeat = report.heartbeat_stopped,
            link = report.link_closed,
            peer = report.peer_closed,
            tracks = report.tracks_stopped,
            "session resources released"
        );
        Some(report)
    }
}
