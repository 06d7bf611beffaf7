use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;

use tandem_proto::IceCandidate;
use tracing::{debug, warn};

/// Remote candidates that arrived before a remote description existed.
///
/// Candidates are held in arrival order and handed to the peer connection in
/// that same order once the remote description has been accepted. A candidate
/// that fails to apply is dropped; it never blocks the ones behind it and is
/// never put back.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub dropped: usize,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
        debug!(queued = self.pending.len(), "buffered early remote candidate");
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies every queued candidate, oldest first, one at a time.
    pub async fn flush<F, Fut, E>(&mut self, mut apply: F) -> FlushReport
    where
        F: FnMut(IceCandidate) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut report = FlushReport::default();
        while let Some(candidate) = self.pending.pop_front() {
            let label = candidate.candidate.clone();
            match apply(candidate).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    report.dropped += 1;
                    warn!(candidate = %label, error = %err, "dropping queued candidate that failed to apply");
                }
            }
        }
        if report.applied + report.dropped > 0 {
            debug!(
                applied = report.applied,
                dropped = report.dropped,
                "flushed queued remote candidates"
            );
        }
        report
    }
}
