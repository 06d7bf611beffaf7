use std::time::Duration;

use super::EncodingCap;

const FRAME_TOLERANCE: Duration = Duration::from_micros(500);

/// Admission control for an outgoing video sender.
///
/// Time is the media clock: the sum of the durations of every sample offered,
/// admitted or not. Bitrate is a token bucket holding one second of budget;
/// framerate drops whole frames so that at most `max_framerate` frames are
/// admitted per second of media.
#[derive(Debug, Clone)]
pub struct SampleGate {
    cap: EncodingCap,
    clock: Duration,
    last_refill: Duration,
    next_frame_due: Duration,
    tokens: f64,
    capacity: f64,
    bytes_per_second: f64,
    frame_interval: Duration,
}

impl SampleGate {
    pub fn new(cap: EncodingCap) -> Self {
        let bytes_per_second = cap.max_bitrate_bps as f64 / 8.0;
        let frame_interval = Duration::from_secs(1) / cap.max_framerate.max(1);
        Self {
            cap,
            clock: Duration::ZERO,
            last_refill: Duration::ZERO,
            next_frame_due: Duration::ZERO,
            tokens: bytes_per_second,
            capacity: bytes_per_second,
            bytes_per_second,
            frame_interval,
        }
    }

    pub fn cap(&self) -> EncodingCap {
        self.cap
    }

    pub fn admit(&mut self, len: usize, duration: Duration) -> bool {
        let at = self.clock;
        self.clock += duration;

        let elapsed = at.saturating_sub(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.bytes_per_second).min(self.capacity);
        self.last_refill = at;

        if at + FRAME_TOLERANCE < self.next_frame_due {
            return false;
        }
        let len = len as f64;
        if len > self.tokens {
            return false;
        }

        self.tokens -= len;
        let next = self.next_frame_due + self.frame_interval;
        self.next_frame_due = if next < at { at + self.frame_interval } else { next };
        true
    }
}
