//! Wall-clock frame pacing
//!
//! Frames are pulled from the capture ring on a fixed cadence. Deadlines advance from the
//! previous deadline rather than from "now", so scheduling jitter never accumulates.

use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

use crate::audio::buffer::SampleRing;

/// Default number of 1 ms waits before a short frame is padded
pub const DEFAULT_GRACE_POLLS: u32 = 3;

/// How a frame was completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Every sample came from the capture ring
    Full,
    /// The tail was padded with this many repeated samples
    Padded(usize),
}

/// Next deadline, derived from the previous one
pub fn advance_deadline(previous: Instant, period: Duration) -> Instant {
    previous + period
}

pub struct FramePacer {
    period: Duration,
    next_due: Instant,
    grace_polls: u32,
    /// Last emitted interleaved frame (one sample per channel)
    last: Vec<f32>,
    padded_frames: u64,
}

impl FramePacer {
    pub fn new(period: Duration, channels: usize) -> Self {
        Self {
            period,
            next_due: Instant::now(),
            grace_polls: DEFAULT_GRACE_POLLS,
            last: vec![0.0; channels.max(1)],
            padded_frames: 0,
        }
    }

    pub fn with_grace_polls(mut self, grace_polls: u32) -> Self {
        self.grace_polls = grace_polls;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Frames that needed padding so far
    pub fn padded_frames(&self) -> u64 {
        self.padded_frames
    }

    /// Fill `frame` from the ring, padding with the last emitted sample once the grace runs out
    pub async fn fill(&mut self, ring: &SampleRing, frame: &mut [f32]) -> FillOutcome {
        let channels = self.last.len();
        let mut filled = 0;
        let mut idle = 0;

        while filled < frame.len() {
            let n = ring.read(&mut frame[filled..]);
            if n > 0 {
                filled += n;
                idle = 0;
                continue;
            }
            if idle >= self.grace_polls {
                break;
            }
            idle += 1;
            sleep(Duration::from_millis(1)).await;
        }

        let outcome = if filled < frame.len() {
            for (i, slot) in frame[filled..].iter_mut().enumerate() {
                *slot = self.last[(filled + i) % channels];
            }
            self.padded_frames += 1;
            FillOutcome::Padded(frame.len() - filled)
        } else {
            FillOutcome::Full
        };

        if frame.len() >= channels {
            self.last.copy_from_slice(&frame[frame.len() - channels..]);
        }
        outcome
    }

    /// Sleep until the next frame is due
    pub async fn wait_next(&mut self) {
        self.next_due = advance_deadline(self.next_due, self.period);
        if self.next_due > Instant::now() {
            sleep_until(self.next_due).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_advances_from_previous() {
        let start = Instant::now();
        let period = Duration::from_millis(10);
        let mut due = start;
        for _ in 0..100 {
            due = advance_deadline(due, period);
        }
        assert_eq!(due - start, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_fill_from_ring() {
        let ring = SampleRing::new(64, 2);
        ring.push(&[0.1, 0.2, 0.3, 0.4]);
        let mut pacer = FramePacer::new(Duration::from_millis(10), 2);
        let mut frame = [0.0f32; 4];
        assert_eq!(pacer.fill(&ring, &mut frame).await, FillOutcome::Full);
        assert_eq!(frame, [0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_pads_with_last_sample() {
        let ring = SampleRing::new(64, 2);
        ring.push(&[0.1, -0.1, 0.5, -0.5]);
        let mut pacer = FramePacer::new(Duration::from_millis(10), 2).with_grace_polls(1);
        let mut frame = [0.0f32; 8];
        assert_eq!(pacer.fill(&ring, &mut frame).await, FillOutcome::Padded(4));
        assert_eq!(frame, [0.1, -0.1, 0.5, -0.5, 0.5, -0.5, 0.5, -0.5]);

        // an entirely idle frame repeats the previous frame's tail, not silence
        let mut next = [0.0f32; 4];
        assert_eq!(pacer.fill(&ring, &mut next).await, FillOutcome::Padded(4));
        assert_eq!(next, [0.5, -0.5, 0.5, -0.5]);
        assert_eq!(pacer.padded_frames(), 2);
    }

    #[tokio::test]
    async fn test_late_samples_within_grace() {
        let ring = std::sync::Arc::new(SampleRing::new(64, 2));
        let feeder = {
            let ring = ring.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                ring.push(&[0.7, 0.7]);
            })
        };
        ring.push(&[0.2, 0.2]);
        let mut pacer = FramePacer::new(Duration::from_millis(10), 2).with_grace_polls(50);
        let mut frame = [0.0f32; 4];
        assert_eq!(pacer.fill(&ring, &mut frame).await, FillOutcome::Full);
        assert_eq!(frame, [0.2, 0.2, 0.7, 0.7]);
        feeder.await.unwrap();
    }
}
