//! Playback side of a receiver session: prefill, paced pops, concealment and drift

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::{Frame, JitterQueue};
use crate::audio::source::SampleSink;
use crate::config::ReceiverConfig;
use crate::error::SessionError;
use crate::receiver::drift::DriftController;

/// Result of one playback iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Played,
    /// Previous frame repeated; carries the current run of empty polls
    Concealed(u32),
}

#[derive(Debug, Clone, Default)]
pub struct PlayerStats {
    pub frames_played: u64,
    pub frames_concealed: u64,
    pub speed_changes: u64,
}

pub struct Player {
    sink: Box<dyn SampleSink>,
    queue: Arc<JitterQueue>,
    drift: DriftController,
    /// Last frame handed to the sink, kept for concealment
    last: Option<Frame>,
    empty_polls: u32,
    prefill_frames: usize,
    prefill_timeout: Duration,
    poll_timeout: Duration,
    underrun_polls: u32,
    stats: PlayerStats,
}

impl Player {
    pub fn new(sink: Box<dyn SampleSink>, queue: Arc<JitterQueue>, config: &ReceiverConfig) -> Self {
        let samples_per_frame = queue.pool().frame_bytes() / 4;
        Self {
            sink,
            queue,
            drift: DriftController::new(config.drift.clone(), config.prefill_frames, samples_per_frame),
            last: None,
            empty_polls: 0,
            prefill_frames: config.prefill_frames,
            prefill_timeout: config.prefill_timeout(),
            poll_timeout: config.poll_timeout(),
            underrun_polls: config.underrun_polls,
            stats: PlayerStats::default(),
        }
    }

    /// Collect up to `prefill_frames`, start the sink and hand them over
    ///
    /// Stops collecting at the first frame that misses its timeout. Zero frames is fatal.
    /// The first collected frame anchors drift tracking.
    pub fn prefill(&mut self, running: &AtomicBool) -> Result<usize, SessionError> {
        let mut frames = Vec::with_capacity(self.prefill_frames);
        while frames.len() < self.prefill_frames && running.load(Ordering::SeqCst) {
            match self.queue.pop_timeout(self.prefill_timeout) {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }

        let Some(first) = frames.first() else {
            return Err(SessionError::PrefillFailed);
        };
        self.drift.reset(first.remote_sample_count);
        let count = frames.len();
        tracing::debug!(
            "Prefilled {} frames from remote sample {}",
            count,
            first.remote_sample_count
        );

        self.sink.start()?;
        for frame in frames {
            self.play(frame)?;
        }
        Ok(count)
    }

    /// One iteration: play the next frame, or repeat the previous one if none arrives in time
    pub fn step(&mut self) -> Result<StepOutcome, SessionError> {
        if let Some(frame) = self.queue.pop_timeout(self.poll_timeout) {
            self.empty_polls = 0;
            self.play(frame)?;
            return Ok(StepOutcome::Played);
        }

        self.empty_polls += 1;
        if self.empty_polls >= self.underrun_polls {
            return Err(SessionError::Underrun(self.empty_polls));
        }

        let Some(last) = self.last.as_ref() else {
            return Err(SessionError::PrefillFailed);
        };
        self.sink.write(last.data())?;
        let remote = last.remote_sample_count;
        self.stats.frames_concealed += 1;
        self.track_drift(remote);
        Ok(StepOutcome::Concealed(self.empty_polls))
    }

    fn play(&mut self, frame: Frame) -> Result<(), SessionError> {
        self.sink.write(frame.data())?;
        let remote = frame.remote_sample_count;
        if let Some(previous) = self.last.replace(frame) {
            self.queue.recycle(previous);
        }
        self.stats.frames_played += 1;
        self.track_drift(remote);
        Ok(())
    }

    fn track_drift(&mut self, remote: u64) {
        let played = self.sink.played_samples();
        if let Some(speed) = self.drift.observe(remote, played, Instant::now()) {
            tracing::debug!(
                "Playback speed {:.3} (depth {} samples, target {})",
                speed,
                self.drift.depth(),
                self.drift.target()
            );
            if let Err(e) = self.sink.set_speed(speed) {
                tracing::warn!("Failed to set playback speed: {}", e);
            }
        }
    }

    pub fn empty_polls(&self) -> u32 {
        self.empty_polls
    }

    pub fn stats(&self) -> PlayerStats {
        PlayerStats {
            speed_changes: self.drift.speed_changes(),
            ..self.stats.clone()
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.sink.stop();
        if let Some(last) = self.last.take() {
            self.queue.recycle(last);
        }
    }
}
