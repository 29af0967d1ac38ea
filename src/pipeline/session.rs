//! Per-stream capture session: source -> normalizer -> ring -> pacer -> gain stage

use std::sync::Arc;
use std::time::Duration;

use crate::audio::buffer::SampleRing;
use crate::audio::conditioner::{GainStage, Normalizer};
use crate::audio::pacer::{FillOutcome, FramePacer};
use crate::audio::source::{SampleSource, SourceFactory};
use crate::config::ServerConfig;
use crate::constants::CHANNELS;
use crate::error::AudioError;

pub struct CaptureSession {
    source: Box<dyn SampleSource>,
    ring: Arc<SampleRing>,
    pacer: FramePacer,
    gain: GainStage,
    float_frame: Vec<f32>,
    pcm_frame: Vec<i16>,
    /// Per-channel samples emitted before the current frame
    position: u64,
    frame_size: usize,
}

impl CaptureSession {
    /// Open the configured device and start capturing
    pub fn open(
        sources: &dyn SourceFactory,
        snapshot: &ServerConfig,
        frame_ms: u32,
        ring_ms: u32,
    ) -> Result<Self, AudioError> {
        let source = sources.open(snapshot.capture_device.as_deref())?;
        Self::start(source, snapshot, frame_ms, ring_ms)
    }

    /// Start an already-opened source
    pub fn start(
        mut source: Box<dyn SampleSource>,
        snapshot: &ServerConfig,
        frame_ms: u32,
        ring_ms: u32,
    ) -> Result<Self, AudioError> {
        let ring = Arc::new(SampleRing::with_duration_ms(ring_ms));
        let mut normalizer = Normalizer::new(source.format());
        let mut scratch = Vec::with_capacity(4096);
        let feed = ring.clone();
        source.start(Box::new(move |batch: &[f32]| {
            scratch.clear();
            normalizer.process(batch, &mut scratch);
            feed.push(&scratch);
        }))?;

        let frame_size = (crate::constants::SAMPLE_RATE * frame_ms / 1000) as usize;
        let interleaved = frame_size * CHANNELS as usize;
        tracing::debug!(
            "Capture session: {:?}, {} ms frames, gain {:.2} dB, ceiling {:.2} dBFS",
            source.format(),
            frame_ms,
            snapshot.gain_db,
            snapshot.target_peak_dbfs
        );

        Ok(Self {
            source,
            ring,
            pacer: FramePacer::new(Duration::from_millis(frame_ms as u64), CHANNELS as usize),
            gain: GainStage::from_db(snapshot.gain_db, snapshot.target_peak_dbfs),
            float_frame: vec![0.0; interleaved],
            pcm_frame: vec![0; interleaved],
            position: 0,
            frame_size,
        })
    }

    /// Produce the next conditioned frame with the sample position at its start
    pub async fn next_frame(&mut self) -> (u64, &[i16]) {
        if let FillOutcome::Padded(n) = self.pacer.fill(&self.ring, &mut self.float_frame).await {
            tracing::trace!("Capture idle, padded {} samples", n);
        }
        self.gain.process(&self.float_frame, &mut self.pcm_frame);
        let start = self.position;
        self.position += self.frame_size as u64;
        (start, &self.pcm_frame)
    }

    /// Sleep until the next frame is due
    pub async fn wait_next(&mut self) {
        self.pacer.wait_next().await;
    }

    /// Per-channel samples in one frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn padded_frames(&self) -> u64 {
        self.pacer.padded_frames()
    }

    pub fn ring_overflows(&self) -> u64 {
        self.ring.overflow_count()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.source.stop();
    }
}
