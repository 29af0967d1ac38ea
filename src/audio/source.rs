//! Boundary traits for capture and playback back-ends

use crate::error::AudioError;

/// Native format reported by a capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Callback receiving interleaved f32 batches of arbitrary length in the source format
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A push-based sample source (loopback capture in production)
pub trait SampleSource: Send {
    fn format(&self) -> SourceFormat;

    /// Begin delivering samples to `callback` until [`SampleSource::stop`] or drop
    fn start(&mut self, callback: SampleCallback) -> Result<(), AudioError>;

    fn stop(&mut self);
}

/// Opens a fresh source per stream
pub trait SourceFactory: Send + Sync {
    fn open(&self, device_id: Option<&str>) -> Result<Box<dyn SampleSource>, AudioError>;
}

/// Playback target for canonical 16-bit interleaved PCM
pub trait SampleSink: Send {
    fn start(&mut self) -> Result<(), AudioError>;

    /// Blocks until the whole buffer has been accepted
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Source frames (per-channel samples) consumed by the device since start
    fn played_samples(&self) -> u64;

    /// Playback speed multiplier; 1.0 is nominal
    fn set_speed(&mut self, speed: f32) -> Result<(), AudioError>;

    fn stop(&mut self);
}

/// Opens a fresh sink per receiver session
pub trait SinkFactory: Send + Sync {
    fn open(&self, device_id: Option<&str>, target_ms: u32) -> Result<Box<dyn SampleSink>, AudioError>;
}
