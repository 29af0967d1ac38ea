//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod conditioner;
pub mod device;
pub mod pacer;
pub mod playback;
pub mod source;

pub use buffer::{Frame, FrameFormat, FramePool, JitterQueue, SampleRing};
pub use capture::{CpalLoopbackSource, CpalSourceFactory};
pub use conditioner::{db_to_linear, GainStage, Normalizer};
pub use pacer::{FillOutcome, FramePacer};
pub use playback::{CpalSink, CpalSinkFactory};
pub use source::{SampleCallback, SampleSink, SampleSource, SinkFactory, SourceFactory, SourceFormat};
