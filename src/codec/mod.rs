//! Opus encoding and Ogg framing for the HTTP stream

pub mod encoder;
pub mod ogg;

pub use encoder::{EncoderSettings, OpusEncoder};
pub use ogg::OggOpusMuxer;
