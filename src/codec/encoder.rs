//! Opus encoder wrapper
//!
//! Encodes canonical 48 kHz stereo i16 frames with settings taken from a config snapshot.

use opus::{Application, Channels, Encoder};

use crate::config::ServerConfig;
use crate::constants::{CHANNELS, MAX_OPUS_PACKET, SAMPLE_RATE};
use crate::error::CodecError;

/// Encoder settings fixed for the lifetime of one stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderSettings {
    pub bitrate: u32,
    pub frame_ms: u32,
    pub vbr: bool,
    /// 0-10
    pub complexity: u8,
    /// Restricted low-delay application instead of general audio
    pub low_delay: bool,
}

impl From<&ServerConfig> for EncoderSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            bitrate: config.bitrate,
            frame_ms: config.frame_ms,
            vbr: config.vbr,
            complexity: config.complexity,
            low_delay: config.low_delay,
        }
    }
}

/// Opus encoder wrapper with optimized settings
pub struct OpusEncoder {
    encoder: Encoder,
    /// Samples per channel in one frame
    frame_size: usize,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    pub fn new(settings: EncoderSettings) -> Result<Self, CodecError> {
        let application = if settings.low_delay {
            Application::LowDelay
        } else {
            Application::Audio
        };

        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Stereo, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(settings.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_vbr(settings.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;
        encoder
            .set_complexity(settings.complexity as i32)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set complexity: {}", e)))?;

        Ok(Self {
            encoder,
            frame_size: (SAMPLE_RATE * settings.frame_ms / 1000) as usize,
            encode_buffer: vec![0u8; MAX_OPUS_PACKET],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, CodecError> {
        Self::new(EncoderSettings::from(config))
    }

    /// Encode one interleaved frame; the returned packet borrows the internal buffer
    pub fn encode(&mut self, pcm: &[i16]) -> Result<&[u8], CodecError> {
        if pcm.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let size = self
            .encoder
            .encode(pcm, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;
        Ok(&self.encode_buffer[..size])
    }

    /// Samples per channel in one frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Interleaved samples per frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * CHANNELS as usize
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(frame_ms: u32) -> EncoderSettings {
        EncoderSettings::from(&ServerConfig {
            frame_ms,
            ..Default::default()
        })
    }

    #[test]
    fn test_frame_size_follows_settings() {
        let encoder = OpusEncoder::new(settings(20)).unwrap();
        assert_eq!(encoder.frame_size(), 960);
        assert_eq!(encoder.samples_per_frame(), 1920);
    }

    #[test]
    fn test_encoding() {
        let mut encoder = OpusEncoder::new(settings(40)).unwrap();
        let frame_size = encoder.samples_per_frame();

        let samples: Vec<i16> = (0..frame_size)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();

        let packet_len = encoder.encode(&samples).unwrap().len();
        assert!(packet_len > 0);
        assert!(packet_len < frame_size * 2);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let mut encoder = OpusEncoder::new(settings(10)).unwrap();
        let result = encoder.encode(&[0i16; 100]);
        assert!(matches!(result, Err(CodecError::InvalidFrameSize(100))));
    }

    #[test]
    fn test_complexity_applied() {
        for complexity in [0u8, 5, 10] {
            let mut s = settings(20);
            s.complexity = complexity;
            let mut encoder = OpusEncoder::new(s).unwrap();
            assert_eq!(encoder.encoder.get_complexity().unwrap(), complexity as i32);
        }
    }

    #[test]
    fn test_low_delay_encoder() {
        let mut low = settings(10);
        low.low_delay = true;
        let mut encoder = OpusEncoder::new(low).unwrap();
        let samples = vec![0i16; encoder.samples_per_frame()];
        assert!(encoder.encode(&samples).is_ok());
    }
}
