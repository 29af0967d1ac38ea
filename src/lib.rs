//! # Audio Streamer
//!
//! Near real-time streaming of a machine's system audio to a playback device on the LAN.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               SENDER PC                                  │
//! │  ┌──────────────────┐                                                    │
//! │  │ Loopback capture │  cpal callback, native rate/layout                 │
//! │  └────────┬─────────┘                                                    │
//! │           ▼                                                              │
//! │  ┌──────────────────┐   ┌──────────────┐   ┌───────────────────────┐    │
//! │  │ Normalizer       │──▶│ SampleRing   │──▶│ FramePacer            │    │
//! │  │ 48k stereo f32   │   │ (mutex ring) │   │ wall-clock deadlines  │    │
//! │  └──────────────────┘   └──────────────┘   └───────────┬───────────┘    │
//! │                                                        ▼                 │
//! │                                            ┌───────────────────────┐    │
//! │                                            │ GainStage (limiter)   │    │
//! │                                            │ f32 -> i16            │    │
//! │                                            └─────┬───────────┬─────┘    │
//! │                                                  │           │          │
//! │                          ┌───────────────────────▼──┐   ┌────▼───────┐  │
//! │                          │ Opus encoder + Ogg muxer │   │ PCM framer │  │
//! │                          └────────────┬─────────────┘   └────┬───────┘  │
//! │                                       ▼                      ▼          │
//! │                          GET /stream.opus (HTTP)     TCP :7352 (PCM)     │
//! │                          └──────── ClientGate (single client) ───────┘   │
//! └─────────────────────────────────────────┼────────────────────────────────┘
//!                                           │ LAN
//!                                           ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              RECEIVER                                    │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   ┌───────────┐  │
//! │  │ Reader      │──▶│ JitterQueue  │──▶│ Player       │──▶│ SampleSink│  │
//! │  │ thread      │   │ + FramePool  │   │ drift + PLC  │   │ (cpal)    │  │
//! │  └─────────────┘   └──────────────┘   └──────────────┘   └───────────┘  │
//! │          Connecting → Prefilling → Playing → Disconnected → backoff      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod network;
pub mod pipeline;
pub mod receiver;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Canonical sample rate for everything past the conditioner
    pub const SAMPLE_RATE: u32 = 48000;

    /// Canonical channel count (interleaved stereo)
    pub const CHANNELS: u16 = 2;

    /// Canonical PCM sample width
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Raw PCM frames are always 10 ms
    pub const PCM_FRAME_MS: u32 = 10;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 160_000;

    /// Default Opus frame duration in milliseconds
    pub const DEFAULT_FRAME_MS: u32 = 40;

    /// Default HTTP port for `/stream.opus`
    pub const DEFAULT_HTTP_PORT: u16 = 7350;

    /// Default UDP discovery port
    pub const DEFAULT_DISCOVERY_PORT: u16 = 7351;

    /// Default TCP port for raw PCM
    pub const DEFAULT_PCM_PORT: u16 = 7352;

    /// Upper bound for one encoded Opus packet
    pub const MAX_OPUS_PACKET: usize = 4000;

    /// Capture ring depth for the Opus path
    pub const HTTP_RING_MS: u32 = 2000;

    /// Capture ring depth for the PCM path
    pub const PCM_RING_MS: u32 = 200;

    /// Literal discovery request
    pub const DISCOVERY_TOKEN: &[u8] = b"AUDIOSTREAMER_DISCOVER";

    /// Literal prefix in front of the discovery JSON reply
    pub const DISCOVERY_REPLY_PREFIX: &str = "AUDIOSTREAMER_HERE ";

    /// Vendor string written into `OpusTags`
    pub const VENDOR: &str = "audio-streamer";
}
