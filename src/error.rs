//! Error types for the audio streaming application

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Sink write failed: {0}")]
    WriteFailed(String),

    #[error("Sink is not running")]
    SinkStopped,
}

/// Codec and container errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Packet too large for a single Ogg page: {0} bytes")]
    PacketTooLarge(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Client disconnected")]
    ClientGone,
}

/// Receiver session failures; every variant ends the current connection attempt
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("no data during prefill")]
    PrefillFailed,

    #[error("pcm underrun timeout after {0} empty polls")]
    Underrun(u32),

    #[error("socket closed or read failed: {0}")]
    ReadFailed(String),

    #[error("audio sink failed: {0}")]
    Sink(#[from] AudioError),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
