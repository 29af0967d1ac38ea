//! Configuration for the sender and receiver
//!
//! The sender keeps one live [`ServerConfig`] behind [`SharedConfig`]. Each stream takes an
//! `Arc` snapshot when it starts and keeps it for its whole lifetime, so edits made through
//! the config API only ever reach sessions started afterwards.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Frame durations accepted for the Opus path (all valid Opus frame sizes at 48 kHz)
pub const VALID_FRAME_MS: [u32; 4] = [10, 20, 40, 60];

/// Sender configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface the HTTP and PCM listeners bind to
    pub bind_address: String,
    /// HTTP port serving `/stream.opus` and the config API
    pub port: u16,
    /// Raw PCM TCP port
    pub pcm_port: u16,
    /// UDP discovery port
    pub discovery_port: u16,
    /// Opus bitrate in bits per second
    pub bitrate: u32,
    /// Opus frame duration in milliseconds
    pub frame_ms: u32,
    /// Fixed preamp in dB
    pub gain_db: f32,
    /// Limiter ceiling in dBFS
    pub target_peak_dbfs: f32,
    /// How often buffered Ogg pages are pushed to the HTTP client
    pub flush_interval_ms: u64,
    /// Admit at most one stream across both transports
    pub single_client: bool,
    pub vbr: bool,
    /// Opus complexity 0-10
    pub complexity: u8,
    /// Use the restricted low-delay Opus application
    pub low_delay: bool,
    /// Capture device id (`output:<name>` / `input:<name>`); `None` uses the default output
    pub capture_device: Option<String>,
    /// Name announced by the discovery responder
    pub host_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_HTTP_PORT,
            pcm_port: DEFAULT_PCM_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            bitrate: DEFAULT_BITRATE,
            frame_ms: DEFAULT_FRAME_MS,
            gain_db: 0.0,
            target_peak_dbfs: -1.0,
            flush_interval_ms: 100,
            single_client: true,
            vbr: true,
            complexity: 8,
            low_delay: false,
            capture_device: None,
            host_name: default_host_name(),
        }
    }
}

impl ServerConfig {
    /// Samples per channel in one Opus frame
    pub fn samples_per_frame(&self) -> usize {
        (SAMPLE_RATE * self.frame_ms / 1000) as usize
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Check every value the encoder and pacer depend on
    pub fn validate(&self) -> Result<()> {
        if !(6_000..=510_000).contains(&self.bitrate) {
            return Err(Error::Config(format!("bitrate {} out of range 6000-510000", self.bitrate)));
        }
        if !VALID_FRAME_MS.contains(&self.frame_ms) {
            return Err(Error::Config(format!(
                "frame_ms {} must be one of {:?}",
                self.frame_ms, VALID_FRAME_MS
            )));
        }
        if self.complexity > 10 {
            return Err(Error::Config(format!("complexity {} exceeds 10", self.complexity)));
        }
        if !self.gain_db.is_finite() || !(-60.0..=24.0).contains(&self.gain_db) {
            return Err(Error::Config(format!("gain_db {} out of range -60..24", self.gain_db)));
        }
        if !self.target_peak_dbfs.is_finite() || self.target_peak_dbfs > 0.0 || self.target_peak_dbfs < -40.0 {
            return Err(Error::Config(format!(
                "target_peak_dbfs {} out of range -40..0",
                self.target_peak_dbfs
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::Config("flush_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Apply `AUDIOSTREAMER_*` environment overrides
    pub fn apply_env(&mut self) {
        fn var<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = var("AUDIOSTREAMER_PORT") {
            self.port = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_PCM_PORT") {
            self.pcm_port = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_DISCOVERY_PORT") {
            self.discovery_port = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_BITRATE") {
            self.bitrate = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_FRAME_MS") {
            self.frame_ms = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_GAIN_DB") {
            self.gain_db = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_TARGET_PEAK_DBFS") {
            self.target_peak_dbfs = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_FLUSH_INTERVAL_MS") {
            self.flush_interval_ms = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_SINGLE_CLIENT") {
            self.single_client = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_COMPLEXITY") {
            self.complexity = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_VBR") {
            self.vbr = v;
        }
        if let Some(v) = var("AUDIOSTREAMER_LOW_DELAY") {
            self.low_delay = v;
        }
        if let Ok(v) = std::env::var("AUDIOSTREAMER_DEVICE") {
            self.capture_device = if v.is_empty() { None } else { Some(v) };
        }
    }
}

fn default_host_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "audio-streamer".to_string())
}

/// Partial update accepted by the config API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub bitrate: Option<u32>,
    pub frame_ms: Option<u32>,
    pub gain_db: Option<f32>,
    pub target_peak_dbfs: Option<f32>,
    pub flush_interval_ms: Option<u64>,
    pub single_client: Option<bool>,
    pub vbr: Option<bool>,
    pub complexity: Option<u8>,
    pub low_delay: Option<bool>,
    /// `Some("")` clears the device selection
    pub capture_device: Option<String>,
}

impl ConfigUpdate {
    fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(v) = self.bitrate {
            config.bitrate = v;
        }
        if let Some(v) = self.frame_ms {
            config.frame_ms = v;
        }
        if let Some(v) = self.gain_db {
            config.gain_db = v;
        }
        if let Some(v) = self.target_peak_dbfs {
            config.target_peak_dbfs = v;
        }
        if let Some(v) = self.flush_interval_ms {
            config.flush_interval_ms = v;
        }
        if let Some(v) = self.single_client {
            config.single_client = v;
        }
        if let Some(v) = self.vbr {
            config.vbr = v;
        }
        if let Some(v) = self.complexity {
            config.complexity = v;
        }
        if let Some(v) = self.low_delay {
            config.low_delay = v;
        }
        if let Some(ref v) = self.capture_device {
            config.capture_device = if v.is_empty() { None } else { Some(v.clone()) };
        }
    }
}

/// Immutable per-stream view of the server configuration
pub type ConfigSnapshot = Arc<ServerConfig>;

/// Live, mutable server configuration
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<ConfigSnapshot>>,
}

impl SharedConfig {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Capture the current configuration for a new session
    pub fn snapshot(&self) -> ConfigSnapshot {
        self.inner.read().clone()
    }

    /// Validate and install an update; in-flight snapshots are untouched
    pub fn update(&self, update: &ConfigUpdate) -> Result<ConfigSnapshot> {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        update.apply_to(&mut next);
        next.validate()?;
        let next = Arc::new(next);
        *guard = next.clone();
        tracing::info!(
            "Config updated: bitrate={} frame_ms={} gain_db={} ceiling_dbfs={} single_client={}",
            next.bitrate,
            next.frame_ms,
            next.gain_db,
            next.target_peak_dbfs,
            next.single_client
        );
        Ok(next)
    }
}

/// Playback speed correction parameters
///
/// These are empirically tuned; keep them configurable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub speed_up: f32,
    pub slow_down: f32,
    /// Dead band around the target depth, in frames
    pub threshold_frames: u32,
    /// Minimum time between two speed changes
    pub min_change_interval_ms: u64,
    /// Speed changes are only made when prefill is at least this many frames
    pub min_prefill_frames: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            speed_up: 1.005,
            slow_down: 0.995,
            threshold_frames: 4,
            min_change_interval_ms: 250,
            min_prefill_frames: 3,
        }
    }
}

/// Receiver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub host: String,
    pub port: u16,
    /// Sink buffer target in milliseconds
    pub target_ms: u32,
    pub prefill_frames: usize,
    pub queue_capacity: usize,
    /// Wait for each prefill frame
    pub prefill_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    /// Consecutive empty polls treated as a fatal underrun
    pub underrun_polls: u32,
    pub reconnect_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    /// Socket read timeout; `0` blocks indefinitely
    pub read_timeout_ms: u64,
    pub socket_buffer_bytes: usize,
    /// Output device id; `None` uses the default output
    pub output_device: Option<String>,
    pub drift: DriftConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PCM_PORT,
            target_ms: 40,
            prefill_frames: 6,
            queue_capacity: 16,
            prefill_timeout_ms: 400,
            poll_timeout_ms: 120,
            underrun_polls: 64,
            reconnect_backoff_ms: 300,
            connect_timeout_ms: 1500,
            read_timeout_ms: 0,
            socket_buffer_bytes: 256 * 1024,
            output_device: None,
            drift: DriftConfig::default(),
        }
    }
}

impl ReceiverConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn prefill_timeout(&self) -> Duration {
        Duration::from_millis(self.prefill_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".into()));
        }
        if self.prefill_frames == 0 || self.prefill_frames > self.queue_capacity {
            return Err(Error::Config(format!(
                "prefill_frames {} must be in 1..={}",
                self.prefill_frames, self.queue_capacity
            )));
        }
        if self.underrun_polls == 0 {
            return Err(Error::Config("underrun_polls must be positive".into()));
        }
        if self.drift.speed_up < 1.0 || self.drift.slow_down > 1.0 || self.drift.slow_down <= 0.0 {
            return Err(Error::Config("drift speeds must bracket 1.0".into()));
        }
        Ok(())
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub receiver: ReceiverConfig,
}

impl AppConfig {
    /// Load `config.toml` from the platform config directory, falling back to defaults
    pub fn load() -> Result<Self> {
        let Some(path) = Self::config_path() else {
            tracing::debug!("No config directory available, using defaults");
            return Ok(Self::default());
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.server.validate()?;
        config.receiver.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "audio-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ServerConfig::default().validate().is_ok());
        assert!(ReceiverConfig::default().validate().is_ok());
        assert_eq!(ServerConfig::default().samples_per_frame(), 1920);
    }

    #[test]
    fn test_snapshot_isolated_from_updates() {
        let shared = SharedConfig::new(ServerConfig::default());
        let in_flight = shared.snapshot();

        let update = ConfigUpdate {
            bitrate: Some(96_000),
            frame_ms: Some(20),
            ..Default::default()
        };
        shared.update(&update).unwrap();

        assert_eq!(in_flight.bitrate, DEFAULT_BITRATE);
        assert_eq!(in_flight.frame_ms, DEFAULT_FRAME_MS);
        let next = shared.snapshot();
        assert_eq!(next.bitrate, 96_000);
        assert_eq!(next.frame_ms, 20);
    }

    #[test]
    fn test_invalid_update_rejected() {
        let shared = SharedConfig::new(ServerConfig::default());
        let update = ConfigUpdate {
            frame_ms: Some(15),
            ..Default::default()
        };
        assert!(shared.update(&update).is_err());
        assert_eq!(shared.snapshot().frame_ms, DEFAULT_FRAME_MS);
    }

    #[test]
    fn test_empty_device_clears_selection() {
        let mut config = ServerConfig {
            capture_device: Some("output:Speakers".into()),
            ..Default::default()
        };
        ConfigUpdate {
            capture_device: Some(String::new()),
            ..Default::default()
        }
        .apply_to(&mut config);
        assert_eq!(config.capture_device, None);
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            bitrate = 128000

            [receiver]
            prefill_frames = 2

            [receiver.drift]
            threshold_frames = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bitrate, 128_000);
        assert_eq!(config.server.frame_ms, DEFAULT_FRAME_MS);
        assert_eq!(config.receiver.prefill_frames, 2);
        assert_eq!(config.receiver.drift.threshold_frames, 6);
        assert_eq!(config.receiver.drift.min_change_interval_ms, 250);
    }
}
