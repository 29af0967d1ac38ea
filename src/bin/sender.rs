//! Audio Sender Application
//!
//! Captures this machine's audio output and serves it as Ogg/Opus over HTTP and raw PCM
//! over TCP, with a UDP discovery responder alongside.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_streamer::{
    audio::CpalSourceFactory,
    config::{AppConfig, ServerConfig, SharedConfig},
    http::WebServer,
    network::{DiscoveryResponder, PcmServer},
    pipeline::AudioPipeline,
};

#[derive(Parser, Debug)]
#[command(name = "sender", about = "Stream system audio to LAN receivers")]
struct Cli {
    /// Path to a configuration TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port for /stream.opus and the config API
    #[arg(long)]
    port: Option<u16>,

    /// TCP port for raw PCM
    #[arg(long)]
    pcm_port: Option<u16>,

    /// Opus bitrate in bits per second
    #[arg(long)]
    bitrate: Option<u32>,

    /// Opus frame duration (10, 20, 40 or 60 ms)
    #[arg(long)]
    frame_ms: Option<u32>,

    /// Preamp in dB
    #[arg(long, allow_hyphen_values = true)]
    gain_db: Option<f32>,

    /// Capture device id, e.g. `output:Speakers`
    #[arg(long)]
    device: Option<String>,

    /// Allow more than one stream at a time
    #[arg(long)]
    allow_multiple: bool,

    /// Do not answer discovery requests
    #[arg(long)]
    no_discovery: bool,

    /// Print the default configuration to stdout and exit
    #[arg(long)]
    gen_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.pcm_port {
            config.pcm_port = v;
        }
        if let Some(v) = self.bitrate {
            config.bitrate = v;
        }
        if let Some(v) = self.frame_ms {
            config.frame_ms = v;
        }
        if let Some(v) = self.gain_db {
            config.gain_db = v;
        }
        if let Some(ref v) = self.device {
            config.capture_device = Some(v.clone());
        }
        if self.allow_multiple {
            config.single_client = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", toml::to_string_pretty(&AppConfig::default())?);
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting audio sender");

    // file < environment < command line
    let app = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let mut config = app.server;
    config.apply_env();
    cli.apply(&mut config);
    config.validate()?;

    tracing::info!(
        "HTTP :{}  PCM :{}  discovery :{}  bitrate {}  frame {} ms  single-client {}",
        config.port,
        config.pcm_port,
        config.discovery_port,
        config.bitrate,
        config.frame_ms,
        config.single_client
    );

    let pipeline = AudioPipeline::new(SharedConfig::new(config), Arc::new(CpalSourceFactory));

    let mut tasks = JoinSet::new();
    tasks.spawn(WebServer::new(pipeline.clone()).run());
    tasks.spawn(PcmServer::new(pipeline.clone()).run());
    if !cli.no_discovery {
        tasks.spawn(DiscoveryResponder::new(pipeline.clone()).run());
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Ctrl-C received, shutting down");
        }
        Some(finished) = tasks.join_next() => {
            match finished {
                Ok(Ok(())) => tracing::warn!("A listener exited early"),
                Ok(Err(e)) => tracing::error!("Listener failed: {}", e),
                Err(e) => tracing::error!("Listener task panicked: {}", e),
            }
        }
    }

    pipeline.shutdown();
    let drain = async {
        while let Some(finished) = tasks.join_next().await {
            if let Ok(Err(e)) = finished {
                tracing::warn!("Listener stopped with error: {}", e);
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(3), drain).await.is_err() {
        tracing::warn!("Listeners did not stop in time");
        tasks.abort_all();
    }

    tracing::info!("Sender stopped");
    Ok(())
}
