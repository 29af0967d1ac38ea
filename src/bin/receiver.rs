//! Audio Receiver Application
//!
//! Connects to a sender's raw PCM port and plays the stream on a local output device,
//! reconnecting until stopped. Status events are printed to stdout as JSON lines.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_streamer::{
    audio::CpalSinkFactory,
    config::{AppConfig, ReceiverConfig},
    constants::DEFAULT_DISCOVERY_PORT,
    network::probe,
    receiver::{PcmReceiver, StatusPublisher},
};

#[derive(Parser, Debug)]
#[command(name = "receiver", about = "Play a LAN audio stream from a sender")]
struct Cli {
    /// Path to a configuration TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sender host
    #[arg(long)]
    host: Option<String>,

    /// Sender PCM port
    #[arg(long)]
    port: Option<u16>,

    /// Sink buffer target in milliseconds
    #[arg(long)]
    target_ms: Option<u32>,

    /// Frames collected before playback starts
    #[arg(long)]
    prefill: Option<usize>,

    /// Jitter queue capacity in frames
    #[arg(long)]
    capacity: Option<usize>,

    /// Output device id, e.g. `output:Headphones`
    #[arg(long)]
    device: Option<String>,

    /// Find a sender by broadcasting a discovery request
    #[arg(long)]
    discover: bool,

    /// Print the default configuration to stdout and exit
    #[arg(long)]
    gen_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut ReceiverConfig) {
        if let Some(ref v) = self.host {
            config.host = v.clone();
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.target_ms {
            config.target_ms = v;
        }
        if let Some(v) = self.prefill {
            config.prefill_frames = v;
        }
        if let Some(v) = self.capacity {
            config.queue_capacity = v;
        }
        if let Some(ref v) = self.device {
            config.output_device = Some(v.clone());
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
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting audio receiver");

    let app = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let mut config = app.receiver;
    cli.apply(&mut config);

    if cli.discover {
        let broadcast = SocketAddr::from(([255, 255, 255, 255], DEFAULT_DISCOVERY_PORT));
        match probe(broadcast, Duration::from_secs(2)).await? {
            Some((peer, reply)) => {
                tracing::info!("Found sender '{}' at {} (pcm {})", reply.name, peer.ip(), reply.pcm);
                config.host = peer.ip().to_string();
                config.port = reply.pcm;
            }
            None => anyhow::bail!("no sender answered discovery"),
        }
    }

    tracing::info!(
        "Target {}:{}  prefill {}  capacity {}  sink {} ms",
        config.host,
        config.port,
        config.prefill_frames,
        config.queue_capacity,
        config.target_ms
    );

    let (status, events) = StatusPublisher::channel();
    let printer = std::thread::spawn(move || {
        for event in events.iter() {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Unprintable status event: {}", e),
            }
        }
    });

    let mut receiver = PcmReceiver::start(config, Arc::new(CpalSinkFactory), status)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, stopping");
    tokio::task::spawn_blocking(move || receiver.stop()).await?;

    let _ = printer.join();
    Ok(())
}
