//! One receiver connection attempt: connect, read, prefill, play, tear down

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{FrameFormat, FramePool, JitterQueue};
use crate::audio::source::SinkFactory;
use crate::config::ReceiverConfig;
use crate::error::SessionError;
use crate::receiver::player::{Player, PlayerStats};
use crate::receiver::status::{StatusKind, StatusPublisher};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);

/// Resolve `host:port`, preferring IPv4
fn resolve(config: &ReceiverConfig) -> Result<SocketAddr, SessionError> {
    let target = format!("{}:{}", config.host, config.port);
    let connect_err = |reason: String| SessionError::Connect {
        addr: target.clone(),
        reason,
    };
    let addrs: Vec<SocketAddr> = target
        .to_socket_addrs()
        .map_err(|e| connect_err(e.to_string()))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| connect_err("no address".into()))
}

/// Open a tuned TCP connection to the sender's PCM port
pub fn connect(config: &ReceiverConfig) -> Result<TcpStream, SessionError> {
    let addr = resolve(config)?;
    let connect_err = |reason: String| SessionError::Connect {
        addr: addr.to_string(),
        reason,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| connect_err(e.to_string()))?;
    socket.set_nodelay(true).map_err(|e| connect_err(e.to_string()))?;
    socket
        .set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))
        .map_err(|e| connect_err(e.to_string()))?;
    if let Err(e) = socket.set_recv_buffer_size(config.socket_buffer_bytes) {
        tracing::debug!("SO_RCVBUF {} rejected: {}", config.socket_buffer_bytes, e);
    }
    if let Err(e) = socket.set_send_buffer_size(config.socket_buffer_bytes) {
        tracing::debug!("SO_SNDBUF {} rejected: {}", config.socket_buffer_bytes, e);
    }

    socket
        .connect_timeout(
            &SockAddr::from(addr),
            Duration::from_millis(config.connect_timeout_ms),
        )
        .map_err(|e| connect_err(e.to_string()))?;

    let read_timeout = (config.read_timeout_ms > 0).then(|| Duration::from_millis(config.read_timeout_ms));
    socket
        .set_read_timeout(read_timeout)
        .map_err(|e| connect_err(e.to_string()))?;

    Ok(socket.into())
}

/// State shared with the reader thread
struct ReaderShared {
    alive: AtomicBool,
    failure: Mutex<Option<SessionError>>,
}

/// Blocking reader: header then body into pooled frames, pushed into the queue
fn read_loop(mut stream: TcpStream, queue: Arc<JitterQueue>, shared: Arc<ReaderShared>) {
    let mut header = [0u8; 8];
    let result = (|| -> std::io::Result<()> {
        while shared.alive.load(Ordering::SeqCst) {
            stream.read_exact(&mut header)?;
            let mut frame = queue.pool().acquire();
            if let Err(e) = stream.read_exact(frame.data_mut()) {
                queue.recycle(frame);
                return Err(e);
            }
            frame.remote_sample_count = u64::from_le_bytes(header);
            queue.push(frame);
        }
        Ok(())
    })();

    if let Err(e) = result {
        if shared.alive.load(Ordering::SeqCst) {
            *shared.failure.lock() = Some(SessionError::ReadFailed(e.to_string()));
        }
    }
}

/// Releases everything a session holds on every exit path
struct Teardown {
    stream: TcpStream,
    shared: Arc<ReaderShared>,
    reader: Option<JoinHandle<()>>,
    queue: Arc<JitterQueue>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if self.queue.dropped() > 0 {
            tracing::debug!("Jitter queue dropped {} frames", self.queue.dropped());
        }
        self.queue.clear();
        self.queue.pool().clear();
    }
}

/// Run one connection attempt until `running` clears (Ok) or a fatal condition (Err)
pub fn run_session(
    config: &ReceiverConfig,
    sinks: &dyn SinkFactory,
    running: &AtomicBool,
    status: &StatusPublisher,
) -> Result<PlayerStats, SessionError> {
    let stream = connect(config)?;
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| config.host.clone());
    tracing::debug!("Connected to {}", peer);

    let format = FrameFormat::CANONICAL;
    let pool = Arc::new(FramePool::new(format.frame_bytes(), config.queue_capacity * 3));
    let queue = Arc::new(JitterQueue::new(config.queue_capacity, pool));
    let shared = Arc::new(ReaderShared {
        alive: AtomicBool::new(true),
        failure: Mutex::new(None),
    });

    let reader_stream = stream
        .try_clone()
        .map_err(|e| SessionError::ReadFailed(e.to_string()))?;
    let reader = {
        let queue = queue.clone();
        let shared = shared.clone();
        thread::Builder::new()
            .name("pcm-reader".into())
            .spawn(move || read_loop(reader_stream, queue, shared))
            .map_err(|e| SessionError::ReadFailed(e.to_string()))?
    };
    // declared before the player so the sink is released first
    let _teardown = Teardown {
        stream,
        shared: shared.clone(),
        reader: Some(reader),
        queue: queue.clone(),
    };

    let sink = sinks.open(config.output_device.as_deref(), config.target_ms)?;
    let mut player = Player::new(sink, queue, config);

    let reader_failed = || shared.failure.lock().take();

    let prefilled = player.prefill(running)?;
    if let Some(e) = reader_failed() {
        return Err(e);
    }
    status.publish(StatusKind::Connected, Some(format!("{} ({} frames prefilled)", peer, prefilled)));

    while running.load(Ordering::SeqCst) {
        if let Some(e) = reader_failed() {
            return Err(e);
        }
        player.step()?;
    }

    let stats = player.stats();
    tracing::info!(
        "Session ended: {} played, {} concealed, {} speed changes",
        stats.frames_played,
        stats.frames_concealed,
        stats.speed_changes
    );
    Ok(stats)
}
