//! Raw PCM over TCP
//!
//! Each frame on the wire is an 8-byte little-endian counter (per-channel samples emitted
//! before this frame) followed by 10 ms of interleaved s16le stereo. No handshake.

use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::constants::{PCM_FRAME_MS, PCM_RING_MS};
use crate::error::{NetworkError, Result};
use crate::pipeline::{Admission, AudioPipeline, CaptureSession, StreamTicket, Transport};

/// Size of the sample counter in front of every frame
pub const PCM_HEADER_BYTES: usize = 8;

/// Append one wire frame to `out`
pub fn encode_pcm_frame(out: &mut BytesMut, position: u64, pcm: &[i16]) {
    out.reserve(PCM_HEADER_BYTES + pcm.len() * 2);
    out.put_u64_le(position);
    for &sample in pcm {
        out.put_i16_le(sample);
    }
}

#[derive(Debug, Clone, Default)]
pub struct PcmStreamStats {
    pub frames: u64,
    pub bytes_sent: u64,
}

/// Write paced PCM frames until the peer goes away or shutdown is signalled
pub async fn stream_pcm<W>(
    mut session: CaptureSession,
    ticket: StreamTicket,
    mut writer: W,
    shutdown: watch::Receiver<bool>,
) -> Result<PcmStreamStats>
where
    W: AsyncWrite + Unpin,
{
    let mut stats = PcmStreamStats::default();
    let mut frame = BytesMut::with_capacity(PCM_HEADER_BYTES + session.frame_size() * 4);

    let outcome: Result<()> = async {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let (position, pcm) = session.next_frame().await;
            frame.clear();
            encode_pcm_frame(&mut frame, position, pcm);
            writer
                .write_all(&frame)
                .await
                .map_err(|_| NetworkError::ClientGone)?;
            stats.frames += 1;
            stats.bytes_sent += frame.len() as u64;

            session.wait_next().await;
        }
    }
    .await;

    tracing::info!(
        "PCM stream ended: {} frames, {} bytes, {} padded, {} ring overflows",
        stats.frames,
        stats.bytes_sent,
        session.padded_frames(),
        session.ring_overflows()
    );
    drop(ticket);

    match outcome {
        Ok(()) | Err(crate::Error::Network(NetworkError::ClientGone)) => Ok(stats),
        Err(e) => Err(e),
    }
}

/// TCP listener for raw PCM clients
pub struct PcmServer {
    pipeline: Arc<AudioPipeline>,
}

impl PcmServer {
    pub fn new(pipeline: Arc<AudioPipeline>) -> Self {
        Self { pipeline }
    }

    /// Bind from the current config and accept until shutdown
    pub async fn run(self) -> Result<()> {
        let config = self.pipeline.config().snapshot();
        let addr = format!("{}:{}", config.bind_address, config.pcm_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        tracing::info!("PCM server listening on tcp://{}", listener.local_addr()?);
        let mut shutdown = self.pipeline.shutdown_signal();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.handle(socket, peer),
                    Err(e) => tracing::warn!("PCM accept failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("PCM server stopped");
        Ok(())
    }

    fn handle(&self, socket: TcpStream, peer: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("TCP_NODELAY on {} failed: {}", peer, e);
        }

        let ticket = match self.pipeline.admit(Transport::Pcm) {
            Admission::Accepted(ticket) => ticket,
            Admission::Busy => {
                tracing::info!("Closing PCM client {}: busy", peer);
                drop(socket);
                return;
            }
        };

        tracing::info!("PCM client connected: {}", peer);
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let shutdown = pipeline.shutdown_signal();
            let opened = tokio::task::spawn_blocking(move || {
                let session = pipeline.open_capture(&ticket, PCM_FRAME_MS, PCM_RING_MS);
                (ticket, session)
            })
            .await;

            match opened {
                Ok((ticket, Ok(session))) => {
                    if let Err(e) = stream_pcm(session, ticket, socket, shutdown).await {
                        tracing::warn!("PCM stream to {} failed: {}", peer, e);
                    }
                }
                Ok((_, Err(e))) => tracing::warn!("Capture unavailable for {}: {}", peer, e),
                Err(e) => tracing::error!("Capture setup task failed: {}", e),
            }
            tracing::info!("PCM client disconnected: {}", peer);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, SharedConfig};
    use crate::pipeline::session::tests::ToneFactory;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    const FRAME_BYTES: usize = PCM_HEADER_BYTES + 480 * 2 * 2;

    async fn start_server(single_client: bool) -> (Arc<AudioPipeline>, SocketAddr) {
        let pipeline = AudioPipeline::new(
            SharedConfig::new(ServerConfig {
                single_client,
                ..Default::default()
            }),
            Arc::new(ToneFactory::default()),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(PcmServer::new(pipeline.clone()).serve(listener));
        (pipeline, addr)
    }

    async fn read_frame(stream: &mut TcpStream) -> (u64, Vec<u8>) {
        let mut buf = vec![0u8; FRAME_BYTES];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let counter = u64::from_le_bytes(buf[..8].try_into().unwrap());
        (counter, buf.split_off(8))
    }

    #[test]
    fn test_frame_layout() {
        let mut out = BytesMut::new();
        encode_pcm_frame(&mut out, 0x0102, &[1, -1, 0x1234, -2]);
        assert_eq!(
            &out[..],
            &[0x02, 0x01, 0, 0, 0, 0, 0, 0, 0x01, 0x00, 0xFF, 0xFF, 0x34, 0x12, 0xFE, 0xFF]
        );
    }

    #[tokio::test]
    async fn test_counters_advance_per_frame() {
        let (_pipeline, addr) = start_server(true).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut expected = 0;
        for _ in 0..5 {
            let (counter, body) = read_frame(&mut stream).await;
            assert_eq!(counter, expected);
            assert_eq!(body.len(), 1920);
            expected += 480;
        }
    }

    #[tokio::test]
    async fn test_second_client_closed_while_busy() {
        let (pipeline, addr) = start_server(true).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        read_frame(&mut first).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        drop(first);
        for _ in 0..100 {
            if !pipeline.gate().is_held() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!pipeline.gate().is_held());

        let mut third = TcpStream::connect(addr).await.unwrap();
        let (counter, _) = read_frame(&mut third).await;
        assert_eq!(counter, 0);
    }

    #[tokio::test]
    async fn test_multiple_clients_when_gate_disabled() {
        let (_pipeline, addr) = start_server(false).await;
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_frame(&mut a).await.0, 0);
        assert_eq!(read_frame(&mut b).await.0, 0);
    }
}
