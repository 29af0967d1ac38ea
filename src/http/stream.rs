//! Ogg/Opus stream loop behind `GET /stream.opus`

use bytes::Bytes;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

use crate::codec::{OggOpusMuxer, OpusEncoder};
use crate::constants::{CHANNELS, SAMPLE_RATE, VENDOR};
use crate::error::{NetworkError, Result};
use crate::pipeline::{CaptureSession, StreamTicket};

/// Counters reported when a stream ends
#[derive(Debug, Clone, Default)]
pub struct OggStreamStats {
    pub frames: u64,
    pub bytes_sent: u64,
    pub flushes: u64,
    pub padded_frames: u64,
}

/// Random stream serial for each new logical Ogg stream
pub fn stream_serial() -> u32 {
    uuid::Uuid::new_v4().as_u128() as u32
}

/// Encode paced frames and push Ogg pages into `tx` until the client leaves
///
/// Header pages go out before the first audio frame. Audio pages are coalesced and flushed
/// once per `flush_interval_ms`. A closed channel is a normal end of stream.
pub async fn stream_ogg(
    mut session: CaptureSession,
    ticket: StreamTicket,
    tx: mpsc::Sender<Bytes>,
    shutdown: watch::Receiver<bool>,
) -> Result<OggStreamStats> {
    let snapshot = ticket.snapshot.clone();
    let mut encoder = OpusEncoder::from_config(&snapshot)?;
    let mut muxer = OggOpusMuxer::new(stream_serial(), SAMPLE_RATE, CHANNELS as u8, VENDOR)?;
    let flush_interval = snapshot.flush_interval();
    let frame_size = session.frame_size() as u64;
    let mut stats = OggStreamStats::default();

    tracing::info!(
        "Ogg stream started: serial={:08x} bitrate={} frame_ms={}",
        muxer.serial(),
        snapshot.bitrate,
        snapshot.frame_ms
    );

    let headers = muxer.take();
    stats.bytes_sent += headers.len() as u64;
    if tx.send(headers).await.is_err() {
        return Ok(stats);
    }
    stats.flushes += 1;

    let mut last_flush = Instant::now();
    let outcome: Result<()> = async {
        loop {
            if *shutdown.borrow() {
                muxer.finish()?;
                let tail = muxer.take();
                stats.bytes_sent += tail.len() as u64;
                let _ = tx.send(tail).await;
                return Ok(());
            }
            if tx.is_closed() {
                return Err(NetworkError::ClientGone.into());
            }

            let (_, pcm) = session.next_frame().await;
            let packet = encoder.encode(pcm)?;
            muxer.write_packet(packet, frame_size)?;
            stats.frames += 1;

            if last_flush.elapsed() >= flush_interval && muxer.pending_len() > 0 {
                let chunk = muxer.take();
                stats.bytes_sent += chunk.len() as u64;
                tx.send(chunk).await.map_err(|_| NetworkError::ClientGone)?;
                stats.flushes += 1;
                last_flush = Instant::now();
            }

            session.wait_next().await;
        }
    }
    .await;

    stats.padded_frames = session.padded_frames();
    let encoded = encoder.stats();
    tracing::info!(
        "Ogg stream ended: {} frames, {} bytes in {} flushes, avg packet {:.1} B, {} padded, {} ring overflows",
        stats.frames,
        stats.bytes_sent,
        stats.flushes,
        encoded.average_frame_size,
        stats.padded_frames,
        session.ring_overflows()
    );

    match outcome {
        Ok(()) | Err(crate::Error::Network(NetworkError::ClientGone)) => Ok(stats),
        Err(e) => Err(e),
    }
}
