//! cpal-backed playback sink
//!
//! Writes land in a bounded interleaved queue drained by the output callback. The callback
//! walks the queue at `speed` source frames per output frame with linear interpolation, and
//! counts every source frame it consumes; that count is the sink's played position.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::FrameFormat;
use crate::audio::device::resolve_output_device;
use crate::audio::source::{SampleSink, SinkFactory};
use crate::constants::{CHANNELS, SAMPLE_RATE};
use crate::error::AudioError;

const MIN_SPEED: f32 = 0.5;
const MAX_SPEED: f32 = 2.0;
/// A full queue that the device stops draining for this long fails the write
const STALL_TIMEOUT: Duration = Duration::from_millis(500);

struct PlaybackShared {
    queue: Mutex<VecDeque<i16>>,
    space: Condvar,
    /// Queue bound in samples
    capacity: usize,
    played: AtomicU64,
    speed_bits: AtomicU32,
    running: AtomicBool,
    /// Set by the stream error callback
    failed: AtomicBool,
}

impl PlaybackShared {
    fn speed(&self) -> f64 {
        f32::from_bits(self.speed_bits.load(Ordering::Relaxed)) as f64
    }
}

/// Interpolating reader over the shared queue, owned by the output callback
struct Cursor {
    pos: f64,
    cur: [f32; 2],
    next: [f32; 2],
}

impl Cursor {
    fn render(&mut self, shared: &PlaybackShared, out: &mut [f32]) {
        let speed = shared.speed();
        let mut queue = shared.queue.lock();
        let mut consumed = 0u64;

        for frame in out.chunks_exact_mut(CHANNELS as usize) {
            let t = self.pos as f32;
            frame[0] = self.cur[0] + (self.next[0] - self.cur[0]) * t;
            frame[1] = self.cur[1] + (self.next[1] - self.cur[1]) * t;

            self.pos += speed;
            while self.pos >= 1.0 {
                self.pos -= 1.0;
                self.cur = self.next;
                self.next = if queue.len() >= 2 {
                    consumed += 1;
                    let l = queue.pop_front().unwrap_or(0);
                    let r = queue.pop_front().unwrap_or(0);
                    [l as f32 / 32768.0, r as f32 / 32768.0]
                } else {
                    [0.0, 0.0]
                };
            }
        }

        drop(queue);
        shared.played.fetch_add(consumed, Ordering::Relaxed);
        shared.space.notify_all();
    }
}

/// Output sink on a cpal device
pub struct CpalSink {
    device_id: Option<String>,
    shared: Arc<PlaybackShared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// `target_ms` sizes the device-side queue; never below two frames
    pub fn new(device_id: Option<&str>, target_ms: u32) -> Self {
        let format = FrameFormat::CANONICAL;
        let frame_samples = format.samples_per_frame() * format.channels as usize;
        let target_samples = SAMPLE_RATE as usize * target_ms as usize / 1000 * CHANNELS as usize;

        Self {
            device_id: device_id.map(str::to_string),
            shared: Arc::new(PlaybackShared {
                queue: Mutex::new(VecDeque::with_capacity(target_samples.max(frame_samples * 2))),
                space: Condvar::new(),
                capacity: target_samples.max(frame_samples * 2),
                played: AtomicU64::new(0),
                speed_bits: AtomicU32::new(1.0f32.to_bits()),
                running: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
            thread_handle: None,
        }
    }
}

impl SampleSink for CpalSink {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let shared = self.shared.clone();
        let device_id = self.device_id.clone();
        shared.failed.store(false, Ordering::SeqCst);
        shared.running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("pcm-playback".into())
            .spawn(move || {
                let device = match resolve_output_device(device_id.as_deref()) {
                    Ok(device) => device.into_inner(),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let config = StreamConfig {
                    channels: CHANNELS,
                    sample_rate: cpal::SampleRate(SAMPLE_RATE),
                    buffer_size: cpal::BufferSize::Default,
                };

                let mut cursor = Cursor {
                    pos: 0.0,
                    cur: [0.0; 2],
                    next: [0.0; 2],
                };
                let callback_shared = shared.clone();
                let error_shared = shared.clone();
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        cursor.render(&callback_shared, data);
                    },
                    move |err| {
                        tracing::warn!("Playback stream error: {}", err);
                        error_shared.failed.store(true, Ordering::SeqCst);
                        error_shared.space.notify_all();
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while shared.running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(AudioError::StreamError("playback thread did not start".into()))
            }
        }
    }

    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        let shared = &self.shared;
        let mut queue = shared.queue.lock();
        let mut last_played = shared.played.load(Ordering::Relaxed);
        let mut last_progress = Instant::now();

        for bytes in pcm.chunks_exact(2) {
            while queue.len() >= shared.capacity {
                if !shared.running.load(Ordering::Relaxed) {
                    return Err(AudioError::SinkStopped);
                }
                if shared.failed.load(Ordering::Relaxed) {
                    return Err(AudioError::WriteFailed("output stream failed".into()));
                }
                shared.space.wait_for(&mut queue, Duration::from_millis(50));

                let played = shared.played.load(Ordering::Relaxed);
                if played != last_played {
                    last_played = played;
                    last_progress = Instant::now();
                } else if last_progress.elapsed() >= STALL_TIMEOUT {
                    return Err(AudioError::WriteFailed(format!(
                        "output stalled for {} ms",
                        last_progress.elapsed().as_millis()
                    )));
                }
            }
            queue.push_back(i16::from_le_bytes([bytes[0], bytes[1]]));
        }
        Ok(())
    }

    fn played_samples(&self) -> u64 {
        self.shared.played.load(Ordering::Relaxed)
    }

    fn set_speed(&mut self, speed: f32) -> Result<(), AudioError> {
        let speed = speed.clamp(MIN_SPEED, MAX_SPEED);
        self.shared.speed_bits.store(speed.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.space.notify_all();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.shared.queue.lock().clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens a [`CpalSink`] per session
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSinkFactory;

impl SinkFactory for CpalSinkFactory {
    fn open(&self, device_id: Option<&str>, target_ms: u32) -> Result<Box<dyn SampleSink>, AudioError> {
        Ok(Box::new(CpalSink::new(device_id, target_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(samples: &[i16], speed: f32) -> PlaybackShared {
        PlaybackShared {
            queue: Mutex::new(samples.iter().copied().collect()),
            space: Condvar::new(),
            capacity: 1024,
            played: AtomicU64::new(0),
            speed_bits: AtomicU32::new(speed.to_bits()),
            running: AtomicBool::new(true),
            failed: AtomicBool::new(false),
        }
    }

    /// A sink that looks started but has no device draining it
    fn undrained_sink() -> CpalSink {
        let sink = CpalSink::new(None, 20);
        sink.shared.running.store(true, Ordering::SeqCst);
        sink
    }

    #[test]
    fn test_render_counts_consumed_frames() {
        let samples: Vec<i16> = (0..40).map(|i| i * 100).collect();
        let shared = shared(&samples, 1.0);
        let mut cursor = Cursor { pos: 0.0, cur: [0.0; 2], next: [0.0; 2] };
        let mut out = vec![0.0f32; 20];
        cursor.render(&shared, &mut out);
        assert_eq!(shared.played.load(Ordering::Relaxed), 10);
        assert_eq!(shared.queue.lock().len(), 20);
    }

    #[test]
    fn test_faster_speed_consumes_more() {
        let samples = vec![1000i16; 400];
        let shared = shared(&samples, 1.5);
        let mut cursor = Cursor { pos: 0.0, cur: [0.0; 2], next: [0.0; 2] };
        let mut out = vec![0.0f32; 200];
        cursor.render(&shared, &mut out);
        assert_eq!(shared.played.load(Ordering::Relaxed), 150);
    }

    #[test]
    fn test_starved_queue_renders_silence() {
        let shared = shared(&[], 1.0);
        let mut cursor = Cursor { pos: 0.0, cur: [0.0; 2], next: [0.0; 2] };
        let mut out = vec![1.0f32; 8];
        cursor.render(&shared, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(shared.played.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_write_fails_when_output_stalls() {
        let mut sink = undrained_sink();
        let frame = vec![0u8; 1920];
        let started = Instant::now();

        let mut result = Ok(());
        for _ in 0..10 {
            result = sink.write(&frame);
            if result.is_err() {
                break;
            }
        }

        assert!(matches!(result, Err(AudioError::WriteFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_write_fails_after_stream_error() {
        let mut sink = undrained_sink();
        let frame = vec![0u8; 1920];
        // fills the two-frame queue
        for _ in 0..2 {
            sink.write(&frame).unwrap();
        }
        sink.shared.failed.store(true, Ordering::SeqCst);

        let started = Instant::now();
        assert!(matches!(sink.write(&frame), Err(AudioError::WriteFailed(_))));
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn test_write_proceeds_while_drained() {
        let mut sink = undrained_sink();
        let shared = sink.shared.clone();
        let drainer = thread::spawn(move || {
            let mut cursor = Cursor { pos: 0.0, cur: [0.0; 2], next: [0.0; 2] };
            let mut out = vec![0.0f32; 960];
            while shared.running.load(Ordering::SeqCst) {
                cursor.render(&shared, &mut out);
                thread::sleep(Duration::from_millis(5));
            }
        });

        let frame = vec![0u8; 1920];
        for _ in 0..20 {
            sink.write(&frame).unwrap();
        }
        assert!(sink.played_samples() > 0);

        sink.stop();
        drainer.join().unwrap();
    }
}
