//! Buffers on both sides of the link
//!
//! - [`SampleRing`]: capture callback -> pacer, interleaved f32 at the canonical rate
//! - [`FramePool`] / [`JitterQueue`]: receiver reader thread -> playback thread
//!
//! The receiver structures are shared by exactly two threads and never block the reader:
//! a full queue evicts its oldest frame instead.

use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{BYTES_PER_SAMPLE, CHANNELS, SAMPLE_RATE};

/// Bounded interleaved sample ring fed by the capture callback
///
/// On overflow the oldest samples are discarded so latency stays bounded.
pub struct SampleRing {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
    channels: usize,
    overflow_count: AtomicU64,
}

impl SampleRing {
    /// Ring holding `duration_ms` of canonical stereo audio
    pub fn with_duration_ms(duration_ms: u32) -> Self {
        let capacity = (SAMPLE_RATE as usize * duration_ms as usize / 1000) * CHANNELS as usize;
        Self::new(capacity, CHANNELS as usize)
    }

    pub fn new(capacity: usize, channels: usize) -> Self {
        let capacity = capacity.max(channels) / channels * channels;
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            channels,
            overflow_count: AtomicU64::new(0),
        }
    }

    /// Append interleaved samples; whole frames only
    pub fn push(&self, data: &[f32]) {
        let data = &data[..data.len() / self.channels * self.channels];
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let mut samples = self.samples.lock();
        let overflow = (samples.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            samples.drain(..overflow);
            self.overflow_count.fetch_add(overflow as u64, Ordering::Relaxed);
        }
        samples.extend(data.iter().copied());
    }

    /// Read up to `dst.len()` samples, rounded down to whole frames
    pub fn read(&self, dst: &mut [f32]) -> usize {
        let want = dst.len() / self.channels * self.channels;
        let mut samples = self.samples.lock();
        let n = want.min(samples.len());
        for (slot, sample) in dst[..n].iter_mut().zip(samples.drain(..n)) {
            *slot = sample;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples discarded because the consumer fell behind
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Layout of one receiver frame (10 ms of PCM)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: usize,
}

impl FrameFormat {
    pub const CANONICAL: FrameFormat = FrameFormat {
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS,
        bytes_per_sample: BYTES_PER_SAMPLE,
    };

    /// Per-channel samples in one frame
    pub fn samples_per_frame(&self) -> usize {
        self.sample_rate as usize / 100
    }

    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * self.channels as usize * self.bytes_per_sample
    }
}

/// One received PCM frame
#[derive(Debug)]
pub struct Frame {
    data: Box<[u8]>,
    /// Sender's sample counter at the start of this frame
    pub remote_sample_count: u64,
}

impl Frame {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            data: vec![0u8; frame_bytes].into_boxed_slice(),
            remote_sample_count: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lock-free free-list of frame buffers
pub struct FramePool {
    free: ArrayQueue<Frame>,
    frame_bytes: usize,
    allocated: AtomicU64,
}

impl FramePool {
    pub fn new(frame_bytes: usize, max_free: usize) -> Self {
        Self {
            free: ArrayQueue::new(max_free.max(1)),
            frame_bytes,
            allocated: AtomicU64::new(0),
        }
    }

    /// Take a pooled frame, allocating only when the pool is empty
    pub fn acquire(&self) -> Frame {
        match self.free.pop() {
            Some(mut frame) => {
                frame.remote_sample_count = 0;
                frame
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Frame::new(self.frame_bytes)
            }
        }
    }

    /// Return a frame; wrong-sized frames and frames beyond the pool bound are dropped
    pub fn release(&self, frame: Frame) {
        if frame.len() != self.frame_bytes {
            return;
        }
        let _ = self.free.push(frame);
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Frames allocated over the pool's lifetime
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        while self.free.pop().is_some() {}
    }
}

/// Bounded FIFO between the socket reader and the player
///
/// Overflow drops the oldest frame (recycled into the pool) to admit the newest.
pub struct JitterQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    pool: Arc<FramePool>,
    capacity: usize,
    dropped: AtomicU64,
}

impl JitterQueue {
    pub fn new(capacity: usize, pool: Arc<FramePool>) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            pool,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a frame, evicting the oldest one when full
    pub fn push(&self, frame: Frame) {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    frame = rejected;
                    if let Ok(oldest) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.pool.release(oldest);
                    }
                }
                Err(TrySendError::Disconnected(rejected)) => {
                    self.pool.release(rejected);
                    return;
                }
            }
        }
    }

    /// Pop the oldest frame, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn recycle(&self, frame: Frame) {
        self.pool.release(frame);
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted on overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain everything back into the pool
    pub fn clear(&self) {
        while let Ok(frame) = self.rx.try_recv() {
            self.pool.release(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame_with(pool: &FramePool, count: u64) -> Frame {
        let mut frame = pool.acquire();
        frame.remote_sample_count = count;
        frame
    }

    #[test]
    fn test_canonical_frame_size() {
        let format = FrameFormat::CANONICAL;
        assert_eq!(format.samples_per_frame(), 480);
        assert_eq!(format.frame_bytes(), 1920);
    }

    #[test]
    fn test_sample_ring_drops_oldest() {
        let ring = SampleRing::new(8, 2);
        ring.push(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        ring.push(&[4.0, 4.0, 5.0, 5.0]);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.overflow_count(), 2);

        let mut out = [0.0f32; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(out, [2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 5.0, 5.0]);
    }

    #[test]
    fn test_sample_ring_whole_frames() {
        let ring = SampleRing::new(16, 2);
        ring.push(&[0.1, 0.2, 0.3]);
        assert_eq!(ring.len(), 2);

        let mut out = [0.0f32; 3];
        assert_eq!(ring.read(&mut out), 2);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_pool_reuses_frames() {
        let pool = FramePool::new(1920, 4);
        let frame = pool.acquire();
        assert_eq!(pool.allocated(), 1);
        pool.release(frame);
        let _frame = pool.acquire();
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_pool_rejects_wrong_size() {
        let pool = FramePool::new(1920, 4);
        pool.release(Frame::new(100));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = FramePool::new(16, 2);
        for _ in 0..5 {
            pool.release(Frame::new(16));
        }
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_queue_fifo() {
        let pool = Arc::new(FramePool::new(16, 8));
        let queue = JitterQueue::new(4, pool.clone());
        queue.push(frame_with(&pool, 0));
        queue.push(frame_with(&pool, 480));

        let first = queue.pop_timeout(Duration::from_millis(1)).unwrap();
        assert_eq!(first.remote_sample_count, 0);
        let second = queue.pop_timeout(Duration::from_millis(1)).unwrap();
        assert_eq!(second.remote_sample_count, 480);
        assert!(queue.pop_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_queue_overflow_recycles_oldest() {
        let pool = Arc::new(FramePool::new(16, 8));
        let queue = JitterQueue::new(2, pool.clone());
        for i in 0..3 {
            queue.push(frame_with(&pool, i));
        }
        assert_eq!(queue.dropped(), 1);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(queue.try_pop().unwrap().remote_sample_count, 1);
    }

    #[test]
    fn test_queue_clear_returns_to_pool() {
        let pool = Arc::new(FramePool::new(16, 8));
        let queue = JitterQueue::new(4, pool.clone());
        for i in 0..3 {
            queue.push(frame_with(&pool, i));
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_queue_across_threads() {
        let pool = Arc::new(FramePool::new(16, 48));
        let queue = Arc::new(JitterQueue::new(16, pool.clone()));

        let producer = {
            let queue = queue.clone();
            let pool = pool.clone();
            std::thread::spawn(move || {
                for i in 0..200u64 {
                    let mut frame = pool.acquire();
                    frame.remote_sample_count = i;
                    queue.push(frame);
                }
            })
        };

        let mut last = None;
        let mut seen = 0;
        while let Some(frame) = queue.pop_timeout(Duration::from_millis(200)) {
            if let Some(prev) = last {
                assert!(frame.remote_sample_count > prev, "frames must stay in order");
            }
            last = Some(frame.remote_sample_count);
            seen += 1;
            queue.recycle(frame);
        }
        producer.join().unwrap();
        assert_eq!(last, Some(199));
        assert_eq!(seen as u64 + queue.dropped(), 200);
    }

    proptest! {
        #[test]
        fn prop_queue_keeps_most_recent(capacity in 1usize..32, pushes in 0u64..200) {
            let pool = Arc::new(FramePool::new(8, capacity * 3));
            let queue = JitterQueue::new(capacity, pool.clone());
            for i in 0..pushes {
                queue.push(frame_with(&pool, i));
                let expected = (i + 1).min(capacity as u64) as usize;
                prop_assert_eq!(queue.len(), expected);
            }

            let mut held = Vec::new();
            while let Some(frame) = queue.try_pop() {
                held.push(frame.remote_sample_count);
            }
            let start = pushes.saturating_sub(capacity as u64);
            let expected: Vec<u64> = (start..pushes).collect();
            prop_assert_eq!(held, expected);
        }
    }
}
