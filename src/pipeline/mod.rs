//! Stream admission and capture sessions shared by the HTTP and PCM transports
//!
//! Every accepted stream goes through [`AudioPipeline::admit`]: it takes a config snapshot
//! and, when single-client mode is on, the gate. The returned [`StreamTicket`] keeps both
//! for the lifetime of the stream.

pub mod gate;
pub mod session;

pub use gate::{ClientGate, GateGuard, Transport};
pub use session::CaptureSession;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::audio::source::SourceFactory;
use crate::config::{ConfigSnapshot, SharedConfig};
use crate::error::AudioError;

/// Outcome of an admission attempt
pub enum Admission {
    Accepted(StreamTicket),
    /// Another stream holds the single-client gate
    Busy,
}

/// Proof of admission; dropping it releases the gate and the active-stream slot
pub struct StreamTicket {
    pub snapshot: ConfigSnapshot,
    pub transport: Transport,
    _gate: Option<GateGuard>,
    _active: ActiveStream,
}

struct ActiveStream {
    pipeline: Arc<PipelineState>,
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        let mut last = self.pipeline.last_transport.lock();
        if self.pipeline.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            *last = None;
        }
    }
}

#[derive(Default)]
struct PipelineState {
    active: AtomicUsize,
    last_transport: Mutex<Option<Transport>>,
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub streaming: bool,
    pub active_streams: usize,
    pub transport: Option<Transport>,
    pub single_client: bool,
    pub uptime_seconds: u64,
}

/// Shared coordinator for all transports
pub struct AudioPipeline {
    config: SharedConfig,
    gate: Arc<ClientGate>,
    sources: Arc<dyn SourceFactory>,
    state: Arc<PipelineState>,
    started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl AudioPipeline {
    pub fn new(config: SharedConfig, sources: Arc<dyn SourceFactory>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            gate: ClientGate::new(),
            sources,
            state: Arc::new(PipelineState::default()),
            started_at: Instant::now(),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<ClientGate> {
        &self.gate
    }

    /// Admit a new stream on `transport`
    ///
    /// The snapshot is taken first so the gate decision and the stream both see the same
    /// `single_client` value.
    pub fn admit(&self, transport: Transport) -> Admission {
        let snapshot = self.config.snapshot();
        let guard = if snapshot.single_client {
            match self.gate.try_acquire(transport) {
                Some(guard) => Some(guard),
                None => {
                    tracing::info!(
                        "Rejecting {:?} client: {:?} stream already active",
                        transport,
                        self.gate.holder()
                    );
                    return Admission::Busy;
                }
            }
        } else {
            None
        };

        {
            // most recently admitted transport
            let mut last = self.state.last_transport.lock();
            self.state.active.fetch_add(1, Ordering::SeqCst);
            *last = Some(transport);
        }

        Admission::Accepted(StreamTicket {
            snapshot,
            transport,
            _gate: guard,
            _active: ActiveStream {
                pipeline: self.state.clone(),
            },
        })
    }

    /// Open the capture device for an admitted stream
    ///
    /// Device setup may block, so callers on the runtime should wrap this in
    /// `spawn_blocking`.
    pub fn open_capture(
        &self,
        ticket: &StreamTicket,
        frame_ms: u32,
        ring_ms: u32,
    ) -> Result<CaptureSession, AudioError> {
        CaptureSession::open(self.sources.as_ref(), &ticket.snapshot, frame_ms, ring_ms)
    }

    pub fn status(&self) -> PipelineStatus {
        let active = self.state.active.load(Ordering::SeqCst);
        PipelineStatus {
            streaming: active > 0,
            active_streams: active,
            transport: *self.state.last_transport.lock(),
            single_client: self.config.snapshot().single_client,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Signal every running stream to wind down
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Receiver that flips to `true` on shutdown
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
