//! Reconnect loop around receiver sessions

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::source::SinkFactory;
use crate::config::ReceiverConfig;
use crate::error::{Error, Result};
use crate::receiver::session::run_session;
use crate::receiver::status::{StatusKind, StatusPublisher};

/// Keeps a PCM session alive until stopped
///
/// Each failed attempt publishes `Disconnected`, waits the backoff and reconnects.
/// [`PcmReceiver::stop`] interrupts the backoff immediately and ends with `Stopped`.
pub struct PcmReceiver {
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PcmReceiver {
    pub fn start(
        config: ReceiverConfig,
        sinks: Arc<dyn SinkFactory>,
        status: StatusPublisher,
    ) -> Result<Self> {
        config.validate()?;
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker_running = running.clone();
        let handle = thread::Builder::new()
            .name("pcm-receiver".into())
            .spawn(move || {
                let target = format!("{}:{}", config.host, config.port);
                let mut attempts = 0u64;
                while worker_running.load(Ordering::SeqCst) {
                    attempts += 1;
                    status.publish(StatusKind::Connecting, Some(target.clone()));

                    match run_session(&config, sinks.as_ref(), &worker_running, &status) {
                        Ok(_) => break,
                        Err(e) => {
                            tracing::debug!("Attempt {} to {} failed", attempts, target);
                            status.publish(StatusKind::Disconnected, Some(e.to_string()));
                        }
                    }

                    match stop_rx.recv_timeout(config.backoff()) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                status.publish(StatusKind::Stopped, None);
            })
            .map_err(Error::Io)?;

        Ok(Self {
            running,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop and wait for the worker; idempotent
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PcmReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}
