//! Loopback capture through cpal
//!
//! Each stream opens its own capture. The cpal stream lives on a dedicated thread for as
//! long as the capture runs, since streams are not `Send` on every host.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::resolve_output_device;
use crate::audio::source::{SampleCallback, SampleSource, SourceFactory, SourceFormat};
use crate::error::AudioError;

/// Capture of one device's output mix (or an input device)
pub struct CpalLoopbackSource {
    device_id: Option<String>,
    format: SourceFormat,
    sample_format: SampleFormat,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalLoopbackSource {
    pub fn open(device_id: Option<&str>) -> Result<Self, AudioError> {
        let device = resolve_output_device(device_id)?;
        let supported = device.capture_config()?;
        let config = supported.config();
        let format = SourceFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };

        if format.sample_rate != crate::constants::SAMPLE_RATE || format.channels != 2 {
            tracing::info!(
                "Mix format: {} Hz, {} ch. Resampling/channel adjust will be applied.",
                format.sample_rate,
                format.channels
            );
        }

        Ok(Self {
            device_id: device_id.map(str::to_string),
            format,
            sample_format: supported.sample_format(),
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        })
    }
}

impl SampleSource for CpalLoopbackSource {
    fn format(&self) -> SourceFormat {
        self.format
    }

    fn start(&mut self, mut callback: SampleCallback) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        let device_id = self.device_id.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("loopback-capture".into())
            .spawn(move || {
                let device = match resolve_output_device(device_id.as_deref()) {
                    Ok(device) => device.into_inner(),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let on_error = |err: cpal::StreamError| {
                    tracing::warn!("Capture stream error: {}", err);
                };

                let stream = match sample_format {
                    SampleFormat::F32 => device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| callback(data),
                        on_error,
                        None,
                    ),
                    SampleFormat::I16 => {
                        let mut scratch = Vec::new();
                        device.build_input_stream(
                            &config,
                            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                                scratch.clear();
                                scratch.extend(data.iter().map(|&s| s as f32 / 32768.0));
                                callback(&scratch);
                            },
                            on_error,
                            None,
                        )
                    }
                    other => {
                        let _ = ready_tx.send(Err(AudioError::UnsupportedFormat(format!("{:?}", other))));
                        return;
                    }
                };

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

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
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
                Err(AudioError::StreamError("capture thread did not start".into()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalLoopbackSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens [`CpalLoopbackSource`]s on demand
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSourceFactory;

impl SourceFactory for CpalSourceFactory {
    fn open(&self, device_id: Option<&str>) -> Result<Box<dyn SampleSource>, AudioError> {
        Ok(Box::new(CpalLoopbackSource::open(device_id)?))
    }
}
