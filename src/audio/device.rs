//! Audio device lookup
//!
//! Device ids are `input:<name>` or `output:<name>`. Capturing from an output device
//! opens it in loopback mode on hosts that support it (WASAPI).

use cpal::traits::{DeviceTrait, HostTrait};
use crate::error::AudioError;

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device, is_input: bool, is_output: bool) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
            is_input,
            is_output,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Native format to capture with: the mix format for output devices (loopback),
    /// the default input format otherwise
    pub fn capture_config(&self) -> Result<cpal::SupportedStreamConfig, AudioError> {
        let config = if self.is_output {
            self.inner.default_output_config()
        } else {
            self.inner.default_input_config()
        };
        config.map_err(|e| AudioError::DeviceNotFound(format!("{}: {}", self.name, e)))
    }
}

/// Get a device by its ID
pub fn get_device_by_id(id: &str) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let (is_input, name) = if let Some(name) = id.strip_prefix("input:") {
        (true, name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (false, name)
    } else {
        // bare names refer to outputs, the usual loopback target
        (false, id)
    };

    let devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    };
    let devices = devices.map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name == name {
                return Ok(AudioDevice::from_cpal(device, is_input, !is_input));
            }
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Get default output device
pub fn get_default_output_device() -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    host.default_output_device()
        .map(|d| AudioDevice::from_cpal(d, false, true))
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

/// Resolve an optional device id, falling back to the default output
pub fn resolve_output_device(id: Option<&str>) -> Result<AudioDevice, AudioError> {
    match id {
        Some(id) => get_device_by_id(id),
        None => get_default_output_device(),
    }
}
