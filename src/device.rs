//! # Compute Device Selection
//!
//! Picks the candle device the benchmarks run on. Real-time factors are only
//! comparable between runs on the same device, so an explicitly requested
//! accelerator that cannot be opened is an error rather than a silent switch
//! to CPU. Only `auto` falls back.
//!
//! ## Accepted Values (config, `ASRQ_MODEL__DEVICE`, `--device`):
//! - `cpu`
//! - `cuda` or `cuda:<ordinal>` (`gpu` is an alias for `cuda:0`)
//! - `metal` or `metal:<ordinal>`
//! - `auto`: first CUDA GPU, then first Metal GPU, then CPU

use crate::error::{HarnessError, HarnessResult};
use candle_core::{Device, DeviceLocation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Device picked by `auto`, probed once per process.
static AUTO_DEVICE: OnceLock<Device> = OnceLock::new();

/// Requested compute device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DevicePreference {
    Auto,
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DevicePreference {
    /// Open the requested device.
    pub fn resolve(self) -> HarnessResult<Device> {
        let device = match self {
            DevicePreference::Auto => AUTO_DEVICE.get_or_init(detect_accelerator).clone(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal)
                .map_err(|e| HarnessError::ConfigError(format!("CUDA device {} unavailable: {}", ordinal, e)))?,
            DevicePreference::Metal(ordinal) => Device::new_metal(ordinal)
                .map_err(|e| HarnessError::ConfigError(format!("Metal device {} unavailable: {}", ordinal, e)))?,
        };
        debug!("Device preference {} resolved to {}", self, describe_device(&device));
        Ok(device)
    }
}

fn detect_accelerator() -> Device {
    match Device::new_cuda(0) {
        Ok(device) => {
            info!("auto: using CUDA GPU 0");
            return device;
        }
        Err(e) => debug!("auto: no CUDA device ({})", e),
    }
    match Device::new_metal(0) {
        Ok(device) => {
            info!("auto: using Metal GPU 0");
            return device;
        }
        Err(e) => debug!("auto: no Metal device ({})", e),
    }
    info!("auto: no GPU found, using CPU");
    Device::Cpu
}

/// Short device label for logs and report headers.
pub fn describe_device(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{}", gpu_id),
        DeviceLocation::Metal { gpu_id } => format!("metal:{}", gpu_id),
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Auto => write!(f, "auto"),
            DevicePreference::Cpu => write!(f, "cpu"),
            DevicePreference::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DevicePreference::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let (backend, ordinal) = match lowered.split_once(':') {
            Some((backend, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid device ordinal in '{}'", s))?;
                (backend, Some(ordinal))
            }
            None => (lowered.as_str(), None),
        };
        match (backend, ordinal) {
            ("auto", None) => Ok(DevicePreference::Auto),
            ("cpu", None) => Ok(DevicePreference::Cpu),
            ("cuda" | "gpu", ordinal) => Ok(DevicePreference::Cuda(ordinal.unwrap_or(0))),
            ("metal", ordinal) => Ok(DevicePreference::Metal(ordinal.unwrap_or(0))),
            _ => Err(format!("Unknown device '{}': expected auto, cpu, cuda[:N] or metal[:N]", s)),
        }
    }
}

impl TryFrom<String> for DevicePreference {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DevicePreference> for String {
    fn from(preference: DevicePreference) -> Self {
        preference.to_string()
    }
}
