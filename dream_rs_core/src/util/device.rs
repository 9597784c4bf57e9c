use std::fmt::Display;

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Which compute device models are activated on.
#[derive(Clone, Copy, Default, Debug, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
pub enum DevicePreference {
    /// CUDA if available, then Metal, then CPU.
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "cuda")]
    Cuda,
    #[serde(rename = "metal")]
    Metal,
}

impl Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
        }
    }
}

pub fn choose_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Auto => {
            let device = Device::cuda_if_available(0)?;
            if device.is_cpu() {
                Device::metal_if_available(0)?
            } else {
                device
            }
        }
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0)?,
        DevicePreference::Metal => Device::new_metal(0)?,
    };
    info!("using device: {}", device_name(&device));
    Ok(device)
}

pub fn device_name(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}
