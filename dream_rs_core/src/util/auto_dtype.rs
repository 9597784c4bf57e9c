use std::fmt::Display;

use anyhow::Result;
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone, Copy, Default, Debug, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
/// Precision the weights are cast to when a model is loaded.
///
/// Note: `Auto` picks F16 on CUDA devices that handle it well and F32 everywhere else.
pub enum ModelPrecision {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

impl Display for ModelPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Type which can be converted to a DType
pub trait TryIntoDType {
    fn try_into_dtype(&self, device: &Device, silent: bool) -> Result<DType>;
}

impl TryIntoDType for DType {
    fn try_into_dtype(&self, _: &Device, silent: bool) -> Result<DType> {
        if !silent {
            info!("dtype selected is {self:?}.");
        }
        if !matches!(self, DType::BF16 | DType::F32 | DType::F16) {
            anyhow::bail!("DType must be one of BF16, F16, F32");
        }
        Ok(*self)
    }
}

#[cfg(feature = "cuda")]
fn cuda_supports_f16(silent: bool) -> bool {
    use std::process::Command;

    // These cards produce black images in half precision.
    const F32_ONLY_CARDS: [&str; 2] = ["GeForce GTX 1660", "GeForce GTX 1650"];

    let Ok(output) = Command::new("nvidia-smi")
        .arg("--query-gpu=name")
        .arg("--format=csv,noheader")
        .output()
    else {
        if !silent {
            info!("could not run `nvidia-smi`, assuming F16 support");
        }
        return true;
    };
    let names = String::from_utf8_lossy(&output.stdout);
    let supported = !names
        .lines()
        .any(|name| F32_ONLY_CARDS.iter().any(|card| name.contains(card)));
    if !supported && !silent {
        info!("skipping F16 because a GTX 1650/1660 class card was detected");
    }
    supported
}

#[cfg(not(feature = "cuda"))]
fn cuda_supports_f16(_silent: bool) -> bool {
    true
}

impl TryIntoDType for ModelPrecision {
    fn try_into_dtype(&self, device: &Device, silent: bool) -> Result<DType> {
        let dtype = match self {
            Self::Auto if device.is_cuda() && cuda_supports_f16(silent) => DType::F16,
            Self::Auto => DType::F32,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        if !silent {
            info!("dtype selected is {dtype:?}.");
        }
        Ok(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_is_f32_on_cpu() -> Result<()> {
        assert_eq!(
            ModelPrecision::Auto.try_into_dtype(&Device::Cpu, true)?,
            DType::F32
        );
        assert_eq!(
            ModelPrecision::F16.try_into_dtype(&Device::Cpu, true)?,
            DType::F16
        );
        Ok(())
    }

    #[test]
    fn rejects_integer_dtypes() {
        assert!(DType::U8.try_into_dtype(&Device::Cpu, true).is_err());
        assert!(DType::BF16.try_into_dtype(&Device::Cpu, true).is_ok());
    }
}
