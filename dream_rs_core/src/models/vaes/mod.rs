use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use tracing::{info, warn};

use super::checkpoint::{cast_floats, read_checkpoint, Submodule};

/// Replace the autoencoder weights of a checkpoint with those of a standalone VAE file.
///
/// Only tensors the checkpoint already has are replaced, keys with no counterpart are
/// ignored. A missing VAE file is not an error: the checkpoint keeps its own autoencoder.
/// Returns the number of replaced tensors.
pub(crate) fn apply_vae_override(
    tensors: &mut HashMap<String, Tensor>,
    vae: &Path,
    dtype: DType,
) -> Result<usize> {
    if !vae.exists() {
        warn!(
            "VAE file `{}` not found, keeping the checkpoint autoencoder",
            vae.display()
        );
        return Ok(0);
    }
    info!("loading VAE weights from `{}`", vae.display());

    let vae_tensors = read_checkpoint(vae)
        .with_context(|| format!("could not read VAE weights `{}`", vae.display()))?;

    let mut replaced = 0;
    for (key, tensor) in vae_tensors {
        if key.starts_with("loss") {
            continue;
        }
        let key = format!("{}{key}", Submodule::FIRST_STAGE_PREFIX);
        if let Some(slot) = tensors.get_mut(&key) {
            *slot = cast_floats(tensor, dtype)?;
            replaced += 1;
        }
    }
    info!("replaced {replaced} autoencoder tensors");
    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn replaces_matching_autoencoder_tensors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dev = Device::Cpu;

        let mut vae = HashMap::new();
        vae.insert(
            "decoder.conv_in.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &dev)?,
        );
        vae.insert(
            "loss.logvar".to_string(),
            Tensor::ones((1,), DType::F32, &dev)?,
        );
        vae.insert(
            "encoder.unmatched".to_string(),
            Tensor::ones((1,), DType::F32, &dev)?,
        );
        let vae_path = dir.path().join("vae.safetensors");
        candle_core::safetensors::save(&vae, &vae_path)?;

        let mut tensors = HashMap::new();
        tensors.insert(
            "first_stage_model.decoder.conv_in.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &dev)?,
        );
        tensors.insert(
            "first_stage_model.loss.logvar".to_string(),
            Tensor::zeros((1,), DType::F32, &dev)?,
        );

        let replaced = apply_vae_override(&mut tensors, &vae_path, DType::F16)?;
        assert_eq!(replaced, 1);
        assert_eq!(tensors.len(), 2);

        let conv = &tensors["first_stage_model.decoder.conv_in.weight"];
        assert_eq!(conv.dtype(), DType::F16);
        assert_eq!(conv.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?, 4.0);
        let logvar = &tensors["first_stage_model.loss.logvar"];
        assert_eq!(logvar.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn missing_vae_is_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tensors = HashMap::new();
        let replaced = apply_vae_override(
            &mut tensors,
            &dir.path().join("absent.safetensors"),
            DType::F32,
        )?;
        assert_eq!(replaced, 0);
        Ok(())
    }
}
