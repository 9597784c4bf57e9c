use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    fs,
    path::Path,
    time::Instant,
};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{vaes::apply_vae_override, Location, ModelLoader, ResidentModel};
use crate::{
    util::{choose_device, device_name, DevicePreference, ModelPrecision, TryIntoDType},
    ModelDescriptor,
};

/// The sub-modules of a latent diffusion checkpoint, keyed by tensor name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Submodule {
    /// The autoencoder (VAE).
    FirstStage,
    /// The text conditioning model.
    CondStage,
    /// The denoising UNet.
    Diffusion,
    Other,
}

impl Submodule {
    pub(crate) const FIRST_STAGE_PREFIX: &'static str = "first_stage_model.";

    pub fn of(tensor_name: &str) -> Self {
        if tensor_name.starts_with(Self::FIRST_STAGE_PREFIX) {
            Self::FirstStage
        } else if tensor_name.starts_with("cond_stage_model.") {
            Self::CondStage
        } else if tensor_name.starts_with("model.") {
            Self::Diffusion
        } else {
            Self::Other
        }
    }
}

impl Display for Submodule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstStage => write!(f, "first_stage_model"),
            Self::CondStage => write!(f, "cond_stage_model"),
            Self::Diffusion => write!(f, "model"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// The `model:` section of an architecture config such as `v1-inference.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureConfig {
    pub model: ArchitectureTarget,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureTarget {
    pub target: String,
    #[serde(default)]
    pub params: serde_yaml::Value,
}

impl ArchitectureConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let document = fs::read_to_string(path)
            .with_context(|| format!("could not read model config `{}`", path.display()))?;
        serde_yaml::from_str(&document)
            .with_context(|| format!("invalid model config `{}`", path.display()))
    }
}

/// A checkpoint held as candle tensors, grouped by sub-module so each group can be moved
/// between host and device on its own.
pub struct CheckpointModel {
    identity: String,
    architecture: ArchitectureConfig,
    components: BTreeMap<Submodule, HashMap<String, Tensor>>,
    device: Device,
    location: Location,
}

impl CheckpointModel {
    /// Build a model from host-resident tensors. It starts out on the host.
    pub fn new(
        identity: String,
        architecture: ArchitectureConfig,
        tensors: HashMap<String, Tensor>,
        device: Device,
    ) -> Self {
        let mut components: BTreeMap<Submodule, HashMap<String, Tensor>> = BTreeMap::new();
        for (name, tensor) in tensors {
            components
                .entry(Submodule::of(&name))
                .or_default()
                .insert(name, tensor);
        }
        Self {
            identity,
            architecture,
            components,
            device,
            location: Location::Host,
        }
    }

    pub fn architecture(&self) -> &ArchitectureConfig {
        &self.architecture
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.components.get(&Submodule::of(name))?.get(name)
    }

    pub fn tensor_count(&self) -> usize {
        self.components.values().map(HashMap::len).sum()
    }

    pub fn submodules(&self) -> impl Iterator<Item = Submodule> + '_ {
        self.components.keys().copied()
    }

    fn move_to(&mut self, device: &Device) -> Result<()> {
        for submodule in self.components.keys() {
            debug!(
                "moving {submodule} of `{}` to {}",
                self.identity,
                device_name(device)
            );
        }
        self.replace_tensors(|_, tensor| Ok(tensor.to_device(device)?))
    }

    /// Replace every tensor with the result of `f`. If any call fails the model keeps all of
    /// its previous tensors, so its location still describes every one of them.
    fn replace_tensors(
        &mut self,
        mut f: impl FnMut(&str, &Tensor) -> Result<Tensor>,
    ) -> Result<()> {
        let mut replaced = BTreeMap::new();
        for (submodule, tensors) in &self.components {
            let mut group = HashMap::with_capacity(tensors.len());
            for (name, tensor) in tensors {
                group.insert(name.clone(), f(name, tensor)?);
            }
            replaced.insert(*submodule, group);
        }
        self.components = replaced;
        Ok(())
    }
}

impl ResidentModel for CheckpointModel {
    fn to_device(&mut self) -> Result<()> {
        if self.location == Location::Device {
            return Ok(());
        }
        if !self.device.is_cpu() {
            let device = self.device.clone();
            self.move_to(&device)?;
        }
        self.location = Location::Device;
        Ok(())
    }

    fn to_host(&mut self) -> Result<()> {
        if self.location == Location::Host {
            return Ok(());
        }
        if !self.device.is_cpu() {
            self.move_to(&Device::Cpu)?;
        }
        self.location = Location::Host;
        Ok(())
    }

    fn location(&self) -> Location {
        self.location
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn size_in_bytes(&self) -> usize {
        self.components
            .values()
            .flat_map(HashMap::values)
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

/// Read every tensor of a checkpoint into host memory.
pub(crate) fn read_checkpoint(path: &Path) -> Result<HashMap<String, Tensor>> {
    let ext = path.extension().and_then(|ext| ext.to_str());
    match ext {
        Some("safetensors") => Ok(candle_core::safetensors::load(path, &Device::Cpu)?),
        Some("ckpt" | "pt" | "pth" | "bin") => {
            let tensors = match candle_core::pickle::read_all_with_key(path, Some("state_dict")) {
                Ok(tensors) => tensors,
                Err(keyed) => {
                    debug!(
                        "no `state_dict` in `{}` ({keyed}), reading top-level tensors",
                        path.display()
                    );
                    candle_core::pickle::read_all(path).with_context(|| {
                        format!("no tensors under `state_dict` ({keyed}) or top-level")
                    })?
                }
            };
            Ok(tensors.into_iter().collect())
        }
        other => anyhow::bail!(
            "Unexpected checkpoint extension `{other:?}` for `{}`.",
            path.display()
        ),
    }
}

pub(crate) fn cast_floats(tensor: Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype().is_float() && tensor.dtype() != dtype {
        Ok(tensor.to_dtype(dtype)?)
    } else {
        Ok(tensor)
    }
}

/// Loads `.safetensors` and pickled checkpoints with candle.
pub struct CheckpointLoader {
    device: Device,
    dtype: DType,
}

impl CheckpointLoader {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn from_preferences(
        device: DevicePreference,
        precision: ModelPrecision,
        silent: bool,
    ) -> Result<Self> {
        let device = choose_device(device)?;
        let dtype = precision.try_into_dtype(&device, silent)?;
        Ok(Self::new(device, dtype))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Load a checkpoint and activate it on the device.
    pub fn load_checkpoint(
        &self,
        name: &str,
        descriptor: &ModelDescriptor,
    ) -> Result<CheckpointModel> {
        let start = Instant::now();
        let architecture = ArchitectureConfig::load(&descriptor.config)?;
        info!("model `{name}` architecture is {}", architecture.model.target);

        let mut tensors = read_checkpoint(&descriptor.weights)
            .with_context(|| format!("could not read weights `{}`", descriptor.weights.display()))?;

        match self.dtype {
            DType::F16 | DType::BF16 => info!("using faster {:?} precision", self.dtype),
            _ => info!("using more accurate {:?} precision", self.dtype),
        }
        tensors = tensors
            .into_iter()
            .map(|(name, t)| Ok((name, cast_floats(t, self.dtype)?)))
            .collect::<Result<_>>()?;

        if let Some(vae) = &descriptor.vae {
            apply_vae_override(&mut tensors, vae, self.dtype)?;
        }

        let mut model = CheckpointModel::new(
            descriptor.weights.display().to_string(),
            architecture,
            tensors,
            self.device.clone(),
        );
        model.to_device()?;

        info!(
            "model `{name}` loaded in {:.2}s ({} tensors, {:.2}G)",
            start.elapsed().as_secs_f32(),
            model.tensor_count(),
            model.size_in_bytes() as f64 / 1e9
        );
        Ok(model)
    }
}

impl ModelLoader for CheckpointLoader {
    fn load(&self, name: &str, descriptor: &ModelDescriptor) -> Result<Box<dyn ResidentModel>> {
        Ok(Box::new(self.load_checkpoint(name, descriptor)?))
    }

    fn reclaim_memory(&self) {
        if let Err(e) = self.device.synchronize() {
            warn!("could not synchronize {}: {e}", device_name(&self.device));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const ARCH_YAML: &str = "
model:
  base_learning_rate: 1.0e-04
  target: ldm.models.diffusion.ddpm.LatentDiffusion
  params:
    image_size: 64
    channels: 4
";

    fn write_checkpoint(dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "first_stage_model.decoder.conv_in.weight".to_string(),
            Tensor::zeros((4, 4), DType::F32, &dev)?,
        );
        tensors.insert(
            "cond_stage_model.transformer.embeddings.weight".to_string(),
            Tensor::zeros((2, 8), DType::F32, &dev)?,
        );
        tensors.insert(
            "model.diffusion_model.out.weight".to_string(),
            Tensor::zeros((8,), DType::F32, &dev)?,
        );
        tensors.insert(
            "alphas_cumprod".to_string(),
            Tensor::zeros((10,), DType::F32, &dev)?,
        );
        let weights = dir.join("model.safetensors");
        candle_core::safetensors::save(&tensors, &weights)?;

        let config = dir.join("v1-inference.yaml");
        fs::write(&config, ARCH_YAML)?;
        Ok((weights, config))
    }

    fn descriptor(weights: PathBuf, config: PathBuf) -> ModelDescriptor {
        ModelDescriptor {
            description: Some("test".to_string()),
            weights,
            config,
            width: 512,
            height: 512,
            vae: None,
            default: false,
        }
    }

    #[test]
    fn submodule_prefixes() {
        assert_eq!(Submodule::of("first_stage_model.encoder.w"), Submodule::FirstStage);
        assert_eq!(Submodule::of("cond_stage_model.w"), Submodule::CondStage);
        assert_eq!(Submodule::of("model.diffusion_model.w"), Submodule::Diffusion);
        assert_eq!(Submodule::of("model_ema.decay"), Submodule::Other);
    }

    #[test]
    fn loads_and_moves_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (weights, config) = write_checkpoint(dir.path())?;
        let loader = CheckpointLoader::new(Device::Cpu, DType::F16);

        let mut model = loader.load_checkpoint("sd", &descriptor(weights.clone(), config))?;
        assert_eq!(model.location(), Location::Device);
        assert_eq!(model.tensor_count(), 4);
        assert_eq!(model.submodules().count(), 4);
        assert_eq!(
            model.architecture().model.target,
            "ldm.models.diffusion.ddpm.LatentDiffusion"
        );
        assert_eq!(model.identity(), weights.display().to_string());

        let tensor = model.tensor("model.diffusion_model.out.weight").unwrap();
        assert_eq!(tensor.dtype(), DType::F16);
        // (16 + 16 + 8 + 10) elements at two bytes each
        assert_eq!(model.size_in_bytes(), 100);

        model.to_host()?;
        assert_eq!(model.location(), Location::Host);
        model.to_host()?;
        model.to_device()?;
        assert_eq!(model.location(), Location::Device);
        Ok(())
    }

    #[test]
    fn missing_config_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (weights, _) = write_checkpoint(dir.path())?;
        let loader = CheckpointLoader::new(Device::Cpu, DType::F32);
        let result = loader.load("sd", &descriptor(weights, dir.path().join("absent.yaml")));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn failed_tensor_replacement_keeps_previous_tensors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (weights, config) = write_checkpoint(dir.path())?;
        let loader = CheckpointLoader::new(Device::Cpu, DType::F32);
        let mut model = loader.load_checkpoint("sd", &descriptor(weights, config))?;

        let result = model.replace_tensors(|name, tensor| {
            if name == "model.diffusion_model.out.weight" {
                anyhow::bail!("device out of memory");
            }
            Ok(tensor.to_dtype(DType::F16)?)
        });
        assert!(result.is_err());
        assert_eq!(model.tensor_count(), 4);
        for submodule in [Submodule::FirstStage, Submodule::CondStage, Submodule::Diffusion] {
            for tensor in model.components[&submodule].values() {
                assert_eq!(tensor.dtype(), DType::F32);
            }
        }
        assert_eq!(model.location(), Location::Device);

        model.replace_tensors(|_, tensor| Ok(tensor.to_dtype(DType::F16)?))?;
        let tensor = model.tensor("alphas_cumprod").unwrap();
        assert_eq!(tensor.dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn unreadable_pickle_reports_both_attempts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let weights = dir.path().join("model.ckpt");
        fs::write(&weights, b"not a pickle")?;
        let err = match read_checkpoint(&weights) {
            Ok(_) => panic!("garbage checkpoint was read"),
            Err(e) => format!("{e:#}"),
        };
        assert!(err.contains("state_dict"), "{err}");
        Ok(())
    }

    #[test]
    fn unknown_extension_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let weights = dir.path().join("model.onnx");
        fs::write(&weights, b"not a checkpoint")?;
        assert!(read_checkpoint(&weights).is_err());
        Ok(())
    }
}
