//! The declarative model registry backed by `models.yaml`.

mod descriptor;

use std::{collections::BTreeMap, fs, path::Path};

use tracing::{debug, info};
use uuid::Uuid;

pub use descriptor::{ModelAttributes, ModelDescriptor};

use crate::{ModelCacheError, Result};

/// Comment block written at the top of every committed `models.yaml`.
pub const CONFIG_PREAMBLE: &str = "\
# This file describes the alternative machine learning models
# available to the dream_rs model manager.
#
# To add a new model, follow the examples below. Each
# model requires a model config file, a weights file,
# and the width and height of the images it
# was trained on.
";

/// Named model definitions. Mutations are only visible on disk after [`Self::persist`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a registry from a `models.yaml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("reading model registry from `{}`", path.display());
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    /// Parse a registry document. A document with no entries is an empty registry.
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        let has_content = document
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with('#'));
        if !has_content {
            return Ok(Self::default());
        }
        let models: Option<BTreeMap<String, ModelDescriptor>> = serde_yaml::from_str(document)?;
        Ok(Self {
            models: models.unwrap_or_default(),
        })
    }

    /// Serialize the registry body (without the preamble).
    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.models)?)
    }

    /// Write the preamble and registry to `path`. The document is written to a uniquely
    /// named temporary file in the same directory and renamed over the target, so a crash
    /// never leaves a partially written registry behind and concurrent commits never share
    /// a temporary file.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp_path = dir.join(format!("new_config.tmp.{}", Uuid::new_v4()));

        let mut document = String::from(CONFIG_PREAMBLE);
        document.push_str(&self.to_yaml_string()?);
        fs::write(&temp_path, document)?;
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        info!("committed {} model(s) to `{}`", self.models.len(), path.display());
        Ok(())
    }

    pub fn is_valid_name(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.get(name)
    }

    /// The (first) model flagged as default.
    pub fn default_name(&self) -> Option<&str> {
        self.models
            .iter()
            .find(|(_, descriptor)| descriptor.default)
            .map(|(name, _)| name.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModelDescriptor)> {
        self.models.iter().map(|(name, d)| (name.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Flag `name` as the only default model.
    pub(crate) fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.models.contains_key(name) {
            return Err(ModelCacheError::ConfigInconsistency(format!(
                "\"{name}\" is loaded but no longer registered"
            )));
        }
        for (model, descriptor) in self.models.iter_mut() {
            descriptor.default = model == name;
        }
        debug!("default model is now `{name}`");
        Ok(())
    }

    /// Add or update a definition. Existing definitions are only replaced with `clobber`.
    pub(crate) fn add(
        &mut self,
        name: &str,
        attributes: ModelAttributes,
        clobber: bool,
    ) -> Result<()> {
        if let Some(field) = attributes.missing_field() {
            return Err(ModelCacheError::MissingField {
                model: name.to_string(),
                field,
            });
        }
        let existing = self.models.get(name);
        if existing.is_some() && !clobber {
            return Err(ModelCacheError::AlreadyExists(name.to_string()));
        }

        let descriptor = attributes.merge_into(existing).ok_or_else(|| {
            ModelCacheError::ConfigInconsistency(format!("incomplete definition for \"{name}\""))
        })?;
        let is_default = descriptor.default;
        self.models.insert(name.to_string(), descriptor);
        if is_default {
            self.set_default(name)?;
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, name: &str) -> Result<ModelDescriptor> {
        self.models
            .remove(name)
            .ok_or_else(|| ModelCacheError::UnknownModel(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS_YAML: &str = "
stable-diffusion-1.4:
  description: Stable Diffusion inference model version 1.4
  weights: models/ldm/stable-diffusion-v1/sd-v1-4.ckpt
  config: configs/stable-diffusion/v1-inference.yaml
  width: 512
  height: 512
  vae: models/ldm/stable-diffusion-v1/vae-ft-mse-840000-ema-pruned.ckpt
  default: true
inpainting-1.5:
  description: RunwayML SD 1.5 model optimized for inpainting
  weights: models/ldm/stable-diffusion-v1/sd-v1-5-inpainting.ckpt
  config: configs/stable-diffusion/v1-inpainting-inference.yaml
  width: 512
  height: 512
";

    fn attributes(weights: &str) -> ModelAttributes {
        ModelAttributes {
            description: Some("test model".to_string()),
            weights: Some(weights.into()),
            config: Some("configs/stable-diffusion/v1-inference.yaml".into()),
            width: Some(512),
            height: Some(512),
            ..Default::default()
        }
    }

    #[test]
    fn parses_models_yaml() -> Result<()> {
        let registry = ModelRegistry::from_yaml_str(MODELS_YAML)?;
        assert_eq!(registry.len(), 2);
        assert!(registry.is_valid_name("inpainting-1.5"));
        assert!(!registry.is_valid_name("waifu-diffusion"));
        assert_eq!(registry.default_name(), Some("stable-diffusion-1.4"));

        let sd = registry.get("stable-diffusion-1.4").unwrap();
        assert_eq!(sd.width, 512);
        assert!(sd.vae.is_some());
        assert_eq!(registry.get("inpainting-1.5").unwrap().vae, None);
        Ok(())
    }

    #[test]
    fn comment_only_document_is_empty() -> Result<()> {
        let registry = ModelRegistry::from_yaml_str(CONFIG_PREAMBLE)?;
        assert!(registry.is_empty());
        assert_eq!(registry.default_name(), None);
        Ok(())
    }

    #[test]
    fn add_validates_fields_and_collisions() -> Result<()> {
        let mut registry = ModelRegistry::from_yaml_str(MODELS_YAML)?;

        let mut incomplete = attributes("a.ckpt");
        incomplete.width = None;
        assert!(matches!(
            registry.add("new", incomplete, false),
            Err(ModelCacheError::MissingField { field: "width", .. })
        ));
        assert!(!registry.is_valid_name("new"));

        assert!(matches!(
            registry.add("inpainting-1.5", attributes("b.ckpt"), false),
            Err(ModelCacheError::AlreadyExists(_))
        ));

        registry.add("inpainting-1.5", attributes("b.ckpt"), true)?;
        assert_eq!(
            registry.get("inpainting-1.5").unwrap().weights,
            Path::new("b.ckpt")
        );
        Ok(())
    }

    #[test]
    fn only_one_default() -> Result<()> {
        let mut registry = ModelRegistry::from_yaml_str(MODELS_YAML)?;
        let mut attrs = attributes("c.ckpt");
        attrs.default = Some(true);
        registry.add("waifu-diffusion", attrs, false)?;

        assert_eq!(registry.default_name(), Some("waifu-diffusion"));
        assert_eq!(registry.iter().filter(|(_, d)| d.default).count(), 1);

        registry.set_default("inpainting-1.5")?;
        assert_eq!(registry.default_name(), Some("inpainting-1.5"));
        assert_eq!(registry.iter().filter(|(_, d)| d.default).count(), 1);
        Ok(())
    }

    #[test]
    fn remove_unknown_fails() -> Result<()> {
        let mut registry = ModelRegistry::from_yaml_str(MODELS_YAML)?;
        assert!(matches!(
            registry.remove("missing"),
            Err(ModelCacheError::UnknownModel(_))
        ));
        registry.remove("inpainting-1.5")?;
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn persist_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("models.yaml");

        let mut registry = ModelRegistry::from_yaml_str(MODELS_YAML)?;
        registry.add("extra", attributes("extra.safetensors"), false)?;
        registry.persist(&path)?;

        let written = fs::read_to_string(&path)?;
        assert!(written.starts_with(CONFIG_PREAMBLE));
        assert!(!dir.path().join("new_config.tmp").exists());
        assert_eq!(ModelRegistry::load(&path)?, registry);
        Ok(())
    }

    #[test]
    fn repeated_commits_leave_no_temporary_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("models.yaml");

        let mut registry = ModelRegistry::from_yaml_str(MODELS_YAML)?;
        registry.persist(&path)?;
        registry.add("extra", attributes("extra.safetensors"), false)?;
        registry.persist(&path)?;

        let entries = fs::read_dir(dir.path())?
            .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(entries, ["models.yaml"]);
        assert_eq!(ModelRegistry::load(&path)?.len(), 3);
        Ok(())
    }
}
