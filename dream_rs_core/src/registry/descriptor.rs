use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One entry of `models.yaml`. The model name is the mapping key and is not stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Checkpoint file (`.ckpt`, `.safetensors`, ...).
    pub weights: PathBuf,
    /// Architecture config (the `v1-inference.yaml` style document).
    pub config: PathBuf,
    /// Width the model was trained on.
    pub width: u32,
    /// Height the model was trained on.
    pub height: u32,
    /// Optional VAE checkpoint replacing the first stage weights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vae: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub default: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Attributes passed when adding or editing a model. Every field is optional so that
/// missing required fields can be reported instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAttributes {
    pub description: Option<String>,
    pub weights: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vae: Option<PathBuf>,
    pub default: Option<bool>,
}

impl ModelAttributes {
    /// The first required field that is absent, in the order they are validated.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.description.is_none() {
            Some("description")
        } else if self.weights.is_none() {
            Some("weights")
        } else if self.height.is_none() {
            Some("height")
        } else if self.width.is_none() {
            Some("width")
        } else if self.config.is_none() {
            Some("config")
        } else {
            None
        }
    }

    /// Merge these attributes over an existing descriptor, or build a new one.
    /// Returns `None` if a required field is missing.
    pub(crate) fn merge_into(self, existing: Option<&ModelDescriptor>) -> Option<ModelDescriptor> {
        Some(ModelDescriptor {
            description: Some(self.description?),
            weights: self.weights?,
            config: self.config?,
            width: self.width?,
            height: self.height?,
            vae: self.vae.or_else(|| existing.and_then(|d| d.vae.clone())),
            default: self
                .default
                .unwrap_or_else(|| existing.is_some_and(|d| d.default)),
        })
    }
}

impl From<&ModelDescriptor> for ModelAttributes {
    fn from(descriptor: &ModelDescriptor) -> Self {
        Self {
            description: descriptor.description.clone(),
            weights: Some(descriptor.weights.clone()),
            config: Some(descriptor.config.clone()),
            width: Some(descriptor.width),
            height: Some(descriptor.height),
            vae: descriptor.vae.clone(),
            default: Some(descriptor.default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> ModelAttributes {
        ModelAttributes {
            description: Some("Stable Diffusion v1.5".to_string()),
            weights: Some("models/ldm/v1-5.ckpt".into()),
            config: Some("configs/v1-inference.yaml".into()),
            width: Some(512),
            height: Some(512),
            vae: None,
            default: None,
        }
    }

    #[test]
    fn reports_first_missing_field() {
        assert_eq!(complete().missing_field(), None);

        let mut attrs = complete();
        attrs.height = None;
        attrs.config = None;
        assert_eq!(attrs.missing_field(), Some("height"));

        assert_eq!(ModelAttributes::default().missing_field(), Some("description"));
    }

    #[test]
    fn merge_keeps_existing_optional_fields() {
        let existing = ModelDescriptor {
            vae: Some("models/vae.ckpt".into()),
            default: true,
            ..complete().merge_into(None).unwrap()
        };

        let mut update = complete();
        update.width = Some(768);
        let merged = update.merge_into(Some(&existing)).unwrap();

        assert_eq!(merged.width, 768);
        assert_eq!(merged.vae, existing.vae);
        assert!(merged.default);
    }

    #[test]
    fn descriptor_round_trips_through_attributes() {
        let descriptor = complete().merge_into(None).unwrap();
        let attrs = ModelAttributes::from(&descriptor);
        assert_eq!(attrs.merge_into(None), Some(descriptor));
    }
}
