use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{DevicePreference, ModelPrecision};

pub const DEFAULT_MAX_LOADED_MODELS: usize = 2;

/// Configuration for the model cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of models resident in memory (device or host) at once.
    #[serde(default = "default_max_loaded_models")]
    pub max_loaded_models: usize,

    #[serde(default)]
    pub precision: ModelPrecision,

    #[serde(default)]
    pub device: DevicePreference,

    /// Hide progress bars while hashing weights.
    #[serde(default)]
    pub silent: bool,
}

fn default_max_loaded_models() -> usize {
    DEFAULT_MAX_LOADED_MODELS
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheConfigError {
    #[error("Invalid max loaded models: must be greater than 0")]
    InvalidMaxLoadedModels,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_loaded_models: default_max_loaded_models(),
            precision: ModelPrecision::default(),
            device: DevicePreference::default(),
            silent: false,
        }
    }
}

impl CacheConfig {
    pub fn with_max_loaded_models(mut self, max_loaded_models: usize) -> Self {
        self.max_loaded_models = max_loaded_models;
        self
    }

    pub fn with_precision(mut self, precision: ModelPrecision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.max_loaded_models == 0 {
            return Err(CacheConfigError::InvalidMaxLoadedModels);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_loaded_models, 2);
        assert!(!config.silent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = CacheConfig::default().with_max_loaded_models(0);
        assert_eq!(
            config.validate(),
            Err(CacheConfigError::InvalidMaxLoadedModels)
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: CacheConfig =
            serde_yaml::from_str("silent: true\nprecision: f16").unwrap();
        assert_eq!(config.max_loaded_models, DEFAULT_MAX_LOADED_MODELS);
        assert_eq!(config.precision, ModelPrecision::F16);
        assert_eq!(config.device, DevicePreference::Auto);
        assert!(config.silent);
    }
}
