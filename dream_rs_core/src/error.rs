use thiserror::Error;

/// Errors surfaced by the model registry and cache.
///
/// Load failures never escape [`crate::ModelCache::acquire`]; they are only returned by
/// [`crate::ModelCache::try_acquire`], after the cache has already attempted recovery.
#[derive(Debug, Error)]
pub enum ModelCacheError {
    #[error("\"{0}\" is not a known model name")]
    UnknownModel(String),

    #[error("required field `{field}` is missing for model \"{model}\"")]
    MissingField { model: String, field: &'static str },

    #[error("attempt to overwrite existing model definition \"{0}\"")]
    AlreadyExists(String),

    #[error("model \"{model}\" could not be loaded: {reason}")]
    LoadFailure { model: String, reason: String },

    #[error("inconsistent model configuration: {0}")]
    ConfigInconsistency(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ModelCacheError>;
