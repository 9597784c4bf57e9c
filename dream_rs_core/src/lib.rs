//! Core crate for keeping diffusion checkpoints resident with dream_rs.
//!
//! A [`ModelRegistry`] holds the named model definitions from `models.yaml`, and a
//! [`ModelCache`] decides which of them are held in memory, which one is on the compute
//! device, and which one to drop when there is no room left.
//!
//! ```rust,no_run
//! use dream_rs_core::{
//!     CacheConfig, CheckpointLoader, DevicePreference, ModelCache, ModelPrecision, ModelRegistry,
//! };
//!
//! let registry = ModelRegistry::load("configs/models.yaml")?;
//! let loader =
//!     CheckpointLoader::from_preferences(DevicePreference::Auto, ModelPrecision::Auto, false)?;
//! let mut cache = ModelCache::new(registry, Box::new(loader), CacheConfig::default())?;
//!
//! if let Some(model) = cache.acquire("stable-diffusion-1.5") {
//!     println!("{} ({}x{}) sha256 {}", model.name, model.width, model.height, model.hash);
//! }
//! cache.acquire("inpainting-1.5");
//! println!("{}", cache.memory_usage());
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod cache;
mod error;
mod models;
mod registry;
mod util;

pub use cache::{
    render_model_table, CacheConfig, CacheConfigError, CacheStats, LoadedModel, MemoryUsage,
    ModelCache, ModelListing, ModelStatus, ResidencyOrder, DEFAULT_MAX_LOADED_MODELS,
};
pub use error::{ModelCacheError, Result};
pub use models::{
    ArchitectureConfig, ArchitectureTarget, CheckpointLoader, CheckpointModel, Location,
    ModelLoader, ResidentModel, Submodule,
};
pub use registry::{ModelAttributes, ModelDescriptor, ModelRegistry, CONFIG_PREAMBLE};
pub use util::{choose_device, device_name, DevicePreference, ModelPrecision, TryIntoDType};
