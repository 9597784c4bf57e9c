//! The bounded pool of resident models.
//!
//! At most [`CacheConfig::max_loaded_models`] models are held in memory at once. Exactly one
//! of them, the active model, lives on the compute device; the others are parked in host
//! memory so switching back to them does not go through the loader. When a new model has
//! to be loaded into a full pool, the least recently used model is dropped.
//!
//! Every mutating operation takes `&mut self`. To share a cache between threads, wrap it
//! in an `Arc<Mutex<ModelCache>>`.

mod config;
mod residency;
mod types;

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    time::Instant,
};

use anyhow::Context;
use dream_rs_common::cached_sha256;
use tracing::{error, info, warn};

pub use config::{CacheConfig, CacheConfigError, DEFAULT_MAX_LOADED_MODELS};
pub use residency::ResidencyOrder;
pub use types::{
    render_model_table, CacheStats, LoadedModel, MemoryUsage, ModelListing, ModelStatus,
};

use crate::{
    models::{Location, ModelLoader},
    ModelAttributes, ModelCacheError, ModelDescriptor, ModelRegistry, Result,
};

pub struct ModelCache {
    registry: ModelRegistry,
    loader: Box<dyn ModelLoader>,
    config: CacheConfig,
    models: HashMap<String, LoadedModel>,
    residency: ResidencyOrder,
    current: Option<String>,
    stats: CacheStats,
}

impl ModelCache {
    /// Create an empty cache over `registry`. Nothing is loaded until the first
    /// [`Self::acquire`].
    pub fn new(
        registry: ModelRegistry,
        loader: Box<dyn ModelLoader>,
        config: CacheConfig,
    ) -> std::result::Result<Self, CacheConfigError> {
        config.validate()?;
        Ok(Self {
            registry,
            loader,
            config,
            models: HashMap::new(),
            residency: ResidencyOrder::new(),
            current: None,
            stats: CacheStats::default(),
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_valid_model(&self, name: &str) -> bool {
        self.registry.is_valid_name(name)
    }

    pub fn default_model(&self) -> Option<&str> {
        self.registry.default_name()
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_model(&self) -> Option<&LoadedModel> {
        self.models.get(self.current.as_deref()?)
    }

    pub fn current_model_mut(&mut self) -> Option<&mut LoadedModel> {
        self.models.get_mut(self.current.as_deref()?)
    }

    /// Whether `name` is resident, on the device or the host.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn location_of(&self, name: &str) -> Option<Location> {
        self.models.get(name).map(LoadedModel::location)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Resident models from least to most recently used.
    pub fn resident_names(&self) -> impl Iterator<Item = &str> {
        self.residency.iter()
    }

    /// Make `name` the active model and return it.
    ///
    /// An unknown name is logged and the currently active model (if any) is returned
    /// unchanged. If loading fails the previously active model is restored and `None` is
    /// returned.
    pub fn acquire(&mut self, name: &str) -> Option<&LoadedModel> {
        match self.switch_to(name) {
            Ok(()) => {}
            Err(e @ ModelCacheError::UnknownModel(_)) => {
                warn!("{e}, keeping the current model");
            }
            Err(_) => return None,
        }
        self.current_model()
    }

    /// Like [`Self::acquire`], but unknown names and load failures are returned as errors.
    /// Recovery of the previous model has already happened when the error is returned.
    pub fn try_acquire(&mut self, name: &str) -> Result<&LoadedModel> {
        self.switch_to(name)?;
        self.current_model().ok_or_else(|| {
            ModelCacheError::ConfigInconsistency(format!("\"{name}\" is active but not resident"))
        })
    }

    fn switch_to(&mut self, name: &str) -> Result<()> {
        if !self.registry.is_valid_name(name) {
            return Err(ModelCacheError::UnknownModel(name.to_string()));
        }

        let previous = self.current.clone();
        let switching = previous.as_deref() != Some(name);
        let resident = self.models.contains_key(name);

        if switching {
            if !resident {
                self.make_room();
            }
            if let Some(previous) = previous.as_deref() {
                if let Err(e) = self.offload(previous) {
                    warn!("could not offload `{previous}`: {e:?}");
                }
            }
        }

        let result = if resident {
            self.stats.total_hits += 1;
            self.activate_resident(name)
        } else {
            self.stats.total_misses += 1;
            self.load_and_insert(name)
        };

        if let Err(e) = result {
            error!("model `{name}` could not be loaded: {e:?}");
            self.stats.load_failures += 1;
            self.restore(previous.as_deref(), name);
            return Err(ModelCacheError::LoadFailure {
                model: name.to_string(),
                reason: format!("{e:#}"),
            });
        }

        self.current = Some(name.to_string());
        self.residency.touch(name);
        Ok(())
    }

    fn activate_resident(&mut self, name: &str) -> anyhow::Result<()> {
        let entry = self
            .models
            .get_mut(name)
            .ok_or_else(|| ModelCacheError::UnknownModel(name.to_string()))?;
        if entry.location() == Location::Host {
            info!("moving model `{name}` to the device");
            entry.model.to_device()?;
        }
        Ok(())
    }

    fn load_and_insert(&mut self, name: &str) -> anyhow::Result<()> {
        let descriptor = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| ModelCacheError::UnknownModel(name.to_string()))?;

        let start = Instant::now();
        info!(
            "loading model `{name}` from weights `{}`",
            descriptor.weights.display()
        );
        let hash = cached_sha256(&descriptor.weights, self.config.silent)
            .with_context(|| format!("could not hash `{}`", descriptor.weights.display()))?;

        let mut model = self.loader.load(name, &descriptor)?;
        if model.location() == Location::Host {
            model.to_device()?;
        }

        self.models.insert(
            name.to_string(),
            LoadedModel {
                name: name.to_string(),
                model,
                width: descriptor.width,
                height: descriptor.height,
                hash,
            },
        );
        self.stats.cache_size = self.models.len();
        info!("model `{name}` ready in {:.2}s", start.elapsed().as_secs_f32());
        Ok(())
    }

    /// Put `previous` back on the device after `failed` could not be activated. Never
    /// recurses into another recovery: if this also fails there is no active model.
    fn restore(&mut self, previous: Option<&str>, failed: &str) {
        let Some(previous) = previous else {
            self.current = None;
            return;
        };
        info!("restoring previous model `{previous}` after `{failed}` failed");

        let restored = if self.models.contains_key(previous) {
            self.activate_resident(previous)
        } else {
            self.load_and_insert(previous)
        };
        match restored {
            Ok(()) => {
                self.current = Some(previous.to_string());
                self.residency.touch(previous);
            }
            Err(e) => {
                error!("could not restore model `{previous}`: {e:?}");
                self.current = None;
            }
        }
    }

    /// Evict until there is room for one more model. The outgoing active model is only
    /// dropped when nothing else is left to evict.
    fn make_room(&mut self) {
        while self.models.len() >= self.config.max_loaded_models {
            if self.evict_one(true).is_none() {
                break;
            }
        }
    }

    /// Drop one resident model if the pool is full. The active model is never chosen.
    /// Returns the evicted name.
    pub fn evict_if_over_capacity(&mut self) -> Option<String> {
        if self.models.len() >= self.config.max_loaded_models {
            self.evict_one(false)
        } else {
            None
        }
    }

    fn evict_one(&mut self, allow_active: bool) -> Option<String> {
        let victim = self.eviction_victim(allow_active)?;
        self.residency.remove(&victim);
        if self.current.as_deref() == Some(victim.as_str()) {
            self.current = None;
        }
        drop(self.models.remove(&victim));
        self.loader.reclaim_memory();

        self.stats.total_evictions += 1;
        self.stats.cache_size = self.models.len();
        info!("evicted model `{victim}` from the cache");
        Some(victim)
    }

    /// Orphans (resident models whose definition was deleted) go first, then the least
    /// recently used inactive model, then the active model if `allow_active`.
    fn eviction_victim(&self, allow_active: bool) -> Option<String> {
        let current = self.current.as_deref();
        let orphan = self
            .models
            .keys()
            .filter(|name| Some(name.as_str()) != current && !self.residency.contains(name))
            .min();
        if let Some(orphan) = orphan {
            return Some(orphan.clone());
        }
        if let Some(oldest) = self.residency.oldest_except(current) {
            return Some(oldest.to_string());
        }
        current
            .filter(|name| allow_active && self.models.contains_key(*name))
            .map(str::to_string)
    }

    /// Move a resident model to host memory. Absent or already offloaded models are left
    /// alone.
    pub fn offload(&mut self, name: &str) -> anyhow::Result<()> {
        let Some(entry) = self.models.get_mut(name) else {
            return Ok(());
        };
        if entry.location() == Location::Host {
            return Ok(());
        }
        entry.model.to_host()?;
        self.stats.total_offloads += 1;
        info!("offloaded model `{name}` to the host");
        self.loader.reclaim_memory();
        Ok(())
    }

    /// Drop every in-memory trace of `name`.
    fn invalidate(&mut self, name: &str) {
        if let Err(e) = self.offload(name) {
            warn!("could not offload `{name}` before invalidating it: {e:?}");
        }
        self.residency.remove(name);
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        if self.models.remove(name).is_some() {
            self.stats.cache_size = self.models.len();
            self.loader.reclaim_memory();
            info!("invalidated cached model `{name}`");
        }
    }

    /// Flag a loaded model as the default. Only takes effect on disk after [`Self::commit`].
    pub fn set_default_model(&mut self, name: &str) -> Result<()> {
        if !self.models.contains_key(name) {
            return Err(ModelCacheError::UnknownModel(name.to_string()));
        }
        self.registry.set_default(name)
    }

    /// Add a model definition, or update it with `clobber`. Updating drops any resident
    /// copy of the model so the next acquire loads the new definition.
    pub fn add_model(
        &mut self,
        name: &str,
        attributes: ModelAttributes,
        clobber: bool,
    ) -> Result<()> {
        self.registry.add(name, attributes, clobber)?;
        if clobber {
            self.invalidate(name);
        }
        Ok(())
    }

    /// Delete a model definition. A resident copy stays in the pool until it is evicted.
    pub fn del_model(&mut self, name: &str) -> Result<ModelDescriptor> {
        let descriptor = self.registry.remove(name)?;
        self.residency.remove(name);
        Ok(descriptor)
    }

    pub fn list_models(&self) -> BTreeMap<String, ModelListing> {
        self.registry
            .iter()
            .map(|(name, descriptor)| {
                let status = if self.current.as_deref() == Some(name) {
                    ModelStatus::Active
                } else if self.models.contains_key(name) {
                    ModelStatus::Cached
                } else {
                    ModelStatus::NotLoaded
                };
                (
                    name.to_string(),
                    ModelListing {
                        status,
                        description: descriptor.description.clone(),
                    },
                )
            })
            .collect()
    }

    /// Write the registry back to `path`.
    pub fn commit(&self, path: impl AsRef<Path>) -> Result<()> {
        self.registry.persist(path)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cache_size: self.models.len(),
            ..self.stats.clone()
        }
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.models
            .values()
            .fold(MemoryUsage::default(), |mut usage, loaded| {
                let size = loaded.model.size_in_bytes();
                match loaded.location() {
                    Location::Device => usage.device_bytes += size,
                    Location::Host => usage.host_bytes += size,
                }
                usage
            })
    }

    /// Drop every resident model. The registry is untouched.
    pub fn clear(&mut self) {
        let cleared = self.models.len();
        self.models.clear();
        self.residency.clear();
        self.current = None;
        self.stats.cache_size = 0;
        self.loader.reclaim_memory();
        info!("cleared {cleared} model(s) from the cache");
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("config", &self.config)
            .field("current", &self.current)
            .field("resident", &self.residency)
            .field("stats", &self.stats)
            .finish()
    }
}
