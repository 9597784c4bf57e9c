use std::{collections::BTreeMap, fmt::Display};

use serde::Serialize;

use crate::models::{Location, ResidentModel};

/// A model instantiated by the loader and held in the cache pool.
pub struct LoadedModel {
    pub name: String,
    pub model: Box<dyn ResidentModel>,
    pub width: u32,
    pub height: u32,
    /// SHA-256 of the weights file.
    pub hash: String,
}

impl LoadedModel {
    pub fn location(&self) -> Location {
        self.model.location()
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("identity", &self.model.identity())
            .field("location", &self.location())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("hash", &self.hash)
            .finish()
    }
}

/// Counters accumulated over the lifetime of a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_hits: u64,
    pub total_misses: u64,
    pub total_evictions: u64,
    pub total_offloads: u64,
    pub load_failures: u64,
    pub cache_size: usize,
}

/// Bytes held by resident models, split by where they live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub device_bytes: usize,
    pub host_bytes: usize,
}

impl Display for MemoryUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2}G on device, {:.2}G on host",
            self.device_bytes as f64 / 1e9,
            self.host_bytes as f64 / 1e9
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Active,
    Cached,
    NotLoaded,
}

impl Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cached => write!(f, "cached"),
            Self::NotLoaded => write!(f, "not loaded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelListing {
    pub status: ModelStatus,
    pub description: Option<String>,
}

/// Render a listing as an aligned table, one model per line. The active model is bold.
pub fn render_model_table(listing: &BTreeMap<String, ModelListing>) -> String {
    let mut table = String::new();
    for (name, entry) in listing {
        let description = entry.description.as_deref().unwrap_or("<no description>");
        let line = format!("{name:<25} {:>10}  {description}", entry.status.to_string());
        if entry.status == ModelStatus::Active {
            table.push_str(&format!("\x1b[1m{line}\x1b[0m\n"));
        } else {
            table.push_str(&line);
            table.push('\n');
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_layout() {
        let mut listing = BTreeMap::new();
        listing.insert(
            "a".to_string(),
            ModelListing {
                status: ModelStatus::Active,
                description: Some("first".to_string()),
            },
        );
        listing.insert(
            "b".to_string(),
            ModelListing {
                status: ModelStatus::NotLoaded,
                description: None,
            },
        );
        let table = render_model_table(&listing);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            format!("\x1b[1m{:<25} {:>10}  first\x1b[0m", "a", "active")
        );
        assert_eq!(
            lines[1],
            format!("{:<25} {:>10}  <no description>", "b", "not loaded")
        );
    }

    #[test]
    fn memory_usage_in_gigabytes() {
        let usage = MemoryUsage {
            device_bytes: 2_500_000_000,
            host_bytes: 0,
        };
        assert_eq!(usage.to_string(), "2.50G on device, 0.00G on host");
    }
}
