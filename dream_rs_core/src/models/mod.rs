mod checkpoint;
mod vaes;

use std::fmt::Display;

use serde::Serialize;

use crate::ModelDescriptor;

pub use checkpoint::{
    ArchitectureConfig, ArchitectureTarget, CheckpointLoader, CheckpointModel, Submodule,
};

/// Where a resident model's weights currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Location {
    Device,
    Host,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// An instantiated model that can be moved between host and device memory.
///
/// The cache only ever talks to models through this trait, so its policy does not depend
/// on any particular tensor framework.
pub trait ResidentModel: Send {
    /// Move every sub-module onto the compute device. A no-op if already there.
    fn to_device(&mut self) -> anyhow::Result<()>;
    /// Move every sub-module into host memory. A no-op if already there.
    fn to_host(&mut self) -> anyhow::Result<()>;
    fn location(&self) -> Location;
    /// Identity that stays the same across moves, e.g. the weights path.
    fn identity(&self) -> &str;
    fn size_in_bytes(&self) -> usize {
        0
    }
}

/// Turns a model definition into a resident model object.
///
/// `Send` so that a cache owning the loader can be moved behind an `Arc<Mutex<_>>`.
pub trait ModelLoader: Send {
    fn load(
        &self,
        name: &str,
        descriptor: &ModelDescriptor,
    ) -> anyhow::Result<Box<dyn ResidentModel>>;

    /// Return freed memory to the device after models were dropped or moved to the host.
    fn reclaim_memory(&self) {}
}
