mod progress;

pub mod hash;

pub use hash::{cached_sha256, sha256_file, sidecar_path};
pub use progress::NiceProgressBar;
