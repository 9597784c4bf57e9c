//! SHA-256 content hashes for weights files, memoized in a sidecar file.
//!
//! The sidecar (`<stem>.sha256`, next to the weights file) is trusted only when its
//! modification time is at or after the weights file's. This is a timestamp rule, not a
//! content check: clock skew or a copy that preserves timestamps can leave a stale digest.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::NiceProgressBar;

pub const SIDECAR_EXTENSION: &str = "sha256";

const CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Path of the hash sidecar for a weights file.
pub fn sidecar_path(weights: &Path) -> PathBuf {
    weights.with_extension(SIDECAR_EXTENSION)
}

/// Hash the full contents of a file.
pub fn sha256_file(path: &Path, silent: bool) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("could not open `{}`", path.display()))?;
    let mut hasher = Sha256::new();

    // Zero-length files cannot be mapped on every platform.
    if file.metadata()?.len() > 0 {
        let mmap = unsafe { Mmap::map(&file)? };
        if silent {
            for chunk in mmap.chunks(CHUNK_SIZE) {
                hasher.update(chunk);
            }
        } else {
            for chunk in NiceProgressBar::<_, 'b'>(mmap.chunks(CHUNK_SIZE), "Hashing weights") {
                hasher.update(chunk);
            }
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Return the content hash of `weights`, reading it from the sidecar when the sidecar is
/// fresh and recomputing (and rewriting the sidecar) otherwise.
///
/// Failing to write the sidecar is not an error; the digest is still returned.
pub fn cached_sha256(weights: &Path, silent: bool) -> Result<String> {
    let sidecar = sidecar_path(weights);
    if sidecar_is_fresh(weights, &sidecar)? {
        let digest = fs::read_to_string(&sidecar)?.trim().to_string();
        if !digest.is_empty() {
            return Ok(digest);
        }
    }

    info!("calculating sha256 hash of `{}`", weights.display());
    let start = Instant::now();
    let digest = sha256_file(weights, silent)?;
    info!("sha256 = {digest} ({:.2}s)", start.elapsed().as_secs_f32());

    if let Err(e) = fs::write(&sidecar, &digest) {
        warn!("could not write hash sidecar `{}`: {e}", sidecar.display());
    }
    Ok(digest)
}

fn sidecar_is_fresh(weights: &Path, sidecar: &Path) -> Result<bool> {
    let weights_modified = fs::metadata(weights)
        .with_context(|| format!("weights file `{}` is not readable", weights.display()))?
        .modified()?;
    let Ok(sidecar_meta) = fs::metadata(sidecar) else {
        return Ok(false);
    };
    Ok(weights_modified <= sidecar_meta.modified()?)
}
