//! Application layer construction
//!
//! Every user-supplied layer resolves to a cache-backed `(digest, diff_id,
//! compressed blob)` triple. The selector over the layer's inputs gives
//! exact reuse: identical inputs re-use the cached blob without re-reading,
//! and any changed entry misses and rebuilds. A selector pointing at a
//! missing blob is repaired in place: invalidate, rebuild, one diagnostic.

use std::path::PathBuf;

use crate::blob::{Descriptor, Digest};
use crate::cache::LayerCache;
use crate::error::Result;
use crate::image::layer::{EntryDefaults, build_layer_tar, compute_selector};
use crate::image::manifest::TargetFormat;
use crate::logging::Logger;

use super::plan::LayerSpec;

/// A layer ready to be pushed or exported: wire descriptor, `diff_id`, and
/// the compressed blob owned by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedLayer {
    pub name: String,
    pub descriptor: Descriptor,
    pub diff_id: Digest,
    pub blob_path: PathBuf,
    /// Whether the blob came out of the cache untouched
    pub cache_hit: bool,
}

/// Build (or re-use) one application layer.
pub async fn build_application_layer(
    cache: &LayerCache,
    spec: &LayerSpec,
    format: TargetFormat,
    output: &Logger,
) -> Result<PreparedLayer> {
    let cache = cache.clone();
    let spec = spec.clone();
    let output = output.clone();

    // Selector hashing, tar building and compression are all file-bound
    // work; keep them off the async workers.
    tokio::task::spawn_blocking(move || build_blocking(&cache, &spec, format, &output))
        .await
        .map_err(|err| crate::error::BuilderError::Io(format!("layer build task: {}", err)))?
}

fn build_blocking(
    cache: &LayerCache,
    spec: &LayerSpec,
    format: TargetFormat,
    output: &Logger,
) -> Result<PreparedLayer> {
    let defaults = EntryDefaults::default();
    let selector = compute_selector(&spec.entries, &defaults)?;

    match cache.read_by_selector(&selector) {
        Ok(Some(cached)) => {
            output.detail(&format!(
                "layer '{}' unchanged; reusing cached blob {}",
                spec.name, cached.digest
            ));
            return Ok(prepared(spec, format, cached, true));
        }
        Ok(None) => {}
        Err(err) if err.is_recoverable_cache_error() => {
            // The one "cache repaired" diagnostic the recovery emits.
            output.warning(&format!(
                "cache repaired: entry for layer '{}' was corrupt and is being rebuilt",
                spec.name
            ));
            cache.invalidate_selector(&selector)?;
        }
        Err(err) => return Err(err),
    }

    let tar = build_layer_tar(&spec.entries, &defaults)?;
    let cached = cache.write_layer(&selector, std::io::Cursor::new(tar.bytes))?;
    output.detail(&format!(
        "layer '{}' built: {} entries, {}",
        spec.name,
        tar.entry_count,
        cached.digest
    ));
    Ok(prepared(spec, format, cached, false))
}

fn prepared(
    spec: &LayerSpec,
    format: TargetFormat,
    cached: crate::cache::CachedLayer,
    cache_hit: bool,
) -> PreparedLayer {
    PreparedLayer {
        name: spec.name.clone(),
        descriptor: Descriptor::new(cached.digest, cached.size)
            .with_media_type(format.layer_media_type()),
        diff_id: cached.diff_id,
        blob_path: cached.blob_path,
        cache_hit,
    }
}
