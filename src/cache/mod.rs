//! Content-addressed layer cache
//!
//! On-disk layout:
//!
//! ```text
//! <root>/
//!   layers/<digest-hex>/        # immutable once present
//!     blob                      # gzipped layer
//!     diff-id
//!     size
//!   selectors/<selector-hex>    # text file naming one layer digest
//!   manifests/<image-hex>/
//!     manifest.json             # pulled base-image manifest
//!     config.json               # pulled base-image container config
//!   tmp/                        # in-flight writes, cleaned on exit paths
//! ```
//!
//! Writers stream into `tmp/` and rename into place, so a key has at most
//! one effective producer and readers observe either a complete entry or
//! none. When two writers race, the rename loser discards its temp files and
//! the existing entry is authoritative.

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::blob::{CompressedBlob, Digest, compress_gzip_into};
use crate::error::{BuilderError, Result};
use crate::image::ImageReference;
use crate::logging::Logger;

const BLOB_FILE: &str = "blob";
const DIFF_ID_FILE: &str = "diff-id";
const SIZE_FILE: &str = "size";
const MANIFEST_FILE: &str = "manifest.json";
const CONFIG_FILE: &str = "config.json";

/// A fully materialized cache entry for one compressed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLayer {
    pub digest: Digest,
    pub diff_id: Digest,
    pub size: u64,
    pub blob_path: PathBuf,
}

/// Content-addressed store for compressed layer blobs and pulled base-image
/// metadata.
#[derive(Debug, Clone)]
pub struct LayerCache {
    root: PathBuf,
    output: Logger,
}

impl LayerCache {
    pub fn open(root: impl Into<PathBuf>, output: Logger) -> Result<Self> {
        let root = root.into();
        for dir in ["layers", "selectors", "manifests", "tmp"] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root, output })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join("layers").join(digest.to_hex())
    }

    fn selector_path(&self, selector: &Digest) -> PathBuf {
        self.root.join("selectors").join(selector.to_hex())
    }

    fn image_dir(&self, reference: &ImageReference) -> PathBuf {
        let key = Digest::of_bytes(reference.to_string().as_bytes());
        self.root.join("manifests").join(key.to_hex())
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join("tmp")
            .join(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Compress the uncompressed layer tar into the store and point
    /// `selector` at the resulting digest.
    pub fn write_layer<R: Read>(&self, selector: &Digest, uncompressed: R) -> Result<CachedLayer> {
        let temp = TempFile::create(self.temp_path())?;
        let file = std::fs::File::create(temp.path())?;
        let (blob, file) = compress_gzip_into(uncompressed, file)?;
        file.sync_all()?;
        drop(file);

        let cached = self.commit_blob(temp, &blob)?;
        self.write_selector(selector, &cached.digest)?;
        Ok(cached)
    }

    /// Store an already-compressed blob (a pulled base layer) under its
    /// digest. The digest is recomputed from the bytes and verified.
    pub fn write_base_layer<R: Read>(
        &self,
        expected_digest: &Digest,
        diff_id: &Digest,
        mut compressed: R,
    ) -> Result<CachedLayer> {
        let temp = TempFile::create(self.temp_path())?;
        let mut file = std::fs::File::create(temp.path())?;
        let descriptor = crate::blob::compute_digest(&mut compressed, Some(&mut file))?;
        file.sync_all()?;
        drop(file);

        if descriptor.digest != *expected_digest {
            return Err(BuilderError::DigestMismatch {
                expected: expected_digest.to_string(),
                computed: descriptor.digest.to_string(),
            });
        }

        self.commit_blob(
            temp,
            &CompressedBlob {
                digest: descriptor.digest,
                size: descriptor.size,
                diff_id: *diff_id,
                uncompressed_size: 0,
            },
        )
    }

    /// Move a temp blob into `layers/<digest>/` together with its metadata
    /// files. If the directory already exists the temp file is discarded and
    /// the existing entry wins.
    fn commit_blob(&self, temp: TempFile, blob: &CompressedBlob) -> Result<CachedLayer> {
        let dir = self.layer_dir(&blob.digest);
        let blob_path = dir.join(BLOB_FILE);

        if !blob_path.exists() {
            std::fs::create_dir_all(&dir)?;
            self.write_atomic(&dir.join(DIFF_ID_FILE), blob.diff_id.to_string().as_bytes())?;
            self.write_atomic(&dir.join(SIZE_FILE), blob.size.to_string().as_bytes())?;
            match std::fs::rename(temp.path(), &blob_path) {
                Ok(()) => temp.disarm(),
                // A concurrent writer renamed first; its entry is authoritative.
                Err(_) if blob_path.exists() => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(CachedLayer {
            digest: blob.digest,
            diff_id: blob.diff_id,
            size: blob.size,
            blob_path,
        })
    }

    fn write_selector(&self, selector: &Digest, digest: &Digest) -> Result<()> {
        self.write_atomic(&self.selector_path(selector), digest.to_hex().as_bytes())
    }

    fn write_atomic(&self, destination: &Path, contents: &[u8]) -> Result<()> {
        let temp = TempFile::create(self.temp_path())?;
        {
            let mut file = std::fs::File::create(temp.path())?;
            std::io::Write::write_all(&mut file, contents)?;
            file.sync_all()?;
        }
        std::fs::rename(temp.path(), destination)?;
        temp.disarm();
        Ok(())
    }

    /// Look up an application layer by its input fingerprint. A selector
    /// naming a digest whose entry is gone or incomplete is a corruption
    /// condition the caller recovers from.
    pub fn read_by_selector(&self, selector: &Digest) -> Result<Option<CachedLayer>> {
        let path = self.selector_path(selector);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let digest = Digest::parse(raw.trim()).map_err(|_| BuilderError::CacheCorrupted {
            path: path.clone(),
            reason: "selector does not name a valid digest".to_string(),
        })?;

        match self.read_by_digest(&digest)? {
            Some(layer) => Ok(Some(layer)),
            None => Err(BuilderError::CacheCorrupted {
                path,
                reason: format!("selector names digest {} but the layer entry is missing", digest),
            }),
        }
    }

    /// Look up a layer entry by digest. Partial metadata is corruption.
    pub fn read_by_digest(&self, digest: &Digest) -> Result<Option<CachedLayer>> {
        let dir = self.layer_dir(digest);
        let blob_path = dir.join(BLOB_FILE);
        if !blob_path.exists() {
            return Ok(None);
        }

        let diff_id_raw =
            std::fs::read_to_string(dir.join(DIFF_ID_FILE)).map_err(|err| corruption(&dir, err))?;
        let diff_id = Digest::parse(diff_id_raw.trim()).map_err(|_| BuilderError::CacheCorrupted {
            path: dir.join(DIFF_ID_FILE),
            reason: "diff-id file does not hold a digest".to_string(),
        })?;
        let size_raw =
            std::fs::read_to_string(dir.join(SIZE_FILE)).map_err(|err| corruption(&dir, err))?;
        let size: u64 = size_raw
            .trim()
            .parse()
            .map_err(|_| BuilderError::CacheCorrupted {
                path: dir.join(SIZE_FILE),
                reason: "size file does not hold a number".to_string(),
            })?;

        Ok(Some(CachedLayer {
            digest: *digest,
            diff_id,
            size,
            blob_path,
        }))
    }

    /// Drop a selector so the layer it names gets rebuilt. Used for
    /// corruption recovery; the digest-keyed entry (if any) is left alone.
    pub fn invalidate_selector(&self, selector: &Digest) -> Result<()> {
        let path = self.selector_path(selector);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Store a pulled base-image manifest and config as one atomic pair:
    /// both files land in a temp directory that is renamed into place.
    pub fn write_image_metadata(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        config: &[u8],
    ) -> Result<()> {
        let destination = self.image_dir(reference);
        let staging = self.temp_path();
        std::fs::create_dir_all(&staging)?;
        std::fs::write(staging.join(MANIFEST_FILE), manifest)?;
        std::fs::write(staging.join(CONFIG_FILE), config)?;

        if destination.exists() {
            std::fs::remove_dir_all(&destination)?;
        }
        match std::fs::rename(&staging, &destination) {
            Ok(()) => Ok(()),
            Err(_) if destination.join(MANIFEST_FILE).exists() => {
                let _ = std::fs::remove_dir_all(&staging);
                Ok(())
            }
            Err(err) => {
                let _ = std::fs::remove_dir_all(&staging);
                Err(err.into())
            }
        }
    }

    /// Read back a cached manifest/config pair. Readable only when both
    /// halves are present; a lone file reports corruption.
    pub fn read_image_metadata(
        &self,
        reference: &ImageReference,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let dir = self.image_dir(reference);
        let manifest_path = dir.join(MANIFEST_FILE);
        let config_path = dir.join(CONFIG_FILE);
        match (manifest_path.exists(), config_path.exists()) {
            (false, false) => Ok(None),
            (true, true) => Ok(Some((
                std::fs::read(&manifest_path)?,
                std::fs::read(&config_path)?,
            ))),
            _ => Err(BuilderError::CacheCorrupted {
                path: dir,
                reason: "base image metadata pair is incomplete".to_string(),
            }),
        }
    }

    /// Remove everything under `tmp/`. Called on cancellation and after
    /// failed builds so aborted writes do not accumulate.
    pub fn clean_temp(&self) {
        let tmp = self.root.join("tmp");
        if let Ok(entries) = std::fs::read_dir(&tmp) {
            for entry in entries.flatten() {
                let path = entry.path();
                let removed = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                if let Err(err) = removed {
                    self.output
                        .detail(&format!("leaving temp file {}: {}", path.display(), err));
                }
            }
        }
    }

    /// Number of layer entries currently stored. Used by tests asserting
    /// cache-hit identity.
    pub fn layer_entry_count(&self) -> Result<usize> {
        Ok(std::fs::read_dir(self.root.join("layers"))?.count())
    }
}

fn corruption(dir: &Path, err: std::io::Error) -> BuilderError {
    BuilderError::CacheCorrupted {
        path: dir.to_path_buf(),
        reason: format!("metadata unreadable: {}", err),
    }
}

/// A temp path removed on drop unless the write was committed by rename.
struct TempFile {
    path: PathBuf,
    armed: std::cell::Cell<bool>,
}

impl TempFile {
    fn create(path: PathBuf) -> Result<Self> {
        Ok(Self {
            path,
            armed: std::cell::Cell::new(true),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed.get() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> LayerCache {
        LayerCache::open(dir.path(), Logger::new_quiet()).expect("open cache")
    }

    fn selector(byte: u8) -> Digest {
        Digest::of_bytes(&[byte])
    }

    #[test]
    fn write_then_read_by_selector() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        let tar = b"pretend this is a tar".to_vec();

        let written = cache
            .write_layer(&selector(1), Cursor::new(tar.clone()))
            .expect("write");
        assert_eq!(written.diff_id, Digest::of_bytes(&tar));
        assert!(written.blob_path.exists());

        let read = cache
            .read_by_selector(&selector(1))
            .expect("read")
            .expect("present");
        assert_eq!(read, written);

        // The blob on disk hashes to the recorded digest.
        let blob = std::fs::read(&read.blob_path).expect("blob");
        assert_eq!(Digest::of_bytes(&blob), read.digest);
        assert_eq!(blob.len() as u64, read.size);
    }

    #[test]
    fn unknown_selector_is_a_clean_miss() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        assert!(cache.read_by_selector(&selector(9)).expect("read").is_none());
    }

    #[test]
    fn duplicate_content_collapses_to_one_entry() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        let tar = b"identical layer".to_vec();

        let first = cache
            .write_layer(&selector(1), Cursor::new(tar.clone()))
            .expect("write");
        let second = cache
            .write_layer(&selector(2), Cursor::new(tar))
            .expect("write");
        assert_eq!(first.digest, second.digest);
        assert_eq!(cache.layer_entry_count().expect("count"), 1);

        // No stragglers in tmp.
        assert_eq!(
            std::fs::read_dir(dir.path().join("tmp")).expect("tmp").count(),
            0
        );
    }

    #[test]
    fn selector_pointing_at_missing_layer_reports_corruption() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        let layer = cache
            .write_layer(&selector(1), Cursor::new(b"bytes".to_vec()))
            .expect("write");

        std::fs::remove_dir_all(dir.path().join("layers").join(layer.digest.to_hex()))
            .expect("remove layer dir");

        let err = cache.read_by_selector(&selector(1)).expect_err("must fail");
        assert!(err.is_recoverable_cache_error());

        // Recovery path: invalidate, then the selector misses cleanly.
        cache.invalidate_selector(&selector(1)).expect("invalidate");
        assert!(cache.read_by_selector(&selector(1)).expect("read").is_none());
    }

    #[test]
    fn base_layer_write_verifies_digest() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        let compressed = b"compressed base layer bytes".to_vec();
        let digest = Digest::of_bytes(&compressed);
        let diff_id = selector(7);

        let written = cache
            .write_base_layer(&digest, &diff_id, Cursor::new(compressed.clone()))
            .expect("write");
        assert_eq!(written.digest, digest);
        assert_eq!(written.diff_id, diff_id);

        let wrong = selector(8);
        let err = cache
            .write_base_layer(&wrong, &diff_id, Cursor::new(compressed))
            .expect_err("must fail");
        assert!(matches!(err, BuilderError::DigestMismatch { .. }));
    }

    #[test]
    fn image_metadata_pair_is_atomic() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        let reference = ImageReference::parse("library/alpine:3.18").expect("reference");

        assert!(cache.read_image_metadata(&reference).expect("read").is_none());

        cache
            .write_image_metadata(&reference, b"{\"manifest\":true}", b"{\"config\":true}")
            .expect("write");
        let (manifest, config) = cache
            .read_image_metadata(&reference)
            .expect("read")
            .expect("present");
        assert_eq!(manifest, b"{\"manifest\":true}");
        assert_eq!(config, b"{\"config\":true}");

        // Removing one half surfaces corruption instead of partial data.
        let dir_path = {
            let key = Digest::of_bytes(reference.to_string().as_bytes());
            dir.path().join("manifests").join(key.to_hex())
        };
        std::fs::remove_file(dir_path.join("config.json")).expect("remove half");
        let err = cache.read_image_metadata(&reference).expect_err("must fail");
        assert!(err.is_recoverable_cache_error());
    }

    #[test]
    fn clean_temp_removes_in_flight_files() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache(&dir);
        std::fs::write(dir.path().join("tmp").join("stale"), b"x").expect("write");
        cache.clean_temp();
        assert_eq!(
            std::fs::read_dir(dir.path().join("tmp")).expect("tmp").count(),
            0
        );
    }
}
