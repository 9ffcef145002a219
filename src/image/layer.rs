//! Layer entries and reproducible tar construction
//!
//! An application layer is an ordered list of [`LayerEntry`] values mapping
//! host files into the container filesystem. Tarballs are built
//! reproducibly: entries sorted by extraction path, a fixed numeric owner,
//! and modification times that default to one second after the epoch so the
//! produced bytes (and therefore both layer digests) are stable across
//! machines and builds.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::blob::Digest;
use crate::error::{BuilderError, Result};

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIRECTORY_MODE: u32 = 0o755;
/// Default entry mtime: epoch + 1s. Exactly zero confuses tools that treat
/// the epoch as "missing".
pub const DEFAULT_ENTRY_MTIME: i64 = 1;

/// One file or directory placed into the image.
///
/// A directory entry stands only for itself; it does not pull in the
/// directory contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    /// Host path of the source file or directory
    pub source_path: PathBuf,
    /// Absolute POSIX path inside the container
    pub extraction_path: String,
    /// Permission bits; `None` takes the per-kind default
    #[serde(default)]
    pub mode: Option<u32>,
    /// Seconds since the epoch; `None` takes the reproducible default
    #[serde(default)]
    pub modified_time: Option<i64>,
}

impl LayerEntry {
    pub fn new(source_path: impl Into<PathBuf>, extraction_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            extraction_path: extraction_path.into(),
            mode: None,
            modified_time: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.extraction_path.starts_with('/') {
            return Err(BuilderError::Validation(format!(
                "extraction path '{}' must be absolute",
                self.extraction_path
            )));
        }
        Ok(())
    }

    fn is_directory(&self) -> bool {
        self.source_path.is_dir()
    }

    fn effective_mode(&self, defaults: &EntryDefaults) -> u32 {
        self.mode
            .unwrap_or_else(|| (defaults.mode)(&self.source_path, &self.extraction_path))
    }

    fn effective_mtime(&self, defaults: &EntryDefaults) -> i64 {
        self.modified_time
            .unwrap_or_else(|| (defaults.modified_time)(&self.source_path, &self.extraction_path))
    }
}

/// Providers for per-entry permissions and timestamps, used when an entry
/// leaves them unset. Plain function values so callers can swap policies
/// without new types.
pub struct EntryDefaults {
    pub mode: fn(&Path, &str) -> u32,
    pub modified_time: fn(&Path, &str) -> i64,
}

impl Default for EntryDefaults {
    fn default() -> Self {
        Self {
            mode: |source, _| {
                if source.is_dir() {
                    DEFAULT_DIRECTORY_MODE
                } else {
                    DEFAULT_FILE_MODE
                }
            },
            modified_time: |_, _| DEFAULT_ENTRY_MTIME,
        }
    }
}

/// The uncompressed tar of one application layer.
#[derive(Debug)]
pub struct LayerTar {
    pub bytes: Vec<u8>,
    /// Entries in the order they were written (sorted by extraction path)
    pub entry_count: usize,
}

/// Build the uncompressed layer tar. Entries are sorted by extraction path
/// before writing; tar headers carry a fixed numeric owner of 0:0.
pub fn build_layer_tar(entries: &[LayerEntry], defaults: &EntryDefaults) -> Result<LayerTar> {
    let mut sorted: Vec<&LayerEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.extraction_path.cmp(&b.extraction_path));

    let mut builder = tar::Builder::new(Vec::new());
    for entry in &sorted {
        entry.validate()?;
        let mut header = tar::Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(entry.effective_mtime(defaults).max(0) as u64);
        header.set_mode(entry.effective_mode(defaults));

        // Tar paths are written without the leading slash, matching the
        // layout inside Docker-produced layers.
        let tar_path = entry.extraction_path.trim_start_matches('/');

        if entry.is_directory() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_path(format!("{}/", tar_path)).map_err(|err| {
                BuilderError::Validation(format!(
                    "extraction path '{}' does not fit a tar header: {}",
                    entry.extraction_path, err
                ))
            })?;
            header.set_cksum();
            builder.append(&header, std::io::empty())?;
        } else {
            let mut file = File::open(&entry.source_path).map_err(|err| {
                BuilderError::Io(format!(
                    "cannot open layer source '{}': {}",
                    entry.source_path.display(),
                    err
                ))
            })?;
            let size = file.metadata()?.len();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(size);
            header.set_path(tar_path).map_err(|err| {
                BuilderError::Validation(format!(
                    "extraction path '{}' does not fit a tar header: {}",
                    entry.extraction_path, err
                ))
            })?;
            header.set_cksum();
            builder.append(&header, &mut file)?;
        }
    }

    let bytes = builder.into_inner()?;
    Ok(LayerTar {
        bytes,
        entry_count: sorted.len(),
    })
}

/// Compute the cache selector for a layer: a deterministic SHA-256 over the
/// sorted `(extraction path, source content digest, mode, mtime)` tuples.
/// Any change to any field of any entry produces a different selector.
pub fn compute_selector(entries: &[LayerEntry], defaults: &EntryDefaults) -> Result<Digest> {
    let mut sorted: Vec<&LayerEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.extraction_path.cmp(&b.extraction_path));

    let mut hasher = Sha256::new();
    for entry in &sorted {
        entry.validate()?;
        let content_digest = if entry.is_directory() {
            Digest::of_bytes(b"")
        } else {
            let mut file = File::open(&entry.source_path).map_err(|err| {
                BuilderError::Io(format!(
                    "cannot open layer source '{}': {}",
                    entry.source_path.display(),
                    err
                ))
            })?;
            hash_reader(&mut file)?
        };
        hasher.update(entry.extraction_path.as_bytes());
        hasher.update([0]);
        hasher.update(content_digest.to_hex().as_bytes());
        hasher.update([0]);
        hasher.update(format!("{:o}", entry.effective_mode(defaults)).as_bytes());
        hasher.update([0]);
        hasher.update(entry.effective_mtime(defaults).to_le_bytes());
        hasher.update([b'\n']);
    }
    Ok(Digest::from_bytes(hasher.finalize().into()))
}

fn hash_reader<R: Read>(reader: &mut R) -> Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(Digest::from_bytes(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).expect("write file");
        path
    }

    #[test]
    fn entries_are_sorted_by_extraction_path() {
        let dir = TempDir::new().expect("temp dir");
        let a = write_file(&dir, "a.txt", b"a");
        let b = write_file(&dir, "b.txt", b"b");

        let forward = vec![
            LayerEntry::new(&a, "/app/a.txt"),
            LayerEntry::new(&b, "/app/b.txt"),
        ];
        let backward = vec![
            LayerEntry::new(&b, "/app/b.txt"),
            LayerEntry::new(&a, "/app/a.txt"),
        ];

        let defaults = EntryDefaults::default();
        let first = build_layer_tar(&forward, &defaults).expect("tar");
        let second = build_layer_tar(&backward, &defaults).expect("tar");
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.entry_count, 2);
    }

    #[test]
    fn tar_is_reproducible_with_fixed_owner_and_mtime() {
        let dir = TempDir::new().expect("temp dir");
        let file = write_file(&dir, "hello", b"hi\n");
        let entries = vec![LayerEntry::new(&file, "/hello")];
        let defaults = EntryDefaults::default();

        let tar = build_layer_tar(&entries, &defaults).expect("tar");
        let again = build_layer_tar(&entries, &defaults).expect("tar");
        assert_eq!(tar.bytes, again.bytes);

        let mut archive = tar::Archive::new(&tar.bytes[..]);
        let entry = archive.entries().expect("entries").next().expect("one")
            .expect("entry");
        let header = entry.header();
        assert_eq!(header.uid().expect("uid"), 0);
        assert_eq!(header.gid().expect("gid"), 0);
        assert_eq!(header.mtime().expect("mtime"), 1);
        assert_eq!(header.mode().expect("mode"), DEFAULT_FILE_MODE);
        assert_eq!(entry.path().expect("path").to_str(), Some("hello"));
    }

    #[test]
    fn non_absolute_extraction_path_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let file = write_file(&dir, "x", b"x");
        let entries = vec![LayerEntry::new(&file, "relative/path")];
        let err = build_layer_tar(&entries, &EntryDefaults::default()).expect_err("must fail");
        assert!(matches!(err, BuilderError::Validation(_)));
    }

    #[test]
    fn selector_changes_with_any_field() {
        let dir = TempDir::new().expect("temp dir");
        let file = write_file(&dir, "app.jar", b"bytes");
        let defaults = EntryDefaults::default();

        let base = vec![LayerEntry::new(&file, "/app/app.jar")];
        let selector = compute_selector(&base, &defaults).expect("selector");

        // Same inputs, same selector.
        assert_eq!(selector, compute_selector(&base, &defaults).expect("selector"));

        // Different extraction path.
        let moved = vec![LayerEntry::new(&file, "/lib/app.jar")];
        assert_ne!(selector, compute_selector(&moved, &defaults).expect("selector"));

        // Different permissions.
        let mut executable = base.clone();
        executable[0].mode = Some(0o755);
        assert_ne!(
            selector,
            compute_selector(&executable, &defaults).expect("selector")
        );

        // Different mtime.
        let mut touched = base.clone();
        touched[0].modified_time = Some(1_700_000_000);
        assert_ne!(
            selector,
            compute_selector(&touched, &defaults).expect("selector")
        );

        // Different content, same paths.
        fs::write(&file, b"other bytes").expect("rewrite");
        assert_ne!(selector, compute_selector(&base, &defaults).expect("selector"));
    }

    #[test]
    fn selector_ignores_entry_order() {
        let dir = TempDir::new().expect("temp dir");
        let a = write_file(&dir, "a", b"a");
        let b = write_file(&dir, "b", b"b");
        let defaults = EntryDefaults::default();

        let forward = vec![LayerEntry::new(&a, "/a"), LayerEntry::new(&b, "/b")];
        let backward = vec![LayerEntry::new(&b, "/b"), LayerEntry::new(&a, "/a")];
        assert_eq!(
            compute_selector(&forward, &defaults).expect("selector"),
            compute_selector(&backward, &defaults).expect("selector")
        );
    }

    #[test]
    fn directory_entries_do_not_include_contents() {
        let dir = TempDir::new().expect("temp dir");
        let sub = dir.path().join("data");
        fs::create_dir(&sub).expect("mkdir");
        fs::write(sub.join("inner.txt"), b"inner").expect("write");

        let entries = vec![LayerEntry::new(&sub, "/data")];
        let tar = build_layer_tar(&entries, &EntryDefaults::default()).expect("tar");

        let mut archive = tar::Archive::new(&tar.bytes[..]);
        let paths: Vec<String> = archive
            .entries()
            .expect("entries")
            .map(|e| {
                e.expect("entry")
                    .path()
                    .expect("path")
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        assert_eq!(paths, vec!["data/".to_string()]);
    }
}
