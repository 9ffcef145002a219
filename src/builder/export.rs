//! Image export
//!
//! The `docker save`-compatible tarball shared by the tar-file and
//! local-daemon output modes: `manifest.json` (array form), the config
//! JSON, one `<digest-hex>.tar.gz` per layer, and the legacy `repositories`
//! file. Daemon mode streams the same tar into `docker load` and propagates
//! the subprocess exit code.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::blob::Digest;
use crate::error::{BuilderError, Result};
use crate::logging::Logger;

/// One layer going into the export tar: the cached compressed blob plus the
/// digest naming it.
#[derive(Debug, Clone)]
pub struct ExportLayer {
    pub digest: Digest,
    pub blob_path: PathBuf,
}

/// Everything the save-format writer needs.
#[derive(Debug, Clone)]
pub struct ExportImage {
    pub config_bytes: Vec<u8>,
    pub layers: Vec<ExportLayer>,
    /// `repository:tag` strings recorded in `manifest.json`
    pub repo_tags: Vec<String>,
}

#[derive(Serialize)]
struct SaveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Write the `docker save` tar into `writer`.
pub fn write_save_tar<W: Write>(image: &ExportImage, writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);

    let config_name = format!("{}.json", Digest::of_bytes(&image.config_bytes).to_hex());
    append_bytes(&mut builder, &config_name, &image.config_bytes)?;

    let mut layer_names = Vec::new();
    for layer in &image.layers {
        let name = format!("{}.tar.gz", layer.digest.to_hex());
        let mut file = std::fs::File::open(&layer.blob_path).map_err(|err| {
            BuilderError::Io(format!(
                "cannot open cached layer {}: {}",
                layer.blob_path.display(),
                err
            ))
        })?;
        let size = file.metadata()?.len();
        let mut header = tar_header(&name, size)?;
        builder.append(&mut header, &mut file)?;
        layer_names.push(name);
    }

    let manifest = vec![SaveManifestEntry {
        config: config_name,
        repo_tags: image.repo_tags.clone(),
        layers: layer_names,
    }];
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

    // Legacy file some loaders still expect; maps repo:tag to the top layer.
    let mut repositories = serde_json::Map::new();
    for repo_tag in &image.repo_tags {
        if let Some((repository, tag)) = repo_tag.rsplit_once(':') {
            let top = image
                .layers
                .last()
                .map(|l| l.digest.to_hex())
                .unwrap_or_default();
            repositories
                .entry(repository.to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .map(|tags| tags.insert(tag.to_string(), serde_json::Value::String(top)));
        }
    }
    append_bytes(
        &mut builder,
        "repositories",
        &serde_json::to_vec(&serde_json::Value::Object(repositories))?,
    )?;

    Ok(builder.into_inner()?)
}

fn tar_header(name: &str, size: u64) -> Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name).map_err(|err| {
        BuilderError::Validation(format!("export entry name '{}': {}", name, err))
    })?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    Ok(header)
}

fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    bytes: &[u8],
) -> Result<()> {
    let mut header = tar_header(name, bytes.len() as u64)?;
    builder.append(&mut header, bytes)?;
    Ok(())
}

/// Write the save tar to a file.
pub fn export_to_tar_file(image: &ExportImage, path: &Path, output: &Logger) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let file = write_save_tar(image, file)?;
    file.sync_all()?;
    output.success(&format!("image exported to {}", path.display()));
    Ok(())
}

/// Stream the save tar into `docker load`. The subprocess exit code
/// propagates: a non-zero exit fails the build with the daemon's stderr.
pub async fn load_into_daemon(image: &ExportImage, output: &Logger) -> Result<()> {
    let tar_bytes = write_save_tar(image, Vec::new())?;

    let mut child = Command::new("docker")
        .arg("load")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            BuilderError::Subprocess(format!("cannot spawn 'docker load': {}", err))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&tar_bytes).await?;
        stdin.shutdown().await?;
    }

    let result = child.wait_with_output().await?;
    if !result.status.success() {
        return Err(BuilderError::Subprocess(format!(
            "'docker load' exited with {}: {}",
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        )));
    }
    output.success(&format!(
        "image loaded into the local daemon ({})",
        String::from_utf8_lossy(&result.stdout).trim()
    ));
    Ok(())
}
