//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

use jvm_image_builder::builder::{BuildFlags, BuildPlan, LayerSpec, OutputTarget};
use jvm_image_builder::builder::plan::{ContainerSettings, PlanCredentials};
use jvm_image_builder::image::config::Platform;
use jvm_image_builder::image::layer::LayerEntry;
use jvm_image_builder::image::manifest::TargetFormat;
use jvm_image_builder::image::reference::ImageReference;

/// A plan pushing to `registry_host` with a scratch base and no layers;
/// tests add what they need.
pub fn plan_for(registry_host: &str, cache_dir: &Path) -> BuildPlan {
    BuildPlan {
        base_image: ImageReference::parse("scratch").expect("base"),
        target_image: ImageReference::parse(&format!("{}/myrepo/app:1.0", registry_host))
            .expect("target"),
        additional_tags: Vec::new(),
        layers: Vec::new(),
        container: ContainerSettings::default(),
        platform: Platform::default(),
        format: TargetFormat::default(),
        output: OutputTarget::Registry,
        credentials: PlanCredentials::default(),
        flags: BuildFlags {
            allow_insecure: true,
            cache_dir: Some(cache_dir.to_path_buf()),
            ..BuildFlags::default()
        },
    }
}

/// One single-file layer: `source bytes` extracted to `extraction_path`.
pub fn single_file_layer(
    sources: &Path,
    name: &str,
    file_name: &str,
    contents: &[u8],
    extraction_path: &str,
) -> LayerSpec {
    let source = sources.join(file_name);
    std::fs::write(&source, contents).expect("write layer source");
    LayerSpec {
        name: name.to_string(),
        entries: vec![LayerEntry::new(&source, extraction_path)],
    }
}

/// The reproducible single-file layer tar exactly as the builder produces
/// it: sorted entries, owner 0:0, mtime epoch+1, no leading slash.
pub fn expected_layer_tar(path_in_image: &str, contents: &[u8], mode: u32) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(1);
    header.set_mode(mode);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header
        .set_path(path_in_image.trim_start_matches('/'))
        .expect("path");
    header.set_cksum();
    builder.append(&header, contents).expect("append");
    builder.into_inner().expect("tar")
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).expect("compress");
    encoder.finish().expect("finish")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::Digest as _;
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Count layer blob entries under a cache root.
pub fn cached_layer_count(cache_dir: &Path) -> usize {
    std::fs::read_dir(cache_dir.join("layers"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}
