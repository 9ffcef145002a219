//! Reproducibility and cache-hit identity.
//!
//! Two independent builds of the same plan over the same source bytes must
//! produce byte-identical manifests and configs, and the second build must
//! create zero new layer blobs.

mod common;

use jvm_image_builder::builder::{BuildEngine, BuildPlan, OutputTarget};
use jvm_image_builder::logging::Logger;
use tempfile::TempDir;

use common::{cached_layer_count, plan_for, single_file_layer};

fn tar_plan(host: &str, cache: &TempDir, sources: &TempDir, out: &std::path::Path) -> BuildPlan {
    let mut plan = plan_for(host, cache.path());
    plan.output = OutputTarget::Tar {
        path: out.to_path_buf(),
    };
    plan.layers = vec![
        single_file_layer(
            sources.path(),
            "dependencies",
            "lib.jar",
            b"library bytes",
            "/app/libs/lib.jar",
        ),
        single_file_layer(
            sources.path(),
            "classes",
            "Main.class",
            b"\xca\xfe\xba\xbeclass bytes",
            "/app/classes/Main.class",
        ),
    ];
    plan
}

#[tokio::test]
async fn identical_plans_produce_identical_images() {
    let sources = TempDir::new().expect("sources");
    let out = TempDir::new().expect("out");

    // Two fully independent builds: separate cache roots, same inputs.
    let cache_a = TempDir::new().expect("cache a");
    let first_path = out.path().join("first.tar");
    let first = BuildEngine::new(
        tar_plan("unused.invalid", &cache_a, &sources, &first_path),
        Logger::new_quiet(),
    )
    .expect("engine")
    .run()
    .await
    .expect("first build");

    let cache_b = TempDir::new().expect("cache b");
    let second_path = out.path().join("second.tar");
    let second = BuildEngine::new(
        tar_plan("unused.invalid", &cache_b, &sources, &second_path),
        Logger::new_quiet(),
    )
    .expect("engine")
    .run()
    .await
    .expect("second build");

    assert_eq!(first.manifest_bytes, second.manifest_bytes);
    assert_eq!(first.config_bytes, second.config_bytes);
    assert_eq!(first.image_digest, second.image_digest);

    // The whole export is byte-identical, not just the metadata.
    let first_tar = std::fs::read(&first_path).expect("first tar");
    let second_tar = std::fs::read(&second_path).expect("second tar");
    assert_eq!(first_tar, second_tar);
}

#[tokio::test]
async fn unchanged_inputs_build_zero_new_blobs() {
    let sources = TempDir::new().expect("sources");
    let cache = TempDir::new().expect("cache");
    let out = TempDir::new().expect("out");

    let first_path = out.path().join("first.tar");
    BuildEngine::new(
        tar_plan("unused.invalid", &cache, &sources, &first_path),
        Logger::new_quiet(),
    )
    .expect("engine")
    .run()
    .await
    .expect("first build");
    let blobs_after_first = cached_layer_count(cache.path());
    assert_eq!(blobs_after_first, 2, "one blob per application layer");

    let second_path = out.path().join("second.tar");
    BuildEngine::new(
        tar_plan("unused.invalid", &cache, &sources, &second_path),
        Logger::new_quiet(),
    )
    .expect("engine")
    .run()
    .await
    .expect("second build");

    assert_eq!(
        cached_layer_count(cache.path()),
        blobs_after_first,
        "cache hit must not create new blobs"
    );
}

#[tokio::test]
async fn layer_order_follows_the_plan() {
    let sources = TempDir::new().expect("sources");
    let cache = TempDir::new().expect("cache");
    let out = TempDir::new().expect("out");

    let path = out.path().join("image.tar");
    let result = BuildEngine::new(
        tar_plan("unused.invalid", &cache, &sources, &path),
        Logger::new_quiet(),
    )
    .expect("engine")
    .run()
    .await
    .expect("build");

    // diff_ids mirror the manifest's layer order: dependencies first,
    // classes second, exactly as the plan listed them.
    let manifest: serde_json::Value =
        serde_json::from_slice(&result.manifest_bytes).expect("manifest");
    let config: serde_json::Value =
        serde_json::from_slice(&result.config_bytes).expect("config");
    let layers = manifest["layers"].as_array().expect("layers");
    let diff_ids = config["rootfs"]["diff_ids"].as_array().expect("diff_ids");
    assert_eq!(layers.len(), 2);
    assert_eq!(diff_ids.len(), 2);

    let history: Vec<&str> = config["history"]
        .as_array()
        .expect("history")
        .iter()
        .map(|h| h["created_by"].as_str().expect("created_by"))
        .collect();
    assert_eq!(
        history,
        vec![
            "jvm-image-builder:dependencies",
            "jvm-image-builder:classes"
        ]
    );
}
