//! The build engine
//!
//! Wires the step DAG for one build plan and runs it to completion:
//!
//! ```text
//! RetrieveBaseCredentials ──► PullBaseManifest ──► PullBaseConfig ─┐
//!                                              └─► (per layer)     │
//!                                                  CheckBaseLayer  │
//!                                                  PullAndCacheBaseLayer
//! RetrieveTargetCredentials ──► AuthenticatePush ─────────────────┤
//! BuildApplicationLayers (per layer) ─────────────────────────────┤
//!                                                                 ▼
//!                                                            PushLayers
//!                                                                 ▼
//!                                                      BuildContainerConfig
//!                                                                 ▼
//!                                                       PushContainerConfig
//!                                                                 ▼
//!                                                  PushManifest (+ extra tags)
//! ```
//!
//! Base layers precede application layers everywhere; `diff_ids` mirror the
//! layer order exactly. The daemon and tar outputs skip the push column and
//! run the export steps instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::blob::{Descriptor, Digest};
use crate::cache::{CachedLayer, LayerCache};
use crate::credentials::{Credential, CredentialResolver};
use crate::error::{BuilderError, Result};
use crate::image::config::{ContainerConfig, HistoryEntry, epoch_timestamp, format_timestamp};
use crate::image::manifest::{ImageManifest, ManifestDescriptor};
use crate::image::reference::ImageReference;
use crate::logging::Logger;
use crate::paths;
use crate::registry::{Access, RegistryClient, RetryPolicy};
use crate::registry::client::DEFAULT_HTTP_TIMEOUT;

use super::app_layers::{PreparedLayer, build_application_layer};
use super::base::{
    BaseImage, ResolvedBaseManifest, base_layer_manifest_descriptor, pull_and_cache_base_layer,
    pull_base_config, pull_base_manifest,
};
use super::export::{ExportImage, ExportLayer, export_to_tar_file, load_into_daemon};
use super::plan::{BuildPlan, ContainerSettings, OutputTarget};
use super::progress::{Allocation, ProgressTracker};
use super::push::{LayerPushOutcome, mount_or_upload, push_config_blob, push_manifest_tags};
use super::steps::{CancelFlag, Scheduler, StepHandle, StepName};

/// What a finished build produced.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub image_digest: Digest,
    pub tags: Vec<String>,
    pub manifest_bytes: Vec<u8>,
    pub config_bytes: Vec<u8>,
    pub layers_skipped: usize,
    pub layers_mounted: usize,
    pub layers_uploaded: usize,
}

/// Output of the PullBaseManifest step: the connected base client (when one
/// is needed) plus the platform-resolved manifest.
struct BaseManifestOutput {
    client: Option<Arc<RegistryClient>>,
    resolved: ResolvedBaseManifest,
}

pub struct BuildEngine {
    plan: BuildPlan,
    output: Logger,
    cancel: CancelFlag,
}

impl BuildEngine {
    pub fn new(plan: BuildPlan, output: Logger) -> Result<Self> {
        plan.validate()?;
        Ok(Self {
            plan,
            output,
            cancel: CancelFlag::new(),
        })
    }

    /// Handle the caller can use to abort the build from another task.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<BuildResult> {
        let cache = LayerCache::open(self.cache_root()?, self.output.clone())?;
        let result = self.run_steps(&cache).await;
        if result.is_err() {
            // Finalize resources on every exit path.
            cache.clean_temp();
        }
        result
    }

    fn cache_root(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.plan.flags.cache_dir {
            return Ok(dir.clone());
        }
        if self.plan.flags.use_only_project_cache {
            return Ok(PathBuf::from(".jvm-image-builder-cache"));
        }
        paths::base_directory(paths::Purpose::Cache)
    }

    fn retry_policy(&self) -> RetryPolicy {
        let deadline = self
            .plan
            .flags
            .deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        RetryPolicy::default().with_deadline(deadline)
    }

    fn http_timeout(&self) -> Duration {
        self.plan
            .flags
            .http_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT)
    }

    async fn run_steps(&self, cache: &LayerCache) -> Result<BuildResult> {
        let plan = &self.plan;
        let output = &self.output;
        let scheduler = Scheduler::new(plan.flags.concurrency, self.cancel.clone());
        let progress = ProgressTracker::new(output.clone());
        let build_progress = progress.root();

        output.section(&format!(
            "Building {} from {}",
            plan.target_image, plan.base_image
        ));

        // --- Stage 1: credentials, base metadata, application layers ------

        let base_credentials = self.submit_credentials(
            &scheduler,
            StepName::RetrieveBaseCredentials,
            plan.base_image.registry(),
            plan.credentials.base.inline_credential(),
            plan.credentials.base.helper.clone(),
        );
        let base_manifest_step = self.submit_base_manifest(&scheduler, cache, base_credentials);
        let base_config_step = self.submit_base_config(&scheduler, cache, &base_manifest_step);

        let app_layer_steps: Vec<StepHandle<PreparedLayer>> = plan
            .layers
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let scheduler_clone = scheduler.clone();
                let cache = cache.clone();
                let spec = spec.clone();
                let format = plan.format;
                let output = output.clone();
                scheduler.submit(StepName::BuildApplicationLayer(index), async move {
                    let _slot = scheduler_clone.slot().await?;
                    build_application_layer(&cache, &spec, format, &output).await
                })
            })
            .collect();

        // --- Stage 2: the base image is known; fan out per-layer steps ----

        let base_image = base_config_step.get().await.map_err(|err| {
            self.prefer_first_failure(&scheduler, err)
        })?;
        output.step(&format!(
            "base image {} ({}): {} layers",
            base_image.reference,
            base_image.manifest_digest,
            base_image.layers.len()
        ));
        let base_progress = build_progress.split(0.3);
        base_progress.complete();

        let result = match &plan.output {
            OutputTarget::Registry => {
                self.push_to_registry(
                    &scheduler,
                    cache,
                    &base_manifest_step,
                    base_image.clone(),
                    app_layer_steps,
                    build_progress.split(0.6),
                )
                .await
            }
            OutputTarget::Daemon | OutputTarget::Tar { .. } => {
                self.export_image(
                    &scheduler,
                    cache,
                    &base_manifest_step,
                    base_image.clone(),
                    app_layer_steps,
                    build_progress.split(0.6),
                )
                .await
            }
        };
        build_progress.complete();

        match result {
            Ok(result) => {
                output.summary_kv(
                    "Build complete",
                    &[
                        ("image", format!("{}", plan.target_image)),
                        ("digest", result.image_digest.to_string()),
                        ("tags", result.tags.join(", ")),
                        (
                            "layers",
                            format!(
                                "{} skipped, {} mounted, {} uploaded",
                                result.layers_skipped,
                                result.layers_mounted,
                                result.layers_uploaded
                            ),
                        ),
                    ],
                );
                Ok(result)
            }
            Err(err) => Err(self.prefer_first_failure(&scheduler, err)),
        }
    }

    /// Surface the first causal failure, not whichever dependent step
    /// happened to report first.
    fn prefer_first_failure(&self, scheduler: &Scheduler, err: BuilderError) -> BuilderError {
        match scheduler.first_failure() {
            Some((name, causal)) => BuilderError::Step {
                step: name.to_string(),
                source: Box::new(causal),
            },
            None => err,
        }
    }

    fn submit_credentials(
        &self,
        scheduler: &Scheduler,
        name: StepName,
        registry: &str,
        inline: Option<Credential>,
        helper: Option<String>,
    ) -> StepHandle<Option<Credential>> {
        let offline = self.plan.flags.offline;
        let registry = registry.to_string();
        let output = self.output.clone();
        scheduler.submit(name, async move {
            if offline {
                return Ok(None);
            }
            let resolver = CredentialResolver::standard(inline, helper, output);
            resolver.resolve(&registry).await
        })
    }

    fn submit_base_manifest(
        &self,
        scheduler: &Scheduler,
        cache: &LayerCache,
        credentials: StepHandle<Option<Credential>>,
    ) -> StepHandle<BaseManifestOutput> {
        let plan = self.plan.clone();
        let cache = cache.clone();
        let output = self.output.clone();
        let scheduler_clone = scheduler.clone();
        let retry = self.retry_policy();
        let timeout = self.http_timeout();

        scheduler.submit(StepName::PullBaseManifest, async move {
            let credential = credentials.get().await?;
            let _slot = scheduler_clone.slot().await?;

            let offline = plan.flags.offline;
            let needs_client = !offline && !plan.base_image.is_scratch();
            let client = if needs_client {
                let mut client = RegistryClient::builder(
                    plan.base_image.registry(),
                    plan.base_image.repository(),
                )
                .with_access(Access::Pull)
                .with_credential((*credential).clone())
                .with_allow_insecure(plan.flags.allow_insecure)
                .with_timeout(timeout)
                .with_retry(retry)
                .with_output(output.clone())
                .build()?;
                client.connect().await?;
                Some(Arc::new(client))
            } else {
                None
            };

            let resolved = pull_base_manifest(
                client.as_deref(),
                &cache,
                &plan.base_image,
                &plan.platform,
                offline,
                &output,
            )
            .await?;
            Ok(BaseManifestOutput { client, resolved })
        })
    }

    fn submit_base_config(
        &self,
        scheduler: &Scheduler,
        cache: &LayerCache,
        manifest_step: &StepHandle<BaseManifestOutput>,
    ) -> StepHandle<BaseImage> {
        let plan = self.plan.clone();
        let cache = cache.clone();
        let output = self.output.clone();
        let scheduler_clone = scheduler.clone();
        let manifest_step = manifest_step.clone();

        scheduler.submit(StepName::PullBaseConfig, async move {
            let manifest = manifest_step.get().await?;
            let _slot = scheduler_clone.slot().await?;
            pull_base_config(
                manifest.client.as_deref(),
                &cache,
                &plan.base_image,
                &plan.platform,
                &manifest.resolved,
                &output,
            )
            .await
        })
    }

    /// Submit PullAndCacheBaseLayer steps for every base layer.
    fn submit_base_materialization(
        &self,
        scheduler: &Scheduler,
        cache: &LayerCache,
        manifest_step: &StepHandle<BaseManifestOutput>,
        base_image: &Arc<BaseImage>,
    ) -> Vec<StepHandle<CachedLayer>> {
        base_image
            .layers
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                let scheduler_clone = scheduler.clone();
                let cache = cache.clone();
                let manifest_step = manifest_step.clone();
                let layer = layer.clone();
                let output = self.output.clone();
                scheduler.submit(StepName::PullAndCacheBaseLayer(index), async move {
                    let manifest = manifest_step.get().await?;
                    let _slot = scheduler_clone.slot().await?;
                    pull_and_cache_base_layer(
                        manifest.client.as_deref(),
                        &cache,
                        &layer,
                        &output,
                    )
                    .await
                })
            })
            .collect()
    }

    async fn push_to_registry(
        &self,
        scheduler: &Scheduler,
        cache: &LayerCache,
        manifest_step: &StepHandle<BaseManifestOutput>,
        base_image: Arc<BaseImage>,
        app_layer_steps: Vec<StepHandle<PreparedLayer>>,
        progress: Allocation,
    ) -> Result<BuildResult> {
        let plan = &self.plan;
        let output = &self.output;

        // AuthenticatePush: the target client with push scope.
        let target_credentials = self.submit_credentials(
            scheduler,
            StepName::RetrieveTargetCredentials,
            plan.target_image.registry(),
            plan.credentials.target.inline_credential(),
            plan.credentials.target.helper.clone(),
        );
        let target_client_step: StepHandle<RegistryClient> = {
            let scheduler_clone = scheduler.clone();
            let plan = plan.clone();
            let output = output.clone();
            let retry = self.retry_policy();
            let timeout = self.http_timeout();
            scheduler.submit(StepName::AuthenticatePush, async move {
                let credential = target_credentials.get().await?;
                let _slot = scheduler_clone.slot().await?;
                let mut client = RegistryClient::builder(
                    plan.target_image.registry(),
                    plan.target_image.repository(),
                )
                .with_access(Access::Push)
                .with_credential((*credential).clone())
                .with_allow_insecure(plan.flags.allow_insecure)
                .with_timeout(timeout)
                .with_retry(retry)
                .with_output(output.clone())
                .build()?;
                client.connect().await?;
                Ok(client)
            })
        };

        // Schema 1 bases carry no diff ids; materialize to recover them.
        let materialized = if base_image.requires_materialization {
            Some(self.submit_base_materialization(scheduler, cache, manifest_step, &base_image))
        } else {
            None
        };

        // Mounts come from the base repository when both images share a
        // registry host.
        let mount_source = plan
            .base_image
            .same_registry_as(&plan.target_image)
            .then(|| plan.base_image.repository().to_string());

        // CheckBaseLayer + PushLayer per base layer. Base bytes are never
        // pulled just to push: the closure materializes only when the HEAD
        // missed and the mount failed (e.g. a cross-registry base).
        let mut push_steps: Vec<StepHandle<LayerPushOutcome>> = Vec::new();
        for (index, layer) in base_image.layers.iter().enumerate() {
            let check_step: StepHandle<Option<u64>> = {
                let scheduler_clone = scheduler.clone();
                let target_client_step = target_client_step.clone();
                let digest = layer.descriptor.digest;
                scheduler.submit(StepName::CheckBaseLayer(index), async move {
                    let client = target_client_step.get().await?;
                    let _slot = scheduler_clone.slot().await?;
                    client.check_blob(&digest).await
                })
            };

            let scheduler_clone = scheduler.clone();
            let target_client_step = target_client_step.clone();
            let manifest_step = manifest_step.clone();
            let cache = cache.clone();
            let layer = layer.clone();
            let mount_source = mount_source.clone();
            let materialized_step = materialized.as_ref().map(|steps| steps[index].clone());
            let output = output.clone();
            push_steps.push(scheduler.submit(StepName::PushLayer(index), async move {
                let existing = check_step.get().await?;
                if existing.is_some() {
                    output.detail(&format!(
                        "base layer {} already in target repository",
                        layer.descriptor.digest
                    ));
                    return Ok(LayerPushOutcome::AlreadyPresent);
                }
                let client = target_client_step.get().await?;
                // Resolve the materialization step (it needs its own worker
                // slot) before this step takes one.
                let prefetched = match &materialized_step {
                    Some(step) => Some((*step.get().await?).clone()),
                    None => None,
                };
                let _slot = scheduler_clone.slot().await?;
                let descriptor = layer.descriptor.clone();
                mount_or_upload(
                    &client,
                    &descriptor,
                    mount_source.as_deref(),
                    || async {
                        let cached = match &prefetched {
                            Some(cached) => cached.clone(),
                            // Cross-registry fallback: pull the base layer
                            // only now that the mount has failed.
                            None => {
                                let manifest = manifest_step.get().await?;
                                pull_and_cache_base_layer(
                                    manifest.client.as_deref(),
                                    &cache,
                                    &layer,
                                    &output,
                                )
                                .await?
                            }
                        };
                        Ok(tokio::fs::read(&cached.blob_path).await?)
                    },
                    &output,
                )
                .await
            }));
        }

        // PushLayer per application layer (HEAD-skip, then upload; no mount
        // source to try).
        let base_count = base_image.layers.len();
        for (index, layer_step) in app_layer_steps.iter().enumerate() {
            let scheduler_clone = scheduler.clone();
            let target_client_step = target_client_step.clone();
            let layer_step = layer_step.clone();
            let output = output.clone();
            push_steps.push(scheduler.submit(
                StepName::PushLayer(base_count + index),
                async move {
                    let layer = layer_step.get().await?;
                    let client = target_client_step.get().await?;
                    let _slot = scheduler_clone.slot().await?;
                    let blob_path = layer.blob_path.clone();
                    super::push::push_layer_blob(
                        &client,
                        &layer.descriptor,
                        None,
                        || async { Ok(tokio::fs::read(&blob_path).await?) },
                        &output,
                    )
                    .await
                },
            ));
        }

        // BuildContainerConfig: all diff ids in final order.
        let app_layers = {
            let mut layers = Vec::with_capacity(app_layer_steps.len());
            for step in &app_layer_steps {
                layers.push(step.get().await?);
            }
            layers
        };
        let base_diff_ids = match &materialized {
            Some(steps) => {
                let mut diff_ids = Vec::with_capacity(steps.len());
                for step in steps {
                    diff_ids.push(step.get().await?.diff_id);
                }
                diff_ids
            }
            None => base_image.config.rootfs.diff_ids.clone(),
        };
        let config = compose_config(
            &base_image,
            &base_diff_ids,
            &app_layers,
            &plan.container,
        )?;
        let config_bytes = config.to_bytes()?;

        // PushContainerConfig.
        let target_client = target_client_step.get().await?;
        let config_descriptor =
            push_config_blob(&target_client, &config_bytes, output).await?;

        // PushManifest waits for every layer push.
        let mut skipped = 0usize;
        let mut mounted = 0usize;
        let mut uploaded = 0usize;
        let layer_shares = progress.split_even(push_steps.len());
        for (step, share) in push_steps.iter().zip(layer_shares) {
            match *step.get().await? {
                LayerPushOutcome::AlreadyPresent => skipped += 1,
                LayerPushOutcome::Mounted => mounted += 1,
                LayerPushOutcome::Uploaded => uploaded += 1,
            }
            share.complete();
        }
        progress.complete();

        let manifest = compose_manifest(
            plan,
            &base_image,
            materialized.as_ref(),
            &app_layers,
            &config_descriptor,
        )
        .await?;
        let manifest_bytes = manifest.to_bytes()?;
        let tags = plan.all_tags();
        let image_digest = push_manifest_tags(
            &target_client,
            &manifest_bytes,
            manifest.effective_media_type(),
            &tags,
            output,
        )
        .await?;

        Ok(BuildResult {
            image_digest,
            tags,
            manifest_bytes,
            config_bytes,
            layers_skipped: skipped,
            layers_mounted: mounted,
            layers_uploaded: uploaded,
        })
    }

    async fn export_image(
        &self,
        scheduler: &Scheduler,
        cache: &LayerCache,
        manifest_step: &StepHandle<BaseManifestOutput>,
        base_image: Arc<BaseImage>,
        app_layer_steps: Vec<StepHandle<PreparedLayer>>,
        progress: Allocation,
    ) -> Result<BuildResult> {
        let plan = &self.plan;
        let output = &self.output;

        // Exports always need base layer bytes locally.
        let materialized =
            self.submit_base_materialization(scheduler, cache, manifest_step, &base_image);
        let layer_shares = progress.split_even(materialized.len() + app_layer_steps.len());
        let mut layer_shares = layer_shares.into_iter();

        let mut export_layers = Vec::new();
        let mut base_diff_ids = Vec::new();
        for step in &materialized {
            let cached = step.get().await?;
            base_diff_ids.push(cached.diff_id);
            export_layers.push(ExportLayer {
                digest: cached.digest,
                blob_path: cached.blob_path.clone(),
            });
            if let Some(share) = layer_shares.next() {
                share.complete();
            }
        }

        let mut app_layers = Vec::with_capacity(app_layer_steps.len());
        for step in &app_layer_steps {
            let layer = step.get().await?;
            export_layers.push(ExportLayer {
                digest: layer.descriptor.digest,
                blob_path: layer.blob_path.clone(),
            });
            app_layers.push(layer);
            if let Some(share) = layer_shares.next() {
                share.complete();
            }
        }

        let config = compose_config(
            &base_image,
            &base_diff_ids,
            &app_layers,
            &plan.container,
        )?;
        let config_bytes = config.to_bytes()?;

        let config_descriptor = Descriptor::new(
            Digest::of_bytes(&config_bytes),
            config_bytes.len() as u64,
        );
        let manifest = compose_manifest(
            plan,
            &base_image,
            Some(&materialized),
            &app_layers,
            &config_descriptor,
        )
        .await?;
        let manifest_bytes = manifest.to_bytes()?;
        let image_digest = Digest::of_bytes(&manifest_bytes);

        let tags = plan.all_tags();
        let export = ExportImage {
            config_bytes: config_bytes.clone(),
            layers: export_layers,
            repo_tags: tags.iter().map(|tag| repo_tag(&plan.target_image, tag)).collect(),
        };

        match &plan.output {
            OutputTarget::Tar { path } => {
                let export = export.clone();
                let path = path.clone();
                let output_clone = output.clone();
                let step = scheduler.submit(StepName::ExportImage, async move {
                    tokio::task::spawn_blocking(move || {
                        export_to_tar_file(&export, &path, &output_clone)
                    })
                    .await
                    .map_err(|err| BuilderError::Io(format!("export task: {}", err)))?
                });
                step.get().await?;
            }
            OutputTarget::Daemon => {
                let export = export.clone();
                let output_clone = output.clone();
                let step = scheduler.submit(StepName::LoadIntoDaemon, async move {
                    load_into_daemon(&export, &output_clone).await
                });
                step.get().await?;
            }
            OutputTarget::Registry => unreachable!("registry output handled elsewhere"),
        }
        progress.complete();

        Ok(BuildResult {
            image_digest,
            tags,
            manifest_bytes,
            config_bytes,
            layers_skipped: 0,
            layers_mounted: 0,
            layers_uploaded: 0,
        })
    }
}

/// `repository:tag` (with the registry host for non-Docker-Hub targets) as
/// recorded in export metadata.
fn repo_tag(reference: &ImageReference, tag: &str) -> String {
    if reference.uses_default_registry() {
        format!("{}:{}", reference.repository(), tag)
    } else {
        format!("{}/{}:{}", reference.registry(), reference.repository(), tag)
    }
}

/// Compose the output container config: base config plus plan settings plus
/// one history record per application layer, `diff_ids` in final layer
/// order.
fn compose_config(
    base: &BaseImage,
    base_diff_ids: &[Digest],
    app_layers: &[Arc<PreparedLayer>],
    settings: &ContainerSettings,
) -> Result<ContainerConfig> {
    let created = settings
        .created
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_else(epoch_timestamp);

    let mut config = base.config.clone();
    config.created = Some(created.clone());
    config.rootfs.diff_ids = base_diff_ids.to_vec();

    // Plan settings override; environment merges by variable name so base
    // variables survive unless shadowed.
    if settings.entrypoint.is_some() {
        config.config.entrypoint = settings.entrypoint.clone();
    }
    if settings.cmd.is_some() {
        config.config.cmd = settings.cmd.clone();
    }
    if let Some(user) = &settings.user {
        config.config.user = Some(user.clone());
    }
    if let Some(working_dir) = &settings.working_dir {
        config.config.working_dir = Some(working_dir.clone());
    }
    if !settings.env.is_empty() {
        let mut env = config.config.env.clone().unwrap_or_default();
        for entry in &settings.env {
            let name = entry.split('=').next().unwrap_or(entry);
            let prefix = format!("{}=", name);
            match env.iter_mut().find(|existing| existing.starts_with(&prefix)) {
                Some(existing) => *existing = entry.clone(),
                None => env.push(entry.clone()),
            }
        }
        config.config.env = Some(env);
    }
    if !settings.labels.is_empty() {
        let mut labels = config.config.labels.clone().unwrap_or_default();
        labels.extend(settings.labels.clone());
        config.config.labels = Some(labels);
    }
    if !settings.exposed_ports.is_empty() {
        let mut ports = config.config.exposed_ports.clone().unwrap_or_default();
        for port in &settings.exposed_ports {
            ports.entry(port.to_string()).or_default();
        }
        config.config.exposed_ports = Some(ports);
    }
    if !settings.volumes.is_empty() {
        let mut volumes = config.config.volumes.clone().unwrap_or_default();
        for volume in &settings.volumes {
            volumes.entry(volume.clone()).or_default();
        }
        config.config.volumes = Some(volumes);
    }

    for layer in app_layers {
        config.append_layer(
            layer.diff_id,
            HistoryEntry {
                created: Some(created.clone()),
                author: Some("jvm-image-builder".to_string()),
                created_by: Some(format!("jvm-image-builder:{}", layer.name)),
                comment: None,
                empty_layer: None,
            },
        );
    }

    Ok(config)
}

/// Compose the output manifest: base layer descriptors first (materialized
/// sizes win when the wire manifest had none), then application layers.
async fn compose_manifest(
    plan: &BuildPlan,
    base: &BaseImage,
    materialized: Option<&Vec<StepHandle<CachedLayer>>>,
    app_layers: &[Arc<PreparedLayer>],
    config_descriptor: &Descriptor,
) -> Result<ImageManifest> {
    let mut layers = Vec::with_capacity(base.layers.len() + app_layers.len());
    for (index, layer) in base.layers.iter().enumerate() {
        let mut descriptor = base_layer_manifest_descriptor(layer, plan.format);
        if descriptor.size == 0 {
            if let Some(steps) = materialized {
                descriptor.size = steps[index].get().await?.size;
            }
        }
        layers.push(descriptor);
    }
    for layer in app_layers {
        layers.push(ManifestDescriptor {
            media_type: layer
                .descriptor
                .media_type
                .clone()
                .unwrap_or_else(|| plan.format.layer_media_type().to_string()),
            size: layer.descriptor.size,
            digest: layer.descriptor.digest,
        });
    }

    let config = ManifestDescriptor {
        media_type: plan.format.config_media_type().to_string(),
        size: config_descriptor.size,
        digest: config_descriptor.digest,
    };
    Ok(ImageManifest::new(plan.format, config, layers))
}
