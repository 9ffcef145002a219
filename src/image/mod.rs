//! In-memory image model
//!
//! Image references, layer entries and reproducible tar construction, the
//! container configuration document, and the manifest variants the registry
//! speaks. Serializers here are bit-exact with the registry wire format.

pub mod config;
pub mod layer;
pub mod manifest;
pub mod reference;

pub use config::{ContainerConfig, ExecutionConfig, HistoryEntry, Platform, RootFs};
pub use layer::{EntryDefaults, LayerEntry, LayerTar, build_layer_tar, compute_selector};
pub use manifest::{
    ImageManifest, Manifest, ManifestDescriptor, ManifestList, Schema1Manifest, TargetFormat,
    media_types,
};
pub use reference::ImageReference;
