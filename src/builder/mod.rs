//! The build engine
//!
//! A directed acyclic graph of steps executed with bounded parallelism:
//! credentials, base-image metadata, application layers, per-layer pushes,
//! config and manifest synthesis. Terminal modes: push to a registry,
//! export to a tar file, load into a local Docker daemon.

pub mod app_layers;
pub mod base;
pub mod engine;
pub mod export;
pub mod plan;
pub mod progress;
pub mod push;
pub mod steps;

pub use app_layers::PreparedLayer;
pub use base::{BaseImage, BaseLayer};
pub use engine::{BuildEngine, BuildResult};
pub use plan::{BuildFlags, BuildPlan, ContainerSettings, LayerSpec, OutputTarget, Port};
pub use progress::{Allocation, ProgressTracker};
pub use push::LayerPushOutcome;
pub use steps::{CancelFlag, Scheduler, StepHandle, StepName};
