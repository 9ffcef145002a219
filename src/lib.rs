//! JVM Image Builder
//!
//! `jvm-image-builder` assembles an OCI / Docker v2.2 container image for a
//! JVM application — class files, resources and library dependencies as
//! separate layers on top of a base image — and publishes it directly to a
//! remote registry, to a local Docker daemon, or to a tar file, without a
//! Docker daemon in the build path.
//!
//! ## How a build runs
//!
//! The input is a fully-resolved [`builder::BuildPlan`]. The
//! [`builder::BuildEngine`] executes a dependency-ordered step graph with
//! bounded parallelism: base-image manifest and config pulls (walking
//! manifest lists by platform), application-layer construction (tar + gzip
//! + SHA-256, content-addressed caching), per-layer push negotiation
//! (existence probe, cross-repository mount, upload), and final config and
//! manifest synthesis and push.
//!
//! ## Main Modules
//! - [`blob`] - Digest primitives and the dual-digest gzip compressor.
//! - [`builder`] - The step DAG, build plan, and output modes.
//! - [`cache`] - Content-addressed layer and base-image metadata cache.
//! - [`credentials`] - Docker credential resolution chain.
//! - [`error`] - Error kinds and the crate `Result` alias.
//! - [`image`] - References, layers, container configs, manifests.
//! - [`logging`] - User-visible output control.
//! - [`paths`] - XDG-convention cache/config directories.
//! - [`registry`] - Docker Registry v2 / OCI Distribution client.

pub mod blob;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod credentials;
pub mod error;
pub mod image;
pub mod logging;
pub mod paths;
pub mod registry;

pub use builder::{BuildEngine, BuildPlan, BuildResult};
pub use error::{BuilderError, Result};
pub use image::ImageReference;
pub use logging::Logger;
