//! Docker Registry v2 / OCI Distribution client
//!
//! One [`RegistryClient`] instance per (registry, repository) pair. The
//! client owns its authentication state machine and retry policy; blob and
//! manifest endpoints live in their own modules.

pub mod auth;
pub mod blobs;
pub mod client;
pub mod manifests;
pub mod retry;
pub mod token_manager;

pub use auth::{Access, AuthChallenge};
pub use blobs::{MONOLITHIC_UPLOAD_LIMIT, MountOutcome};
pub use client::{DEFAULT_HTTP_TIMEOUT, RegistryClient, RegistryClientBuilder};
pub use manifests::PulledManifest;
pub use retry::RetryPolicy;
pub use token_manager::TokenManager;
