//! Command line shell
//!
//! A thin runner around the engine: the build plan arrives as a JSON file
//! produced by a build-tool front end, and the flags here only override the
//! plan's own switches. No project discovery happens in this binary.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::builder::{BuildPlan, OutputTarget};
use crate::error::{BuilderError, Result};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "jvm-image-builder",
    version,
    about = "Build and publish a container image for a JVM application without a Docker daemon",
    long_about = "Reads a fully-resolved build plan (JSON) and executes it: pulls base image \
                  metadata, assembles application layers, and pushes the image to a registry, \
                  a tar file, or the local Docker daemon."
)]
pub struct Args {
    /// Path to the build plan JSON file
    #[arg(short, long, value_name = "FILE")]
    pub plan: PathBuf,

    /// Run offline: base image metadata must already be cached
    #[arg(long, action = ArgAction::SetTrue)]
    pub offline: bool,

    /// Allow plain-HTTP registries and broken TLS certificates
    #[arg(long, action = ArgAction::SetTrue)]
    pub allow_insecure: bool,

    /// Override the step concurrency limit from the plan
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Override the cache directory
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Write the image to this tar file instead of the plan's output
    #[arg(long, value_name = "FILE", conflicts_with = "to_daemon")]
    pub to_tar: Option<PathBuf>,

    /// Load the image into the local Docker daemon instead of the plan's
    /// output
    #[arg(long, action = ArgAction::SetTrue)]
    pub to_daemon: bool,

    /// Enable detailed output
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Suppress everything except errors
    #[arg(short, long, action = ArgAction::SetTrue, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Load the plan file and fold the command-line overrides into it.
    pub fn load_plan(&self) -> Result<BuildPlan> {
        let raw = std::fs::read_to_string(&self.plan).map_err(|err| {
            BuilderError::Validation(format!(
                "cannot read build plan '{}': {}",
                self.plan.display(),
                err
            ))
        })?;
        let mut plan: BuildPlan = serde_json::from_str(&raw).map_err(|err| {
            BuilderError::Validation(format!(
                "build plan '{}' is not valid: {}",
                self.plan.display(),
                err
            ))
        })?;

        if self.offline {
            plan.flags.offline = true;
        }
        if self.allow_insecure {
            plan.flags.allow_insecure = true;
        }
        if let Some(concurrency) = self.concurrency {
            plan.flags.concurrency = concurrency;
        }
        if let Some(cache_dir) = &self.cache_dir {
            plan.flags.cache_dir = Some(cache_dir.clone());
        }
        if let Some(path) = &self.to_tar {
            plan.output = OutputTarget::Tar { path: path.clone() };
        } else if self.to_daemon {
            plan.output = OutputTarget::Daemon;
        }

        plan.validate()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plan(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("plan.json");
        std::fs::write(
            &path,
            r#"{
                "base_image": "eclipse-temurin:17-jre",
                "target_image": "my.reg/org/app:1.0"
            }"#,
        )
        .expect("write plan");
        path
    }

    #[test]
    fn overrides_fold_into_the_plan() {
        let dir = TempDir::new().expect("dir");
        let args = Args {
            plan: write_plan(&dir),
            offline: false,
            allow_insecure: true,
            concurrency: Some(8),
            cache_dir: Some(PathBuf::from("/tmp/cache")),
            to_tar: Some(PathBuf::from("/tmp/image.tar")),
            to_daemon: false,
            verbose: false,
            quiet: false,
        };
        let plan = args.load_plan().expect("plan");
        assert!(plan.flags.allow_insecure);
        assert_eq!(plan.flags.concurrency, 8);
        assert_eq!(plan.flags.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(
            plan.output,
            OutputTarget::Tar {
                path: PathBuf::from("/tmp/image.tar")
            }
        );
    }

    #[test]
    fn missing_plan_file_is_a_validation_error() {
        let args = Args {
            plan: PathBuf::from("/definitely/not/here.json"),
            offline: false,
            allow_insecure: false,
            concurrency: None,
            cache_dir: None,
            to_tar: None,
            to_daemon: false,
            verbose: false,
            quiet: false,
        };
        assert!(matches!(
            args.load_plan(),
            Err(BuilderError::Validation(_))
        ));
    }
}
