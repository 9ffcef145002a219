//! The step graph
//!
//! Each build step is spawned as a task and exposed as a cloneable
//! [`StepHandle`]; downstream steps await the handles of their dependencies,
//! so the dependency graph is exactly the set of `get()` calls. Heavy work
//! only starts after a scheduler slot is acquired, which bounds parallelism
//! without letting a waiting step occupy a worker. The first causal failure
//! is recorded, cancellation fans out to every running step, and dependents
//! observe a `Step`-wrapped clone of the error.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::error::{BuilderError, Result};

/// Names for every step the engine can schedule; per-layer steps carry the
/// layer index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepName {
    RetrieveBaseCredentials,
    RetrieveTargetCredentials,
    AuthenticatePush,
    PullBaseManifest,
    PullBaseConfig,
    CheckBaseLayer(usize),
    PullAndCacheBaseLayer(usize),
    BuildApplicationLayer(usize),
    PushLayer(usize),
    BuildContainerConfig,
    PushContainerConfig,
    PushManifest,
    ExportImage,
    LoadIntoDaemon,
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepName::RetrieveBaseCredentials => write!(f, "RetrieveBaseCredentials"),
            StepName::RetrieveTargetCredentials => write!(f, "RetrieveTargetCredentials"),
            StepName::AuthenticatePush => write!(f, "AuthenticatePush"),
            StepName::PullBaseManifest => write!(f, "PullBaseManifest"),
            StepName::PullBaseConfig => write!(f, "PullBaseConfig"),
            StepName::CheckBaseLayer(i) => write!(f, "CheckBaseLayer[{}]", i),
            StepName::PullAndCacheBaseLayer(i) => write!(f, "PullAndCacheBaseLayer[{}]", i),
            StepName::BuildApplicationLayer(i) => write!(f, "BuildApplicationLayer[{}]", i),
            StepName::PushLayer(i) => write!(f, "PushLayer[{}]", i),
            StepName::BuildContainerConfig => write!(f, "BuildContainerConfig"),
            StepName::PushContainerConfig => write!(f, "PushContainerConfig"),
            StepName::PushManifest => write!(f, "PushManifest"),
            StepName::ExportImage => write!(f, "ExportImage"),
            StepName::LoadIntoDaemon => write!(f, "LoadIntoDaemon"),
        }
    }
}

/// Build-level cancellation signal. Cooperative: running steps observe it at
/// their next await point, in-flight HTTP futures are dropped (closing the
/// socket), and steps waiting on dependencies resolve to `Cancelled`.
#[derive(Clone)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: std::sync::atomic::AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner
            .cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves when (or immediately if) the flag is set.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

type SharedResult<T> = std::result::Result<Arc<T>, BuilderError>;

/// Cloneable handle to one step's (eventual) result.
pub struct StepHandle<T> {
    name: StepName,
    future: Shared<BoxFuture<'static, SharedResult<T>>>,
}

impl<T> Clone for StepHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            future: self.future.clone(),
        }
    }
}

impl<T> StepHandle<T> {
    pub fn name(&self) -> &StepName {
        &self.name
    }

    /// Await the step's result. Failures arrive wrapped as
    /// `Step { step, source }` naming the failing step.
    pub async fn get(&self) -> Result<Arc<T>> {
        self.future.clone().await
    }
}

/// Bounded-parallelism scheduler for the step DAG.
#[derive(Clone)]
pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    cancel: CancelFlag,
    first_failure: Arc<Mutex<Option<(StepName, BuilderError)>>>,
}

impl Scheduler {
    pub fn new(concurrency: usize, cancel: CancelFlag) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel,
            first_failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Spawn a step. The future should await its dependency handles first
    /// and call [`Scheduler::slot`] before doing heavy work.
    pub fn submit<T, F>(&self, name: StepName, step: F) -> StepHandle<T>
    where
        T: Send + Sync + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let failures = self.first_failure.clone();
        let step_name = name.clone();

        let task = tokio::spawn(async move {
            if cancel.is_cancelled() {
                return Err(BuilderError::Step {
                    step: step_name.to_string(),
                    source: Box::new(BuilderError::Cancelled),
                });
            }
            let result = tokio::select! {
                result = step => result,
                _ = cancel.cancelled() => Err(BuilderError::Cancelled),
            };
            match result {
                Ok(value) => Ok(Arc::new(value)),
                Err(err) => {
                    // The first causal failure wins; cancellation fallout
                    // from other steps is not recorded over it.
                    if !matches!(err.root_cause(), BuilderError::Cancelled) {
                        let mut slot = failures.lock().unwrap_or_else(|e| e.into_inner());
                        if slot.is_none() {
                            *slot = Some((step_name.clone(), err.clone()));
                        }
                        drop(slot);
                        cancel.cancel();
                    }
                    Err(BuilderError::Step {
                        step: step_name.to_string(),
                        source: Box::new(err),
                    })
                }
            }
        });

        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => Err(BuilderError::Registry(format!(
                    "step task failed: {}",
                    join_err
                ))),
            }
        }
        .boxed()
        .shared();

        StepHandle { name, future }
    }

    /// Acquire a worker slot; held for the duration of a step's heavy work.
    pub async fn slot(&self) -> Result<OwnedSemaphorePermit> {
        if self.cancel.is_cancelled() {
            return Err(BuilderError::Cancelled);
        }
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BuilderError::Cancelled)
    }

    /// The first causal failure recorded by any step.
    pub fn first_failure(&self) -> Option<(StepName, BuilderError)> {
        self.first_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
