//! Per-leaf context handle.
//!
//! A [`Context`] is threaded through every hook, body, and teardown of one
//! leaf. It carries the adapters (bound to the leaf's cancellation token), a
//! typed state bag for passing values from before-each hooks to bodies, the
//! LIFO teardown stack, and the sending half of the leaf's failure channel.
//! Worker tasks get a child handle from [`Context::spawn`] and are tracked
//! so the runner can settle them before the leaf's outcome is read.

use crate::error::{Error, Result};
use crate::fixture::Fixtures;
use crate::image::ImageClient;
use crate::runtime::RuntimeClient;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Process-wide adapters shared by every leaf.
pub struct Environment {
    pub runtime: RuntimeClient,
    pub images: ImageClient,
    pub fixtures: Fixtures,
}

impl Environment {
    pub fn new(runtime: RuntimeClient) -> Self {
        Self {
            images: runtime.images().clone(),
            fixtures: Fixtures::new(runtime.clone()),
            runtime,
        }
    }
}

type Teardown = (String, Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>);

/// Handle owned by one leaf (and its workers).
#[derive(Clone)]
pub struct Context {
    path: Arc<str>,
    runtime: RuntimeClient,
    images: ImageClient,
    env: Arc<Environment>,
    cancel: CancellationToken,
    state: Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send>>>>,
    teardowns: Arc<Mutex<Vec<Teardown>>>,
    failures: mpsc::UnboundedSender<String>,
    workers: TaskTracker,
    aborts: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Context {
    pub(crate) fn new(
        env: Arc<Environment>,
        path: &str,
        cancel: CancellationToken,
        failures: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            path: Arc::from(path),
            runtime: env.runtime.with_cancellation(cancel.clone()),
            images: env.images.with_cancellation(cancel.clone()),
            env,
            cancel,
            state: Arc::default(),
            teardowns: Arc::default(),
            failures,
            workers: TaskTracker::new(),
            aborts: Arc::default(),
        }
    }

    /// Full label path of the leaf.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn runtime(&self) -> &RuntimeClient {
        &self.runtime
    }

    pub fn images(&self) -> &ImageClient {
        &self.images
    }

    pub fn fixtures(&self) -> &Fixtures {
        &self.env.fixtures
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Stores a value for later hooks of the same leaf, replacing any value
    /// of the same type.
    pub fn set<T: Any + Send>(&self, value: T) {
        lock(&self.state).insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Returns a copy of a value stored with [`Context::set`].
    pub fn get<T: Any + Send + Clone>(&self) -> Result<T> {
        lock(&self.state)
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
            .ok_or_else(|| {
                Error::Internal(format!(
                    "no {} stored in context of '{}'",
                    std::any::type_name::<T>(),
                    self.path
                ))
            })
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Registers a teardown. Teardowns run in LIFO order after the body,
    /// whether it passed or not.
    pub fn defer<F, Fut>(&self, label: impl Into<String>, teardown: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        lock(&self.teardowns).push((label.into(), Box::new(move || teardown().boxed())));
    }

    /// Registers removal of a sandbox (stop + remove, `NotFound` tolerated).
    ///
    /// Removal helpers use the unbound adapters so cleanup still runs after
    /// the leaf is cancelled; each call stays bounded by the call timeout.
    pub fn defer_sandbox_removal(&self, id: &str) {
        let runtime = self.env.runtime.clone();
        let id = id.to_string();
        self.defer(format!("remove sandbox {id}"), move || async move {
            runtime.teardown_sandbox(&id).await
        });
    }

    /// Registers removal of a container (`NotFound` tolerated).
    pub fn defer_container_removal(&self, id: &str) {
        let runtime = self.env.runtime.clone();
        let id = id.to_string();
        self.defer(format!("remove container {id}"), move || async move {
            runtime.teardown_container(&id).await
        });
    }

    /// Registers removal of an image (idempotent).
    pub fn defer_image_removal(&self, reference: &str) {
        let images = self.env.images.clone();
        let reference = reference.to_string();
        self.defer(format!("remove image {reference}"), move || async move {
            images.remove_image(&reference).await
        });
    }

    /// Runs and drains registered teardowns, newest first. Every teardown
    /// runs; failures are reported on the failure channel.
    pub(crate) async fn run_teardowns(&self) {
        loop {
            let next = lock(&self.teardowns).pop();
            let Some((label, teardown)) = next else {
                break;
            };
            debug!("Teardown: {}", label);
            let outcome = AssertUnwindSafe(teardown()).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!("Teardown '{}' failed: {}", label, err);
                    self.record_failure(format!("teardown '{label}' failed: {err}"));
                }
                Err(panic) => {
                    self.record_failure(format!(
                        "teardown '{label}' panicked: {}",
                        panic_message(panic.as_ref())
                    ));
                }
            }
        }
    }

    // =========================================================================
    // Failures and Workers
    // =========================================================================

    /// Reports a failure on the leaf. The first failure reported is the
    /// leaf's cause.
    pub fn record_failure(&self, message: impl Into<String>) {
        // Workers are settled before the receiver is read and dropped.
        let _ = self.failures.send(message.into());
    }

    /// Child handle for a worker: same adapters and channels, child
    /// cancellation token.
    pub fn child(&self) -> Self {
        let cancel = self.cancel.child_token();
        Self {
            runtime: self.env.runtime.with_cancellation(cancel.clone()),
            images: self.env.images.with_cancellation(cancel.clone()),
            cancel,
            ..self.clone()
        }
    }

    /// Spawns a worker task with a child handle.
    ///
    /// Errors and panics of the worker are forwarded to the leaf's failure
    /// channel and returned from [`Worker::join`].
    pub fn spawn<F, Fut, T>(&self, f: F) -> Worker<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let child = self.child();
        let reporter = child.clone();
        let work = f(child);
        let handle = self.workers.spawn(async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(Error::assertion(format!(
                    "worker panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            if let Err(err) = &outcome {
                reporter.record_failure(err.to_string());
            }
            outcome
        });
        lock(&self.aborts).push(handle.abort_handle());
        Worker { handle }
    }

    /// Waits for every worker spawned from this leaf, joined or not. Workers
    /// still running after `grace` are aborted and the leaf fails.
    pub(crate) async fn settle_workers(&self, grace: Duration) {
        self.workers.close();
        if tokio::time::timeout(grace, self.workers.wait()).await.is_ok() {
            return;
        }
        let aborts = std::mem::take(&mut *lock(&self.aborts));
        let running = aborts.iter().filter(|handle| !handle.is_finished()).count();
        warn!("Aborting {} worker(s) still running after {:?}", running, grace);
        for handle in &aborts {
            handle.abort();
        }
        self.record_failure(format!(
            "{running} worker(s) still running {grace:?} after the leaf finished; aborted"
        ));
        self.workers.wait().await;
    }
}

/// Handle to a spawned worker.
pub struct Worker<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> Worker<T> {
    /// Waits for the worker. Panics surface as [`Error::AssertionFailed`].
    pub async fn join(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(Error::assertion(format!(
                "worker panicked: {}",
                panic_message(join.into_panic().as_ref())
            ))),
            Err(join) => Err(Error::Cancelled(format!("worker: {join}"))),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
