//! Scenario runner.
//!
//! Executes a plan: for each selected leaf, before-each hooks root to leaf,
//! then the body, then the leaf's deferred teardowns newest first, then
//! after-each hooks leaf to root. Teardowns and after-each hooks always run;
//! the first failure recorded on the leaf is its cause.
//!
//! Leaves run on up to `parallelism` tasks. A `[Serial]` leaf holds the
//! write half of a lock the others share, so it runs alone.

use super::context::{panic_message, Context, Environment};
use super::{PlannedLeaf, Step};
use crate::constants::WORKER_SETTLE_TIMEOUT;
use crate::error::{Error, Result};
use crate::report::{LeafReport, Outcome, Report};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

pub struct Runner {
    env: Arc<Environment>,
    parallelism: usize,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            parallelism: 1,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Root token. Leaves not started when it fires are reported skipped;
    /// running leaves see their adapter calls fail with `Cancelled`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs every selected leaf and reports all leaves in plan order.
    pub async fn run(&self, plan: Vec<PlannedLeaf>) -> Report {
        let started_at = chrono::Utc::now();
        let started = Instant::now();
        let selected = plan.iter().filter(|leaf| leaf.selected).count();
        info!(
            "Running {} of {} scenarios ({} in parallel)",
            selected,
            plan.len(),
            self.parallelism
        );

        let permits = Arc::new(Semaphore::new(self.parallelism));
        let exclusive = Arc::new(RwLock::new(()));
        let mut tasks = JoinSet::new();
        let mut reports: Vec<Option<LeafReport>> = vec![None; plan.len()];

        for (index, leaf) in plan.into_iter().enumerate() {
            let tags: Vec<String> = leaf.tags.iter().cloned().collect();
            if !leaf.selected {
                reports[index] = Some(LeafReport::skipped(&leaf.path, tags));
                continue;
            }

            let env = Arc::clone(&self.env);
            let cancel = self.cancel.clone();
            let permits = Arc::clone(&permits);
            let exclusive = Arc::clone(&exclusive);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (index, LeafReport::skipped(&leaf.path, tags));
                };
                let _guard = if leaf.is_serial() {
                    Guard::Write(exclusive.write_owned().await)
                } else {
                    Guard::Read(exclusive.read_owned().await)
                };
                if cancel.is_cancelled() {
                    return (index, LeafReport::skipped(&leaf.path, tags));
                }

                let span = info_span!("scenario", path = %leaf.path);
                let report = run_leaf(env, &leaf, cancel).instrument(span).await;
                (index, report)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(join) => error!("Scenario task failed: {}", join),
            }
        }

        let leaves = reports
            .into_iter()
            .map(|report| {
                report.unwrap_or_else(|| LeafReport {
                    path: String::new(),
                    tags: Vec::new(),
                    outcome: Outcome::Failed,
                    duration: Duration::ZERO,
                    failure: Some("scenario task aborted".to_string()),
                })
            })
            .collect();

        Report::new(started_at, started.elapsed(), leaves)
    }
}

enum Guard {
    Read(#[allow(dead_code)] tokio::sync::OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] tokio::sync::OwnedRwLockWriteGuard<()>),
}

/// Runs one step, turning a panic into an assertion failure.
async fn guarded(step: &Step, ctx: &Context) -> Result<()> {
    match AssertUnwindSafe(step(ctx.clone())).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::assertion(format!(
            "panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

async fn run_leaf(env: Arc<Environment>, leaf: &PlannedLeaf, cancel: CancellationToken) -> LeafReport {
    let started = Instant::now();
    let (failures, mut causes) = mpsc::unbounded_channel();
    let ctx = Context::new(env, &leaf.path, cancel.child_token(), failures);
    info!("Running");

    let mut setup_failed = false;
    for hook in &leaf.before {
        if let Err(err) = guarded(hook, &ctx).await {
            ctx.record_failure(format!("before-each: {err}"));
            setup_failed = true;
            break;
        }
    }

    if !setup_failed {
        if let Err(err) = guarded(&leaf.body, &ctx).await {
            ctx.record_failure(err.to_string());
        }
    }

    ctx.settle_workers(WORKER_SETTLE_TIMEOUT).await;
    ctx.run_teardowns().await;
    for hook in &leaf.after {
        if let Err(err) = guarded(hook, &ctx).await {
            ctx.record_failure(format!("after-each: {err}"));
        }
    }
    // After-each hooks may defer removals of their own.
    ctx.run_teardowns().await;
    ctx.settle_workers(WORKER_SETTLE_TIMEOUT).await;

    let duration = started.elapsed();
    let failure = causes.try_recv().ok();
    let outcome = match &failure {
        None => {
            info!("Passed in {:?}", duration);
            Outcome::Passed
        }
        Some(cause) => {
            warn!("Failed in {:?}: {}", duration, cause);
            Outcome::Failed
        }
    };

    LeafReport {
        path: leaf.path.clone(),
        tags: leaf.tags.iter().cloned().collect(),
        outcome,
        duration,
        failure,
    }
}
