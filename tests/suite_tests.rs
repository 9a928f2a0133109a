//! Tests for the scenario registry and runner.
//!
//! Hook ordering, failure attribution, panic capture, `[Serial]`
//! exclusivity and cancellation, run against the in-memory runtime.

mod common;

use cricheck::report::{EXIT_FAILURE, EXIT_SUCCESS};
use cricheck::{Context, Error, Filter, Outcome, Registry, Runner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::default()
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Step that appends `entry` to `log`.
fn record(
    log: &Log,
    entry: &str,
) -> impl Fn(Context) -> futures::future::Ready<cricheck::Result<()>> + Send + Sync + 'static {
    let log = log.clone();
    let entry = entry.to_string();
    move |_| {
        log.lock().unwrap().push(entry.clone());
        futures::future::ready(Ok(()))
    }
}

fn runner() -> Runner {
    let fake = common::FakeCri::new();
    Runner::new(common::environment(&fake))
}

// =============================================================================
// Hook Order
// =============================================================================

#[tokio::test]
async fn test_hook_order_root_to_leaf_and_back() {
    let log = new_log();
    let mut registry = Registry::new();
    registry.describe("outer", |outer| {
        outer
            .before_each(record(&log, "before outer"))
            .after_each(record(&log, "after outer"));
        outer.describe("inner", |inner| {
            inner
                .before_each(record(&log, "before inner"))
                .after_each(record(&log, "after inner"));
            let log = log.clone();
            inner.it("leaf", move |ctx| {
                let log = log.clone();
                async move {
                    let teardown_log = log.clone();
                    ctx.defer("first", move || async move {
                        teardown_log.lock().unwrap().push("teardown first".into());
                        Ok(())
                    });
                    let teardown_log = log.clone();
                    ctx.defer("second", move || async move {
                        teardown_log.lock().unwrap().push("teardown second".into());
                        Ok(())
                    });
                    log.lock().unwrap().push("body".into());
                    Ok(())
                }
            });
        });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(report.passed(), 1);
    assert_eq!(
        entries(&log),
        vec![
            "before outer",
            "before inner",
            "body",
            "teardown second",
            "teardown first",
            "after inner",
            "after outer",
        ]
    );
}

#[tokio::test]
async fn test_after_each_runs_when_body_fails() {
    let log = new_log();
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.after_each(record(&log, "after"));
        group.it("fails", |_| async { Err(Error::assertion("expected 1, got 2")) });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(entries(&log), vec!["after"]);
    assert_eq!(report.leaves[0].outcome, Outcome::Failed);
    assert_eq!(
        report.leaves[0].failure.as_deref(),
        Some("expected 1, got 2")
    );
    assert_eq!(report.exit_code(), EXIT_FAILURE);
}

#[tokio::test]
async fn test_before_each_failure_skips_body() {
    let log = new_log();
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group
            .before_each(|_| async { Err(Error::Internal("no sandbox".into())) })
            .after_each(record(&log, "after"));
        group.it("body", record(&log, "body"));
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(entries(&log), vec!["after"]);
    let failure = report.leaves[0].failure.clone().unwrap();
    assert!(failure.starts_with("before-each: "), "{failure}");
    assert!(failure.contains("no sandbox"));
}

// =============================================================================
// Failure Attribution
// =============================================================================

#[tokio::test]
async fn test_first_failure_is_the_cause() {
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.after_each(|_| async { Err(Error::Internal("cleanup broke".into())) });
        group.it("reports twice", |ctx| async move {
            ctx.record_failure("first");
            Err(Error::assertion("second"))
        });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(report.leaves[0].failure.as_deref(), Some("first"));
}

#[tokio::test]
async fn test_after_each_failure_fails_a_passing_leaf() {
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.after_each(|_| async { Err(Error::Internal("cleanup broke".into())) });
        group.it("passes", |_| async { Ok(()) });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    let failure = report.leaves[0].failure.clone().unwrap();
    assert!(failure.starts_with("after-each: "), "{failure}");
}

#[tokio::test]
async fn test_failing_teardown_does_not_stop_others() {
    let log = new_log();
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        let log = log.clone();
        group.it("defers", move |ctx| {
            let log = log.clone();
            async move {
                ctx.defer("ok", move || async move {
                    log.lock().unwrap().push("ran".into());
                    Ok(())
                });
                ctx.defer("broken", || async { Err(Error::NotFound("gone".into())) });
                Ok(())
            }
        });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(entries(&log), vec!["ran"]);
    let failure = report.leaves[0].failure.clone().unwrap();
    assert!(failure.contains("teardown 'broken' failed"), "{failure}");
}

// =============================================================================
// Panics and Workers
// =============================================================================

#[tokio::test]
async fn test_body_panic_is_a_failure() {
    let log = new_log();
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.after_each(record(&log, "after"));
        group.it("panics", |_| async {
            if true {
                panic!("index out of range");
            }
            Ok(())
        });
        group.it("still runs", |_| async { Ok(()) });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(report.leaves[0].outcome, Outcome::Failed);
    assert!(report.leaves[0]
        .failure
        .as_deref()
        .unwrap()
        .contains("index out of range"));
    assert_eq!(report.leaves[1].outcome, Outcome::Passed);
    assert_eq!(entries(&log), vec!["after", "after"]);
}

#[tokio::test]
async fn test_worker_panic_is_reported_on_the_leaf() {
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.it("spawns", |ctx| async move {
            let worker = ctx.spawn(|_child| async move {
                if true {
                    panic!("worker exploded");
                }
                Ok(())
            });
            let joined = worker.join().await;
            assert!(matches!(joined, Err(Error::AssertionFailed(_))));
            Ok(())
        });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(report.leaves[0].outcome, Outcome::Failed);
    let failure = report.leaves[0].failure.clone().unwrap();
    assert!(failure.contains("worker panicked: worker exploded"), "{failure}");
}

#[tokio::test]
async fn test_worker_results_are_returned() {
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.it("sums", |ctx| async move {
            let workers: Vec<_> = (1..=4u32)
                .map(|n| ctx.spawn(move |_| async move { Ok(n * 10) }))
                .collect();
            let mut total = 0;
            for worker in workers {
                total += worker.join().await?;
            }
            cricheck::expect::expect(total).to(cricheck::expect::equal(100u32))
        });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(report.exit_code(), EXIT_SUCCESS);
}

#[tokio::test]
async fn test_unjoined_worker_panic_fails_the_leaf() {
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.it("forgets its worker", |ctx| async move {
            let _ = ctx.spawn(|_child| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if true {
                    panic!("late worker exploded");
                }
                Ok(())
            });
            Ok(())
        });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(report.leaves[0].outcome, Outcome::Failed);
    let failure = report.leaves[0].failure.clone().unwrap();
    assert!(failure.contains("late worker exploded"), "{failure}");
}

#[tokio::test(start_paused = true)]
async fn test_stuck_worker_is_aborted() {
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.it("leaves a worker hanging", |ctx| async move {
            let _ = ctx.spawn(|_child| async move {
                futures::future::pending::<()>().await;
                Ok(())
            });
            Ok(())
        });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(report.leaves[0].outcome, Outcome::Failed);
    let failure = report.leaves[0].failure.clone().unwrap();
    assert!(failure.contains("still running"), "{failure}");
}

// =============================================================================
// State
// =============================================================================

#[derive(Clone)]
struct SandboxId(String);

#[tokio::test]
async fn test_state_flows_from_hook_to_body() {
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.before_each(|ctx| async move {
            ctx.set(SandboxId("sb-42".into()));
            Ok(())
        });
        group.it("reads", |ctx| async move {
            let SandboxId(id) = ctx.get()?;
            cricheck::expect::expect(id).to(cricheck::expect::equal("sb-42"))
        });
        group.it("reads a missing type", |ctx| async move {
            ctx.get::<u64>().map(|_| ())
        });
    });

    let report = runner().run(registry.plan(&Filter::default())).await;
    assert_eq!(report.leaves[0].outcome, Outcome::Passed);
    assert_eq!(report.leaves[1].outcome, Outcome::Failed);
    assert!(report.leaves[1]
        .failure
        .as_deref()
        .unwrap()
        .contains("no u64 stored"));
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_serial_leaf_runs_alone() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let seen_by_serial = Arc::new(AtomicUsize::new(usize::MAX));

    let mut registry = Registry::new();
    registry.describe("group", |group| {
        for n in 0..4 {
            let active = active.clone();
            let peak = peak.clone();
            group.it(&format!("parallel {n}"), move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        let active = active.clone();
        let seen = seen_by_serial.clone();
        group.it("alone [Serial]", move |_| {
            let active = active.clone();
            let seen = seen.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                seen.store(now.max(active.load(Ordering::SeqCst)), Ordering::SeqCst);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
    });

    let report = runner()
        .with_parallelism(4)
        .run(registry.plan(&Filter::default()))
        .await;
    assert_eq!(report.passed(), 5);
    assert_eq!(seen_by_serial.load(Ordering::SeqCst), 1);
    assert!(peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_report_keeps_plan_order() {
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.it("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        });
        group.it("fast", |_| async { Ok(()) });
    });

    let report = runner()
        .with_parallelism(2)
        .run(registry.plan(&Filter::default()))
        .await;
    let paths: Vec<&str> = report.leaves.iter().map(|l| l.path.as_str()).collect();
    assert_eq!(paths, vec!["group slow", "group fast"]);
}

// =============================================================================
// Selection and Cancellation
// =============================================================================

#[tokio::test]
async fn test_filtered_leaves_are_skipped() {
    let log = new_log();
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.it("kept [Conformance]", record(&log, "kept"));
        group.it("dropped [Serial]", record(&log, "dropped"));
    });

    let filter = Filter::new(Some("Conformance"), Some("Serial")).unwrap();
    let report = runner().run(registry.plan(&filter)).await;
    assert_eq!(entries(&log), vec!["kept"]);
    assert_eq!(report.leaves[1].outcome, Outcome::Skipped);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.exit_code(), EXIT_SUCCESS);
}

#[tokio::test]
async fn test_cancellation_skips_unstarted_leaves() {
    let cancel = CancellationToken::new();
    let log = new_log();
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        let cancel = cancel.clone();
        let first_log = log.clone();
        group.it("interrupted", move |_| {
            let cancel = cancel.clone();
            let log = first_log.clone();
            async move {
                log.lock().unwrap().push("first".into());
                cancel.cancel();
                Ok(())
            }
        });
        group.it("never runs", record(&log, "second"));
    });

    let report = runner()
        .with_cancellation(cancel)
        .run(registry.plan(&Filter::default()))
        .await;
    assert_eq!(entries(&log), vec!["first"]);
    assert_eq!(report.leaves[0].outcome, Outcome::Passed);
    assert_eq!(report.leaves[1].outcome, Outcome::Skipped);
}

#[tokio::test]
async fn test_cancelled_leaf_calls_fail() {
    let cancel = CancellationToken::new();
    let mut registry = Registry::new();
    registry.describe("group", |group| {
        group.it("calls after cancel", |ctx| async move {
            ctx.cancellation().cancel();
            let result = ctx.runtime().version().await;
            assert!(matches!(result, Err(Error::Cancelled(_))));
            Ok(())
        });
    });

    let report = runner()
        .with_cancellation(cancel.clone())
        .run(registry.plan(&Filter::default()))
        .await;
    assert_eq!(report.leaves[0].outcome, Outcome::Passed);
    assert!(!cancel.is_cancelled());
}
