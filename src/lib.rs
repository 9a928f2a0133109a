//! # cricheck
//!
//! **Conformance Harness for the Container Runtime Interface**
//!
//! This crate drives a node-level container runtime through its CRI v1
//! runtime and image services and asserts the observable outcome of each
//! step. It does not implement a runtime: everything it knows about
//! containers comes back over the socket.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            cricheck                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │              Scenario Registry & Runner (suite)             │    │
//! │  │  before-each (root→leaf) → body → teardowns → after-each    │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │ Context                              │
//! │  ┌──────────────┐  ┌─────────┴──────┐  ┌──────────────────────┐     │
//! │  │   Fixtures   │  │ Assertion DSL  │  │    Log Parser        │     │
//! │  │ UUID names   │  │ Eventually /   │  │ <ts> <stream> <tag>  │     │
//! │  │ cgroup probe │  │ Consistently   │  │ <payload>            │     │
//! │  └──────┬───────┘  └───────┬────────┘  └──────────────────────┘     │
//! │         │                  │ Poller                                 │
//! │  ┌──────┴──────────────────┴───────────────────────────────────┐    │
//! │  │       RuntimeClient            │         ImageClient        │    │
//! │  │  sandbox, container, exec,     │  pull, status, list,       │    │
//! │  │  stats, log reopen, watchdog   │  idempotent remove         │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │        GrpcTransport: /runtime.v1.RuntimeService, ImageService      │
//! │                       over a unix domain socket                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failure Model
//!
//! | Source | Surfaces as |
//! |--------|-------------|
//! | Failed expectation | [`Error::AssertionFailed`] on the leaf |
//! | Watchdog fired before StopContainer returned | [`Error::StopTimedOut`] |
//! | Panic in a body, hook or worker | [`Error::AssertionFailed`] |
//! | `NotFound` during teardown | success |
//! | Missing image on CreateContainer | pull, then one retry |
//!
//! Only the first failure of a leaf is its cause; teardowns and after-each
//! hooks run regardless.
//!
//! # Example
//!
//! ```rust,ignore
//! use cricheck::{scenarios, Filter, Registry, Runner, Environment};
//!
//! let mut registry = Registry::new();
//! scenarios::register_all(&mut registry);
//! let plan = registry.plan(&Filter::new(Some("Conformance"), Some("Serial"))?);
//!
//! let runner = Runner::new(std::sync::Arc::new(Environment::new(runtime)))
//!     .with_parallelism(4);
//! let report = runner.run(plan).await;
//! std::process::exit(i32::from(report.exit_code()));
//! ```

pub mod config;
pub mod constants;
pub mod cri;
pub mod error;
pub mod expect;
pub mod fixture;
pub mod image;
pub mod logs;
pub mod poll;
pub mod report;
pub mod runtime;
pub mod scenarios;
pub mod suite;

// Re-exports
pub use config::Config;
pub use cri::{GrpcTransport, ImageService, RuntimeService};
pub use error::{Error, Result};
pub use image::ImageClient;
pub use logs::{parse_log_line, read_log_file, LogRecord};
pub use poll::Poller;
pub use report::{Outcome, Report};
pub use runtime::{ExecOutput, RuntimeClient};
pub use suite::{Context, Environment, Filter, Registry, Runner};
