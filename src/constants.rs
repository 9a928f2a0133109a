//! # Harness Constants
//!
//! Timeouts, polling intervals, image references and label keys shared by
//! the adapters, the fixture builder and the scenario library. These are the
//! single source of truth for how long the harness waits on a runtime.
//!
//! ## Cross-References
//!
//! - [`crate::poll`]: default convergence windows
//! - [`crate::runtime`]: per-call and exec timeouts
//! - [`crate::fixture`]: name prefixes and default labels
//! - [`crate::scenarios`]: test image references

use std::time::Duration;

// =============================================================================
// Endpoints
// =============================================================================

/// Default CRI endpoint when neither flag nor environment names one.
pub const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///run/containerd/containerd.sock";

/// Environment variable naming the runtime endpoint.
pub const RUNTIME_ENDPOINT_ENV: &str = "CONTAINER_RUNTIME_ENDPOINT";

/// Environment variable naming the image service endpoint.
pub const IMAGE_ENDPOINT_ENV: &str = "IMAGE_SERVICE_ENDPOINT";

// =============================================================================
// Timeouts
// =============================================================================

/// Default bound on a single adapter call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout passed to ExecSync by scenarios.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period handed to StopContainer and raced by the watchdog.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Image pulls are slower than any other call.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a leaf waits for workers it spawned but never joined before
/// aborting them.
pub const WORKER_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Polling
// =============================================================================

/// Window for state transitions (Created → Running → Exited).
pub const STATE_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval for state transitions.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Window for a log line to appear in a container log.
pub const LOG_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval for log appearance.
pub const LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Duration of a stability (Consistently) check.
pub const STABILITY_DURATION: Duration = Duration::from_secs(5);

/// Poll interval for stability checks.
pub const STABILITY_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Fixtures
// =============================================================================

/// Label attached to every sandbox and container the harness creates.
pub const HARNESS_LABEL_KEY: &str = "cricheck.io/managed";

/// Value of [`HARNESS_LABEL_KEY`].
pub const HARNESS_LABEL_VALUE: &str = "true";

/// Namespace given to every sandbox.
pub const DEFAULT_POD_NAMESPACE: &str = "cricheck";

/// Cgroup parent used when the runtime reports the systemd cgroup driver.
pub const SYSTEMD_CGROUP_PARENT: &str = "/kubepods.slice";

/// Cgroup parent used with the cgroupfs driver.
pub const CGROUPFS_CGROUP_PARENT: &str = "/kubepods";

// =============================================================================
// Images
// =============================================================================

/// Registry prefix for the purpose-built test images.
pub const TEST_IMAGE_REGISTRY: &str = "gcr.io/k8s-staging-cri-tools/";

/// General purpose busybox image used for most containers.
pub const DEFAULT_CONTAINER_IMAGE: &str = "registry.k8s.io/e2e-test-images/busybox:1.29-2";

/// HTTP server listening on port 80, used for port mapping checks.
pub const WEB_SERVER_IMAGE: &str = "registry.k8s.io/e2e-test-images/nginx:1.14-2";

/// Public image pulled without tag (implies `:latest`).
pub const PUBLIC_IMAGE_WITHOUT_TAG: &str = "registry.k8s.io/pause";

/// Public image pulled by tag.
pub const PUBLIC_IMAGE_WITH_TAG: &str = "registry.k8s.io/pause:3.9";

/// Public image pulled by digest.
pub const PUBLIC_IMAGE_WITH_DIGEST: &str = "gcr.io/cri-tools/test-image-digest@sha256:9179135b4b4cc5a8721e09379244807553c318d92fa3111a65133241551ca343";

/// Image pulled and removed concurrently by the removal scenario.
pub const CONCURRENT_REMOVAL_IMAGE: &str = "gcr.io/k8s-staging-cri-tools/test-image-tag:test";

/// Three tags of the same image content.
pub const SAME_CONTENT_TAGS: [&str; 3] = ["test-image-tags:1", "test-image-tags:2", "test-image-tags:3"];

/// Three images with pairwise distinct content.
pub const DISTINCT_CONTENT_IMAGES: [&str; 3] = ["test-image-1", "test-image-2", "test-image-3"];

// =============================================================================
// Exec
// =============================================================================

/// Command keeping a container alive indefinitely.
pub const LONG_RUNNING_COMMAND: [&str; 3] = ["sh", "-c", "top"];
