//! Runtime Adapter - typed facade over the CRI runtime service.
//!
//! Every call is bounded by the client's per-call timeout and its
//! cancellation token (see [`crate::cri::bounded_call`]). Runtime statuses are
//! mapped onto [`crate::Error`].
//!
//! # Lifecycle
//!
//! ```text
//! run_pod_sandbox → create_container → start_container → [exec_sync, stats, logs]
//!                 → stop_container → remove_container → stop_pod_sandbox → remove_pod_sandbox
//! ```
//!
//! # Teardown
//!
//! [`RuntimeClient::teardown_container`] and [`RuntimeClient::teardown_sandbox`]
//! treat `NotFound` as success so they can run any number of times.

use crate::constants::DEFAULT_CALL_TIMEOUT;
use crate::cri::*;
use crate::error::{Error, Result};
use crate::image::ImageClient;
use crate::poll::Poller;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Exec Output
// =============================================================================

/// Output of a synchronous exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    /// Returns true if the command succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily as UTF-8.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Maps `NotFound` to success; used on every teardown path.
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Runtimes report a missing image on CreateContainer in their own words.
fn is_image_missing_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("image")
        && (message.contains("not found")
            || message.contains("not known")
            || message.contains("no such"))
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

// =============================================================================
// Client
// =============================================================================

/// CRI runtime service adapter.
///
/// Holds only its transport, the image client used to recover from a missing
/// image, and call bounds. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeClient {
    service: Arc<dyn RuntimeService>,
    images: ImageClient,
    cancel: CancellationToken,
    call_timeout: Duration,
    runtime_handler: String,
}

impl RuntimeClient {
    pub fn new(service: Arc<dyn RuntimeService>, images: ImageClient) -> Self {
        Self {
            service,
            images,
            cancel: CancellationToken::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            runtime_handler: String::new(),
        }
    }

    /// Sets the bound on each call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the runtime handler passed to RunPodSandbox.
    pub fn with_runtime_handler(mut self, handler: impl Into<String>) -> Self {
        self.runtime_handler = handler.into();
        self
    }

    /// Returns a copy whose calls (and image recovery) use `cancel`.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            images: self.images.with_cancellation(cancel.clone()),
            cancel,
            ..self.clone()
        }
    }

    /// Image client sharing this client's cancellation.
    pub fn images(&self) -> &ImageClient {
        &self.images
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = CallResult<T>>,
    {
        bounded_call(operation, &self.cancel, self.call_timeout, call).await
    }

    // =========================================================================
    // Runtime Info
    // =========================================================================

    pub async fn version(&self) -> Result<VersionResponse> {
        let request = VersionRequest {
            version: "v1".to_string(),
        };
        self.call("Version", self.service.version(request)).await
    }

    pub async fn status(&self, verbose: bool) -> Result<StatusResponse> {
        self.call("Status", self.service.status(StatusRequest { verbose }))
            .await
    }

    /// Checks the runtime answers `Version` and reports both required
    /// conditions true.
    pub async fn preflight(&self, endpoint: &str) -> Result<VersionResponse> {
        let version = self.version().await?;
        info!(
            "Runtime {} {} (CRI {})",
            version.runtime_name, version.runtime_version, version.runtime_api_version
        );

        let status = self.status(false).await?.status.unwrap_or_default();
        for required in [RUNTIME_READY, NETWORK_READY] {
            let condition = status.conditions.iter().find(|c| c.r#type == required);
            match condition {
                Some(condition) if condition.status => {}
                Some(condition) => {
                    return Err(Error::RuntimeUnavailable {
                        endpoint: endpoint.to_string(),
                        reason: format!(
                            "{required} is false: {} {}",
                            condition.reason, condition.message
                        ),
                    })
                }
                None => {
                    return Err(Error::RuntimeUnavailable {
                        endpoint: endpoint.to_string(),
                        reason: format!("{required} condition not reported"),
                    })
                }
            }
        }
        Ok(version)
    }

    // =========================================================================
    // Pod Sandbox
    // =========================================================================

    /// Runs a sandbox and returns its runtime-assigned id.
    pub async fn run_pod_sandbox(&self, config: &PodSandboxConfig) -> Result<String> {
        let Some(metadata) = config.metadata.as_ref() else {
            return Err(Error::InvalidConfig(
                "sandbox config has no metadata".to_string(),
            ));
        };
        if metadata.name.is_empty() {
            return Err(Error::InvalidConfig("sandbox name is empty".to_string()));
        }

        let request = RunPodSandboxRequest {
            config: Some(config.clone()),
            runtime_handler: self.runtime_handler.clone(),
        };
        let response = self
            .call("RunPodSandbox", self.service.run_pod_sandbox(request))
            .await?;

        info!("Ran sandbox {} ({})", metadata.name, response.pod_sandbox_id);
        Ok(response.pod_sandbox_id)
    }

    pub async fn stop_pod_sandbox(&self, id: &str) -> Result<()> {
        debug!("Stopping sandbox {}", id);
        let request = StopPodSandboxRequest {
            pod_sandbox_id: id.to_string(),
        };
        self.call("StopPodSandbox", self.service.stop_pod_sandbox(request))
            .await?;
        Ok(())
    }

    pub async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        debug!("Removing sandbox {}", id);
        let request = RemovePodSandboxRequest {
            pod_sandbox_id: id.to_string(),
        };
        self.call("RemovePodSandbox", self.service.remove_pod_sandbox(request))
            .await?;
        Ok(())
    }

    pub async fn pod_sandbox_status(&self, id: &str) -> Result<PodSandboxStatus> {
        let request = PodSandboxStatusRequest {
            pod_sandbox_id: id.to_string(),
            verbose: false,
        };
        let response = self
            .call("PodSandboxStatus", self.service.pod_sandbox_status(request))
            .await?;
        response
            .status
            .ok_or_else(|| Error::NotFound(format!("PodSandboxStatus: sandbox {id}")))
    }

    pub async fn list_pod_sandbox(
        &self,
        filter: Option<PodSandboxFilter>,
    ) -> Result<Vec<PodSandbox>> {
        let request = ListPodSandboxRequest { filter };
        let response = self
            .call("ListPodSandbox", self.service.list_pod_sandbox(request))
            .await?;
        Ok(response.items)
    }

    /// Stops then removes a sandbox, tolerating one that is already gone.
    pub async fn teardown_sandbox(&self, id: &str) -> Result<()> {
        ignore_not_found(self.stop_pod_sandbox(id).await)?;
        ignore_not_found(self.remove_pod_sandbox(id).await)
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Creates a container, pulling its image and retrying once if the
    /// runtime reports it missing.
    pub async fn create_container(
        &self,
        sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> Result<String> {
        let image = config
            .image
            .as_ref()
            .map(|spec| spec.image.clone())
            .filter(|image| !image.is_empty())
            .ok_or_else(|| Error::InvalidConfig("container config has no image".to_string()))?;

        match self
            .create_container_once(sandbox_id, config, sandbox_config)
            .await
        {
            Err(Error::ImageMissing(_)) => {
                warn!("Image {} missing, pulling before retry", image);
                self.images.pull_image(&image).await?;
                self.create_container_once(sandbox_id, config, sandbox_config)
                    .await
            }
            other => other,
        }
    }

    async fn create_container_once(
        &self,
        sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> Result<String> {
        let request = CreateContainerRequest {
            pod_sandbox_id: sandbox_id.to_string(),
            config: Some(config.clone()),
            sandbox_config: Some(sandbox_config.clone()),
        };
        let response = self
            .call("CreateContainer", self.service.create_container(request))
            .await
            .map_err(|err| match err {
                Error::NotFound(message) | Error::Internal(message)
                    if is_image_missing_message(&message) =>
                {
                    Error::ImageMissing(message)
                }
                other => other,
            })?;
        debug!("Created container {} in sandbox {}", response.container_id, sandbox_id);
        Ok(response.container_id)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        debug!("Starting container {}", id);
        let request = StartContainerRequest {
            container_id: id.to_string(),
        };
        self.call("StartContainer", self.service.start_container(request))
            .await?;
        Ok(())
    }

    /// Plain StopContainer, bounded by `timeout` plus the call timeout.
    pub async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        debug!("Stopping container {} (timeout {:?})", id, timeout);
        let request = StopContainerRequest {
            container_id: id.to_string(),
            timeout: secs(timeout),
        };
        bounded_call(
            "StopContainer",
            &self.cancel,
            timeout + self.call_timeout,
            self.service.stop_container(request),
        )
        .await?;
        Ok(())
    }

    /// StopContainer raced against a watchdog of the same `timeout`.
    ///
    /// The stop runs on a spawned worker that owns copies of the id and the
    /// transport handle. If the watchdog fires first the worker is left to
    /// finish on its own and its result is never observed.
    pub async fn stop_container_with_watchdog(&self, id: &str, timeout: Duration) -> Result<()> {
        let service = Arc::clone(&self.service);
        let request = StopContainerRequest {
            container_id: id.to_string(),
            timeout: secs(timeout),
        };
        let worker = tokio::spawn(async move { service.stop_container(request).await });

        tokio::select! {
            joined = worker => match joined {
                Ok(Ok(_)) => {
                    debug!("Stopped container {}", id);
                    Ok(())
                }
                Ok(Err(status)) => Err(Error::from_status("StopContainer", status)),
                Err(join) if join.is_panic() => Err(Error::assertion(format!(
                    "stop worker for container {id} panicked"
                ))),
                Err(join) => Err(Error::Internal(format!("stop worker failed: {join}"))),
            },
            _ = tokio::time::sleep(timeout) => {
                warn!("Stop watchdog fired for container {} after {:?}", id, timeout);
                Err(Error::StopTimedOut { id: id.to_string(), timeout })
            }
            _ = self.cancel.cancelled() => Err(Error::Cancelled("StopContainer".to_string())),
        }
    }

    /// Stops a container under the watchdog and waits for it to report
    /// Exited. A container that returns from StopContainer but keeps running
    /// is reported as [`Error::StopTimedOut`] too.
    pub async fn stop_container_and_wait(
        &self,
        id: &str,
        timeout: Duration,
        poller: Poller,
    ) -> Result<()> {
        self.stop_container_with_watchdog(id, timeout).await?;
        let exited = poller
            .eventually(
                || self.container_state(id),
                |state| *state == ContainerState::ContainerExited,
            )
            .await;
        match exited {
            Ok(_) => Ok(()),
            Err(failure) => match failure.last_error {
                Some(err @ Error::Cancelled(_)) => Err(err),
                _ => {
                    warn!(
                        "Container {} still {:?} {:?} after StopContainer returned",
                        id, failure.last, failure.elapsed
                    );
                    Err(Error::StopTimedOut {
                        id: id.to_string(),
                        timeout,
                    })
                }
            },
        }
    }

    pub async fn remove_container(&self, id: &str) -> Result<()> {
        debug!("Removing container {}", id);
        let request = RemoveContainerRequest {
            container_id: id.to_string(),
        };
        self.call("RemoveContainer", self.service.remove_container(request))
            .await?;
        Ok(())
    }

    /// Removes a container, tolerating one that is already gone.
    pub async fn teardown_container(&self, id: &str) -> Result<()> {
        ignore_not_found(self.remove_container(id).await)
    }

    pub async fn container_status(&self, id: &str, verbose: bool) -> Result<ContainerStatus> {
        let request = ContainerStatusRequest {
            container_id: id.to_string(),
            verbose,
        };
        let response = self
            .call("ContainerStatus", self.service.container_status(request))
            .await?;
        response
            .status
            .ok_or_else(|| Error::NotFound(format!("ContainerStatus: container {id}")))
    }

    /// Current state of a container.
    pub async fn container_state(&self, id: &str) -> Result<ContainerState> {
        Ok(self.container_status(id, false).await?.state())
    }

    pub async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>> {
        let request = ListContainersRequest { filter };
        let response = self
            .call("ListContainers", self.service.list_containers(request))
            .await?;
        Ok(response.containers)
    }

    /// Runs `argv` in the container and waits for it.
    ///
    /// `timeout` is handed to the runtime; the call itself is bounded by
    /// `timeout` plus the client call timeout.
    pub async fn exec_sync(&self, id: &str, argv: &[&str], timeout: Duration) -> Result<ExecOutput> {
        debug!("ExecSync in {}: {:?}", id, argv);
        let request = ExecSyncRequest {
            container_id: id.to_string(),
            cmd: argv.iter().map(|arg| arg.to_string()).collect(),
            timeout: secs(timeout),
        };
        let response = bounded_call(
            "ExecSync",
            &self.cancel,
            timeout + self.call_timeout,
            self.service.exec_sync(request),
        )
        .await?;

        Ok(ExecOutput {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: response.exit_code,
        })
    }

    pub async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let request = ContainerStatsRequest {
            container_id: id.to_string(),
        };
        let response = self
            .call("ContainerStats", self.service.container_stats(request))
            .await?;
        response
            .stats
            .ok_or_else(|| Error::NotFound(format!("ContainerStats: container {id}")))
    }

    pub async fn list_container_stats(
        &self,
        filter: Option<ContainerStatsFilter>,
    ) -> Result<Vec<ContainerStats>> {
        let request = ListContainerStatsRequest { filter };
        let response = self
            .call("ListContainerStats", self.service.list_container_stats(request))
            .await?;
        Ok(response.stats)
    }

    pub async fn reopen_container_log(&self, id: &str) -> Result<()> {
        debug!("Reopening log of container {}", id);
        let request = ReopenContainerLogRequest {
            container_id: id.to_string(),
        };
        self.call("ReopenContainerLog", self.service.reopen_container_log(request))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_missing_detection() {
        assert!(is_image_missing_message(
            "CreateContainer: failed to get image \"busybox\": not found"
        ));
        assert!(is_image_missing_message("CreateContainer: image not known"));
        assert!(is_image_missing_message("CreateContainer: No such image: busybox"));
        assert!(!is_image_missing_message("CreateContainer: sandbox not found"));
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(Error::NotFound("x".into()))).is_ok());
        assert!(ignore_not_found(Err(Error::Internal("x".into()))).is_err());
        assert!(ignore_not_found(Ok(())).is_ok());
    }

    #[test]
    fn test_exec_output() {
        let output = ExecOutput {
            stdout: b"hello\n".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        };
        assert!(output.is_success());
        assert_eq!(output.stdout_str(), "hello\n");
        assert_eq!(output.stderr_str(), "");
    }
}
