//! # CRI Transport
//!
//! The two gRPC services of the Container Runtime Interface, expressed as
//! async traits so the adapters can run against any implementation:
//!
//! | Trait | Service | Used by |
//! |-------|---------|---------|
//! | [`RuntimeService`] | `runtime.v1.RuntimeService` | [`crate::runtime::RuntimeClient`] |
//! | [`ImageService`] | `runtime.v1.ImageService` | [`crate::image::ImageClient`] |
//!
//! [`GrpcTransport`] implements both over a unix socket. Methods return the
//! raw [`tonic::Status`]; mapping onto the harness error taxonomy happens in
//! the adapters.

mod grpc;
pub mod proto;

pub use grpc::{unix_socket_path, GrpcTransport};
pub use proto::*;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Result of a single CRI call.
pub type CallResult<T> = std::result::Result<T, Status>;

/// Runs one CRI call bounded by `timeout` and `cancel`.
///
/// Timeout yields [`Error::Timeout`], cancellation [`Error::Cancelled`], and
/// a runtime status is mapped with [`Error::from_status`].
pub async fn bounded_call<T, F>(
    operation: &'static str,
    cancel: &CancellationToken,
    timeout: Duration,
    call: F,
) -> Result<T>
where
    F: Future<Output = CallResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(operation.to_string())),
        outcome = tokio::time::timeout(timeout, call) => match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(status)) => Err(Error::from_status(operation, status)),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                duration: timeout,
            }),
        },
    }
}

/// `runtime.v1.RuntimeService`.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn version(&self, req: VersionRequest) -> CallResult<VersionResponse>;

    async fn status(&self, req: StatusRequest) -> CallResult<StatusResponse>;

    async fn run_pod_sandbox(&self, req: RunPodSandboxRequest)
        -> CallResult<RunPodSandboxResponse>;

    async fn stop_pod_sandbox(
        &self,
        req: StopPodSandboxRequest,
    ) -> CallResult<StopPodSandboxResponse>;

    async fn remove_pod_sandbox(
        &self,
        req: RemovePodSandboxRequest,
    ) -> CallResult<RemovePodSandboxResponse>;

    async fn pod_sandbox_status(
        &self,
        req: PodSandboxStatusRequest,
    ) -> CallResult<PodSandboxStatusResponse>;

    async fn list_pod_sandbox(&self, req: ListPodSandboxRequest)
        -> CallResult<ListPodSandboxResponse>;

    async fn create_container(
        &self,
        req: CreateContainerRequest,
    ) -> CallResult<CreateContainerResponse>;

    async fn start_container(&self, req: StartContainerRequest)
        -> CallResult<StartContainerResponse>;

    async fn stop_container(&self, req: StopContainerRequest) -> CallResult<StopContainerResponse>;

    async fn remove_container(
        &self,
        req: RemoveContainerRequest,
    ) -> CallResult<RemoveContainerResponse>;

    async fn list_containers(&self, req: ListContainersRequest)
        -> CallResult<ListContainersResponse>;

    async fn container_status(
        &self,
        req: ContainerStatusRequest,
    ) -> CallResult<ContainerStatusResponse>;

    async fn exec_sync(&self, req: ExecSyncRequest) -> CallResult<ExecSyncResponse>;

    async fn container_stats(&self, req: ContainerStatsRequest)
        -> CallResult<ContainerStatsResponse>;

    async fn list_container_stats(
        &self,
        req: ListContainerStatsRequest,
    ) -> CallResult<ListContainerStatsResponse>;

    async fn reopen_container_log(
        &self,
        req: ReopenContainerLogRequest,
    ) -> CallResult<ReopenContainerLogResponse>;
}

/// `runtime.v1.ImageService`.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn list_images(&self, req: ListImagesRequest) -> CallResult<ListImagesResponse>;

    async fn image_status(&self, req: ImageStatusRequest) -> CallResult<ImageStatusResponse>;

    async fn pull_image(&self, req: PullImageRequest) -> CallResult<PullImageResponse>;

    async fn remove_image(&self, req: RemoveImageRequest) -> CallResult<RemoveImageResponse>;
}
