//! gRPC transport over a unix domain socket.

use super::*;
use crate::error::{Error, Result};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

/// Resolves `unix:///path` or a bare absolute path to a socket path.
pub fn unix_socket_path(endpoint: &str) -> Result<PathBuf> {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    if !path.starts_with('/') {
        return Err(Error::Config(format!(
            "endpoint '{endpoint}' is not a unix socket (expected unix:///path)"
        )));
    }
    Ok(PathBuf::from(path))
}

/// CRI client speaking both services over one channel.
///
/// tonic 0.12 / hyper 1.x requires wrapping the stream in `TokioIo`.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    channel: Channel,
    endpoint: String,
}

impl GrpcTransport {
    /// Connects to a runtime or image endpoint.
    pub async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Self> {
        let path = unix_socket_path(endpoint)?;
        debug!("Connecting to CRI endpoint {}", path.display());

        let channel = Endpoint::try_from("http://[::]:0")
            .map_err(|e| Error::Transport(e.to_string()))?
            .connect_timeout(connect_timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let p = path.clone();
                async move {
                    let stream = tokio::net::UnixStream::connect(&p).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .map_err(|e| Error::RuntimeUnavailable {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            channel,
            endpoint: endpoint.to_string(),
        })
    }

    /// Endpoint this transport is connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn unary<Req, Resp>(&self, path: &'static str, req: Req) -> CallResult<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
        let codec = tonic::codec::ProstCodec::default();
        let response = grpc
            .unary(tonic::Request::new(req), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl RuntimeService for GrpcTransport {
    async fn version(&self, req: VersionRequest) -> CallResult<VersionResponse> {
        self.unary("/runtime.v1.RuntimeService/Version", req).await
    }

    async fn status(&self, req: StatusRequest) -> CallResult<StatusResponse> {
        self.unary("/runtime.v1.RuntimeService/Status", req).await
    }

    async fn run_pod_sandbox(
        &self,
        req: RunPodSandboxRequest,
    ) -> CallResult<RunPodSandboxResponse> {
        self.unary("/runtime.v1.RuntimeService/RunPodSandbox", req).await
    }

    async fn stop_pod_sandbox(
        &self,
        req: StopPodSandboxRequest,
    ) -> CallResult<StopPodSandboxResponse> {
        self.unary("/runtime.v1.RuntimeService/StopPodSandbox", req).await
    }

    async fn remove_pod_sandbox(
        &self,
        req: RemovePodSandboxRequest,
    ) -> CallResult<RemovePodSandboxResponse> {
        self.unary("/runtime.v1.RuntimeService/RemovePodSandbox", req).await
    }

    async fn pod_sandbox_status(
        &self,
        req: PodSandboxStatusRequest,
    ) -> CallResult<PodSandboxStatusResponse> {
        self.unary("/runtime.v1.RuntimeService/PodSandboxStatus", req).await
    }

    async fn list_pod_sandbox(
        &self,
        req: ListPodSandboxRequest,
    ) -> CallResult<ListPodSandboxResponse> {
        self.unary("/runtime.v1.RuntimeService/ListPodSandbox", req).await
    }

    async fn create_container(
        &self,
        req: CreateContainerRequest,
    ) -> CallResult<CreateContainerResponse> {
        self.unary("/runtime.v1.RuntimeService/CreateContainer", req).await
    }

    async fn start_container(
        &self,
        req: StartContainerRequest,
    ) -> CallResult<StartContainerResponse> {
        self.unary("/runtime.v1.RuntimeService/StartContainer", req).await
    }

    async fn stop_container(&self, req: StopContainerRequest) -> CallResult<StopContainerResponse> {
        self.unary("/runtime.v1.RuntimeService/StopContainer", req).await
    }

    async fn remove_container(
        &self,
        req: RemoveContainerRequest,
    ) -> CallResult<RemoveContainerResponse> {
        self.unary("/runtime.v1.RuntimeService/RemoveContainer", req).await
    }

    async fn list_containers(
        &self,
        req: ListContainersRequest,
    ) -> CallResult<ListContainersResponse> {
        self.unary("/runtime.v1.RuntimeService/ListContainers", req).await
    }

    async fn container_status(
        &self,
        req: ContainerStatusRequest,
    ) -> CallResult<ContainerStatusResponse> {
        self.unary("/runtime.v1.RuntimeService/ContainerStatus", req).await
    }

    async fn exec_sync(&self, req: ExecSyncRequest) -> CallResult<ExecSyncResponse> {
        self.unary("/runtime.v1.RuntimeService/ExecSync", req).await
    }

    async fn container_stats(
        &self,
        req: ContainerStatsRequest,
    ) -> CallResult<ContainerStatsResponse> {
        self.unary("/runtime.v1.RuntimeService/ContainerStats", req).await
    }

    async fn list_container_stats(
        &self,
        req: ListContainerStatsRequest,
    ) -> CallResult<ListContainerStatsResponse> {
        self.unary("/runtime.v1.RuntimeService/ListContainerStats", req).await
    }

    async fn reopen_container_log(
        &self,
        req: ReopenContainerLogRequest,
    ) -> CallResult<ReopenContainerLogResponse> {
        self.unary("/runtime.v1.RuntimeService/ReopenContainerLog", req).await
    }
}

#[async_trait]
impl ImageService for GrpcTransport {
    async fn list_images(&self, req: ListImagesRequest) -> CallResult<ListImagesResponse> {
        self.unary("/runtime.v1.ImageService/ListImages", req).await
    }

    async fn image_status(&self, req: ImageStatusRequest) -> CallResult<ImageStatusResponse> {
        self.unary("/runtime.v1.ImageService/ImageStatus", req).await
    }

    async fn pull_image(&self, req: PullImageRequest) -> CallResult<PullImageResponse> {
        self.unary("/runtime.v1.ImageService/PullImage", req).await
    }

    async fn remove_image(&self, req: RemoveImageRequest) -> CallResult<RemoveImageResponse> {
        self.unary("/runtime.v1.ImageService/RemoveImage", req).await
    }
}
