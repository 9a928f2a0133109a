//! In-memory CRI runtime used by the integration tests.
//!
//! Implements both transport traits over a mutex-guarded state: sandboxes,
//! containers and a local image store filled from a fixed remote catalogue.
//! Knobs on [`FakeCri`] make it slow to stop, forget its network, or panic.
//!
//! Containers whose command is `echo ...` write one CRI log line and exit.
//! Containers running an `echo` loop append a line every 100 ms to the file
//! they opened at start, until ReopenContainerLog swaps in a fresh file.

#![allow(dead_code)]

use async_trait::async_trait;
use cricheck::constants::*;
use cricheck::cri::*;
use cricheck::image::normalize_reference;
use cricheck::logs::{LogStream, LogTag};
use cricheck::{Environment, ImageClient, LogRecord, RuntimeClient};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Interval between lines of a looping `echo` container.
const LOG_LOOP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct FakeContainer {
    sandbox_id: String,
    config: ContainerConfig,
    state: ContainerState,
    /// Host path of the container log, when the sandbox has a log directory.
    log_file: Option<PathBuf>,
    /// File the container currently writes to.
    log_sink: Option<Arc<Mutex<File>>>,
    writer: Option<CancellationToken>,
}

impl FakeContainer {
    fn exit(&mut self) {
        self.state = ContainerState::ContainerExited;
        if let Some(writer) = self.writer.take() {
            writer.cancel();
        }
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_log_line(file: &mut File, text: &str) -> std::io::Result<()> {
    let record = LogRecord {
        timestamp: chrono::Utc::now().fixed_offset(),
        stream: LogStream::Stdout,
        tag: LogTag::Full,
        payload: format!("{text}\n"),
    };
    writeln!(file, "{}", record.to_line())
}

/// Text echoed by `while true; do echo <text>; sleep ..; done`.
fn echo_loop_text(script: &str) -> Option<String> {
    let rest = script.strip_prefix("while true; do echo ")?;
    rest.split(';').next().map(str::to_string)
}

async fn echo_loop(sink: Arc<Mutex<File>>, text: String, stop: CancellationToken) {
    while !stop.is_cancelled() {
        tokio::time::sleep(LOG_LOOP_INTERVAL).await;
        if stop.is_cancelled() {
            break;
        }
        let _ = write_log_line(&mut lock(&sink), &text);
    }
}

#[derive(Debug, Clone)]
struct CatalogueEntry {
    id: String,
    size: u64,
    by_digest: bool,
}

#[derive(Default)]
struct State {
    next_id: usize,
    sandboxes: HashMap<String, (PodSandboxConfig, PodSandboxState)>,
    containers: HashMap<String, FakeContainer>,
    images: HashMap<String, Image>,
    catalogue: HashMap<String, CatalogueEntry>,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Resolves an id or a reference, adding `:latest` like a real runtime.
    fn find_image(&self, reference: &str) -> Option<&Image> {
        let normalized = normalize_reference(reference);
        self.images.values().find(|image| {
            image.id == reference
                || image.repo_tags.iter().any(|t| *t == normalized)
                || image.repo_digests.iter().any(|d| d == reference)
        })
    }
}

/// Fake runtime with call counters.
pub struct FakeCri {
    state: Mutex<State>,
    /// How long StopContainer takes.
    pub stop_delay: Mutex<Duration>,
    /// Whether Status reports NetworkReady.
    pub network_ready: Mutex<bool>,
    /// StopContainer returns without the container exiting.
    pub stop_leaves_running: AtomicBool,
    pub create_calls: AtomicUsize,
    pub pull_calls: AtomicUsize,
    pub remove_image_calls: AtomicUsize,
    pub reopen_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

impl FakeCri {
    pub fn new() -> Arc<Self> {
        let mut state = State::default();
        let mut add = |reference: &str, id: &str, by_digest: bool| {
            state.catalogue.insert(
                reference.to_string(),
                CatalogueEntry {
                    id: id.to_string(),
                    size: 1024,
                    by_digest,
                },
            );
        };
        add(DEFAULT_CONTAINER_IMAGE, "sha256:busybox", false);
        add(WEB_SERVER_IMAGE, "sha256:nginx", false);
        add(&format!("{PUBLIC_IMAGE_WITHOUT_TAG}:latest"), "sha256:pause-latest", false);
        add(PUBLIC_IMAGE_WITH_TAG, "sha256:pause-3.9", false);
        add(PUBLIC_IMAGE_WITH_DIGEST, "sha256:digest", true);
        add(CONCURRENT_REMOVAL_IMAGE, "sha256:tag-test", false);
        for tag in SAME_CONTENT_TAGS {
            add(&format!("{TEST_IMAGE_REGISTRY}{tag}"), "sha256:same", false);
        }
        for (n, name) in DISTINCT_CONTENT_IMAGES.iter().enumerate() {
            add(
                &format!("{TEST_IMAGE_REGISTRY}{name}:latest"),
                &format!("sha256:distinct-{n}"),
                false,
            );
        }

        Arc::new(Self {
            state: Mutex::new(state),
            stop_delay: Mutex::new(Duration::ZERO),
            network_ready: Mutex::new(true),
            stop_leaves_running: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
            remove_image_calls: AtomicUsize::new(0),
            reopen_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *lock(&self.stop_delay) = delay;
    }

    pub fn sandbox_count(&self) -> usize {
        lock(&self.state).sandboxes.len()
    }

    pub fn container_count(&self) -> usize {
        lock(&self.state).containers.len()
    }

    pub fn has_image(&self, reference: &str) -> bool {
        lock(&self.state).find_image(reference).is_some()
    }

    pub fn container_state(&self, id: &str) -> Option<ContainerState> {
        lock(&self.state).containers.get(id).map(|c| c.state)
    }
}

/// Clients and environment wired to `fake`.
pub fn runtime_client(fake: &Arc<FakeCri>) -> RuntimeClient {
    let images = ImageClient::new(fake.clone());
    RuntimeClient::new(fake.clone(), images)
}

pub fn environment(fake: &Arc<FakeCri>) -> Arc<Environment> {
    Arc::new(Environment::new(runtime_client(fake)))
}

/// Host file behind `path` inside the container, through its bind mounts.
fn host_path(mounts: &[Mount], path: &str) -> Option<PathBuf> {
    mounts.iter().find_map(|mount| {
        let rest = path.strip_prefix(&mount.container_path)?;
        Some(Path::new(&mount.host_path).join(rest.trim_start_matches('/')))
    })
}

fn labels_match(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn stats_for(id: &str, container: &FakeContainer) -> ContainerStats {
    ContainerStats {
        attributes: Some(ContainerAttributes {
            id: id.to_string(),
            metadata: container.config.metadata.clone(),
            labels: container.config.labels.clone(),
            annotations: HashMap::new(),
        }),
        cpu: Some(CpuUsage {
            timestamp: 1,
            usage_core_nano_seconds: Some(UInt64Value { value: 1 }),
        }),
        memory: None,
        writable_layer: None,
    }
}

#[async_trait]
impl RuntimeService for FakeCri {
    async fn version(&self, _req: VersionRequest) -> CallResult<VersionResponse> {
        Ok(VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: "fake".to_string(),
            runtime_version: "1.0.0".to_string(),
            runtime_api_version: "v1".to_string(),
        })
    }

    async fn status(&self, _req: StatusRequest) -> CallResult<StatusResponse> {
        let network = *lock(&self.network_ready);
        let condition = |kind: &str, status: bool| RuntimeCondition {
            r#type: kind.to_string(),
            status,
            reason: if status { String::new() } else { "NetworkPluginNotReady".to_string() },
            message: String::new(),
        };
        Ok(StatusResponse {
            status: Some(RuntimeStatus {
                conditions: vec![condition(RUNTIME_READY, true), condition(NETWORK_READY, network)],
            }),
            info: HashMap::from([(
                "config".to_string(),
                r#"{"cgroupDriver": "systemd"}"#.to_string(),
            )]),
        })
    }

    async fn run_pod_sandbox(&self, req: RunPodSandboxRequest) -> CallResult<RunPodSandboxResponse> {
        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("config is required"))?;
        let mut state = lock(&self.state);
        let id = state.next("sb");
        state
            .sandboxes
            .insert(id.clone(), (config, PodSandboxState::SandboxReady));
        Ok(RunPodSandboxResponse { pod_sandbox_id: id })
    }

    async fn stop_pod_sandbox(&self, req: StopPodSandboxRequest) -> CallResult<StopPodSandboxResponse> {
        let mut state = lock(&self.state);
        let Some(sandbox) = state.sandboxes.get_mut(&req.pod_sandbox_id) else {
            return Err(Status::not_found(format!("sandbox {} not found", req.pod_sandbox_id)));
        };
        sandbox.1 = PodSandboxState::SandboxNotready;
        for container in state.containers.values_mut() {
            if container.sandbox_id == req.pod_sandbox_id {
                container.exit();
            }
        }
        Ok(StopPodSandboxResponse {})
    }

    async fn remove_pod_sandbox(
        &self,
        req: RemovePodSandboxRequest,
    ) -> CallResult<RemovePodSandboxResponse> {
        let mut state = lock(&self.state);
        if state.sandboxes.remove(&req.pod_sandbox_id).is_none() {
            return Err(Status::not_found(format!("sandbox {} not found", req.pod_sandbox_id)));
        }
        state.containers.retain(|_, container| {
            if container.sandbox_id != req.pod_sandbox_id {
                return true;
            }
            container.exit();
            false
        });
        Ok(RemovePodSandboxResponse {})
    }

    async fn pod_sandbox_status(
        &self,
        req: PodSandboxStatusRequest,
    ) -> CallResult<PodSandboxStatusResponse> {
        let state = lock(&self.state);
        let Some((config, sandbox_state)) = state.sandboxes.get(&req.pod_sandbox_id) else {
            return Err(Status::not_found(format!("sandbox {} not found", req.pod_sandbox_id)));
        };
        let namespace_options = config
            .linux
            .as_ref()
            .and_then(|l| l.security_context.as_ref())
            .and_then(|s| s.namespace_options.clone());
        Ok(PodSandboxStatusResponse {
            status: Some(PodSandboxStatus {
                id: req.pod_sandbox_id.clone(),
                metadata: config.metadata.clone(),
                state: *sandbox_state as i32,
                labels: config.labels.clone(),
                linux: Some(LinuxPodSandboxStatus {
                    namespaces: Some(Namespace {
                        options: namespace_options,
                    }),
                }),
                ..Default::default()
            }),
            info: HashMap::new(),
        })
    }

    async fn list_pod_sandbox(&self, req: ListPodSandboxRequest) -> CallResult<ListPodSandboxResponse> {
        let filter = req.filter.unwrap_or_default();
        let state = lock(&self.state);
        let items = state
            .sandboxes
            .iter()
            .filter(|(id, _)| filter.id.is_empty() || **id == filter.id)
            .filter(|(_, (config, _))| labels_match(&config.labels, &filter.label_selector))
            .map(|(id, (config, sandbox_state))| PodSandbox {
                id: id.clone(),
                metadata: config.metadata.clone(),
                state: *sandbox_state as i32,
                labels: config.labels.clone(),
                ..Default::default()
            })
            .collect();
        Ok(ListPodSandboxResponse { items })
    }

    async fn create_container(
        &self,
        req: CreateContainerRequest,
    ) -> CallResult<CreateContainerResponse> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("config is required"))?;
        let image = config.image.clone().unwrap_or_default().image;

        let mut state = lock(&self.state);
        let Some((sandbox_config, _)) = state.sandboxes.get(&req.pod_sandbox_id) else {
            return Err(Status::not_found(format!("sandbox {} not found", req.pod_sandbox_id)));
        };
        let log_file = (!sandbox_config.log_directory.is_empty() && !config.log_path.is_empty())
            .then(|| Path::new(&sandbox_config.log_directory).join(&config.log_path));
        if state.find_image(&image).is_none() {
            return Err(Status::not_found(format!(
                "failed to get image \"{image}\": not found"
            )));
        }
        let id = state.next("ct");
        state.containers.insert(
            id.clone(),
            FakeContainer {
                sandbox_id: req.pod_sandbox_id,
                config,
                state: ContainerState::ContainerCreated,
                log_file,
                log_sink: None,
                writer: None,
            },
        );
        Ok(CreateContainerResponse { container_id: id })
    }

    async fn start_container(&self, req: StartContainerRequest) -> CallResult<StartContainerResponse> {
        let mut state = lock(&self.state);
        let Some(container) = state.containers.get_mut(&req.container_id) else {
            return Err(Status::not_found(format!("container {} not found", req.container_id)));
        };
        if container.state != ContainerState::ContainerCreated {
            return Err(Status::failed_precondition(format!(
                "container {} is not in created state",
                req.container_id
            )));
        }
        container.state = ContainerState::ContainerRunning;

        let mut sink = match &container.log_file {
            Some(path) => Some(open_log(path).map_err(|e| Status::internal(e.to_string()))?),
            None => None,
        };
        let command = container.config.command.clone();
        let argv: Vec<&str> = command.iter().map(String::as_str).collect();
        match argv.as_slice() {
            ["echo", text @ ..] => {
                if let Some(file) = sink.as_mut() {
                    write_log_line(file, &text.join(" "))
                        .map_err(|e| Status::internal(e.to_string()))?;
                }
                container.exit();
            }
            ["sh", "-c", script] => {
                if let (Some(text), Some(file)) = (echo_loop_text(script), sink.take()) {
                    let file = Arc::new(Mutex::new(file));
                    let stop = CancellationToken::new();
                    container.log_sink = Some(file.clone());
                    container.writer = Some(stop.clone());
                    tokio::spawn(echo_loop(file, text, stop));
                }
            }
            _ => {}
        }
        Ok(StartContainerResponse {})
    }

    async fn stop_container(&self, req: StopContainerRequest) -> CallResult<StopContainerResponse> {
        let delay = *lock(&self.stop_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        let Some(container) = state.containers.get_mut(&req.container_id) else {
            return Err(Status::not_found(format!("container {} not found", req.container_id)));
        };
        if !self.stop_leaves_running.load(Ordering::SeqCst) {
            container.exit();
        }
        Ok(StopContainerResponse {})
    }

    async fn remove_container(
        &self,
        req: RemoveContainerRequest,
    ) -> CallResult<RemoveContainerResponse> {
        let mut state = lock(&self.state);
        let Some(mut container) = state.containers.remove(&req.container_id) else {
            return Err(Status::not_found(format!("container {} not found", req.container_id)));
        };
        container.exit();
        Ok(RemoveContainerResponse {})
    }

    async fn list_containers(&self, req: ListContainersRequest) -> CallResult<ListContainersResponse> {
        let filter = req.filter.unwrap_or_default();
        let state = lock(&self.state);
        let containers = state
            .containers
            .iter()
            .filter(|(id, _)| filter.id.is_empty() || **id == filter.id)
            .filter(|(_, c)| filter.pod_sandbox_id.is_empty() || c.sandbox_id == filter.pod_sandbox_id)
            .filter(|(_, c)| labels_match(&c.config.labels, &filter.label_selector))
            .map(|(id, c)| Container {
                id: id.clone(),
                pod_sandbox_id: c.sandbox_id.clone(),
                metadata: c.config.metadata.clone(),
                image: c.config.image.clone(),
                state: c.state as i32,
                labels: c.config.labels.clone(),
                ..Default::default()
            })
            .collect();
        Ok(ListContainersResponse { containers })
    }

    async fn container_status(
        &self,
        req: ContainerStatusRequest,
    ) -> CallResult<ContainerStatusResponse> {
        let state = lock(&self.state);
        let Some(container) = state.containers.get(&req.container_id) else {
            return Err(Status::not_found(format!("container {} not found", req.container_id)));
        };
        Ok(ContainerStatusResponse {
            status: Some(ContainerStatus {
                id: req.container_id.clone(),
                metadata: container.config.metadata.clone(),
                state: container.state as i32,
                image: container.config.image.clone(),
                labels: container.config.labels.clone(),
                mounts: container.config.mounts.clone(),
                log_path: container.config.log_path.clone(),
                ..Default::default()
            }),
            info: HashMap::new(),
        })
    }

    async fn exec_sync(&self, req: ExecSyncRequest) -> CallResult<ExecSyncResponse> {
        let mounts = {
            let state = lock(&self.state);
            let Some(container) = state.containers.get(&req.container_id) else {
                return Err(Status::not_found(format!("container {} not found", req.container_id)));
            };
            if container.state != ContainerState::ContainerRunning {
                return Err(Status::failed_precondition("container is not running"));
            }
            container.config.mounts.clone()
        };

        let argv: Vec<&str> = req.cmd.iter().map(String::as_str).collect();
        let (stdout, exit_code) = match argv.as_slice() {
            ["echo", rest @ ..] => (format!("{}\n", rest.join(" ")), 0),
            ["cat", path] => match host_path(&mounts, path).map(std::fs::read_to_string) {
                Some(Ok(content)) => (content, 0),
                _ => (String::new(), 1),
            },
            ["sleep", _] => {
                tokio::time::sleep(Duration::from_secs(req.timeout.max(0) as u64)).await;
                return Err(Status::deadline_exceeded("command timed out"));
            }
            ["pgrep", _] => (String::new(), 1),
            ["panic"] => panic!("fake runtime asked to panic"),
            _ => (String::new(), 0),
        };
        Ok(ExecSyncResponse {
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
            exit_code,
        })
    }

    async fn container_stats(&self, req: ContainerStatsRequest) -> CallResult<ContainerStatsResponse> {
        let state = lock(&self.state);
        let Some(container) = state.containers.get(&req.container_id) else {
            return Err(Status::not_found(format!("container {} not found", req.container_id)));
        };
        Ok(ContainerStatsResponse {
            stats: Some(stats_for(&req.container_id, container)),
        })
    }

    async fn list_container_stats(
        &self,
        req: ListContainerStatsRequest,
    ) -> CallResult<ListContainerStatsResponse> {
        let filter = req.filter.unwrap_or_default();
        let state = lock(&self.state);
        let stats = state
            .containers
            .iter()
            .filter(|(id, _)| filter.id.is_empty() || **id == filter.id)
            .filter(|(_, c)| filter.pod_sandbox_id.is_empty() || c.sandbox_id == filter.pod_sandbox_id)
            .filter(|(_, c)| labels_match(&c.config.labels, &filter.label_selector))
            .map(|(id, c)| stats_for(id, c))
            .collect();
        Ok(ListContainerStatsResponse { stats })
    }

    async fn reopen_container_log(
        &self,
        req: ReopenContainerLogRequest,
    ) -> CallResult<ReopenContainerLogResponse> {
        self.reopen_calls.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        let Some(container) = state.containers.get(&req.container_id) else {
            return Err(Status::not_found(format!("container {} not found", req.container_id)));
        };
        if container.state != ContainerState::ContainerRunning {
            return Err(Status::failed_precondition("container is not running"));
        }
        if let (Some(path), Some(sink)) = (&container.log_file, &container.log_sink) {
            *lock(sink) = open_log(path).map_err(|e| Status::internal(e.to_string()))?;
        }
        Ok(ReopenContainerLogResponse {})
    }
}

#[async_trait]
impl ImageService for FakeCri {
    async fn list_images(&self, req: ListImagesRequest) -> CallResult<ListImagesResponse> {
        let wanted = req.filter.and_then(|f| f.image).map(|spec| spec.image);
        let state = lock(&self.state);
        let images = match wanted {
            Some(reference) => state.find_image(&reference).cloned().into_iter().collect(),
            None => state.images.values().cloned().collect(),
        };
        Ok(ListImagesResponse { images })
    }

    async fn image_status(&self, req: ImageStatusRequest) -> CallResult<ImageStatusResponse> {
        let reference = req.image.unwrap_or_default().image;
        let state = lock(&self.state);
        Ok(ImageStatusResponse {
            image: state.find_image(&reference).cloned(),
            info: HashMap::new(),
        })
    }

    async fn pull_image(&self, req: PullImageRequest) -> CallResult<PullImageResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let reference = normalize_reference(&req.image.unwrap_or_default().image);
        let mut state = lock(&self.state);
        let Some(entry) = state.catalogue.get(&reference).cloned() else {
            return Err(Status::not_found(format!("{reference}: not found in registry")));
        };

        let image = state.images.entry(entry.id.clone()).or_insert_with(|| Image {
            id: entry.id.clone(),
            size: entry.size,
            ..Default::default()
        });
        let names = if entry.by_digest {
            &mut image.repo_digests
        } else {
            &mut image.repo_tags
        };
        if !names.contains(&reference) {
            names.push(reference);
        }
        Ok(PullImageResponse {
            image_ref: entry.id,
        })
    }

    async fn remove_image(&self, req: RemoveImageRequest) -> CallResult<RemoveImageResponse> {
        self.remove_image_calls.fetch_add(1, Ordering::SeqCst);
        let reference = req.image.unwrap_or_default().image;
        let mut state = lock(&self.state);
        let Some(id) = state.find_image(&reference).map(|image| image.id.clone()) else {
            return Err(Status::not_found(format!("image {reference} not found")));
        };
        state.images.remove(&id);
        Ok(RemoveImageResponse {})
    }
}
