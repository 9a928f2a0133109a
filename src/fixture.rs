//! Fixture builder.
//!
//! Canonical sandbox and container configurations with unique names
//! (`<prefix>-<uuid>`), attempt zero, the harness label, and a cgroup parent
//! probed from the runtime once per process.
//!
//! ```rust,ignore
//! let sandbox = fixtures
//!     .sandbox("dns")
//!     .await
//!     .with_dns_config(&["8.8.8.8"], &["google.com"], &["ndots:8"])
//!     .build();
//! let container = ContainerBuilder::new("shell", DEFAULT_CONTAINER_IMAGE)
//!     .with_command(&["sh", "-c", "top"])
//!     .build();
//! ```

use crate::constants::{
    CGROUPFS_CGROUP_PARENT, DEFAULT_POD_NAMESPACE, HARNESS_LABEL_KEY, HARNESS_LABEL_VALUE,
    SYSTEMD_CGROUP_PARENT,
};
use crate::cri::{
    ContainerConfig, ContainerMetadata, DnsConfig, ImageSpec, LinuxContainerConfig,
    LinuxContainerSecurityContext, LinuxPodSandboxConfig, Mount,
    NamespaceMode, PodSandboxConfig, PodSandboxMetadata, PortMapping,
};
use crate::error::Result;
use crate::runtime::RuntimeClient;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Returns `<prefix>-<uuid v4>`.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Labels attached to every sandbox.
pub fn default_pod_labels() -> HashMap<String, String> {
    HashMap::from([(HARNESS_LABEL_KEY.to_string(), HARNESS_LABEL_VALUE.to_string())])
}

/// Picks the cgroup parent matching the runtime's cgroup driver, as reported
/// in the verbose `Status` info.
pub fn cgroup_parent_from_info(info: &HashMap<String, String>) -> &'static str {
    let systemd = info.values().any(|value| {
        let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        compact.contains("\"systemdCgroup\":true")
            || compact.contains("\"SystemdCgroup\":true")
            || compact.contains("\"cgroup_manager\":\"systemd\"")
            || compact.contains("\"cgroupDriver\":\"systemd\"")
    });
    if systemd {
        SYSTEMD_CGROUP_PARENT
    } else {
        CGROUPFS_CGROUP_PARENT
    }
}

// =============================================================================
// Host Directories
// =============================================================================

/// Host temp directory owned by one scenario.
///
/// Created with prefix `test<pod id>`; removed explicitly through
/// [`HostDir::remove`] in a teardown, or on drop as a fallback.
#[derive(Debug)]
pub struct HostDir {
    dir: TempDir,
}

impl HostDir {
    pub fn create(pod_id: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("test{pod_id}"))
            .tempdir()?;
        debug!("Created host dir {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the sibling symlink `<dir>-symlink`.
    pub fn symlink_path(&self) -> PathBuf {
        let mut name = self.dir.path().as_os_str().to_owned();
        name.push("-symlink");
        PathBuf::from(name)
    }

    /// Creates `<dir>-symlink` pointing at the directory.
    #[cfg(unix)]
    pub fn create_symlink(&self) -> Result<PathBuf> {
        let link = self.symlink_path();
        std::os::unix::fs::symlink(self.dir.path(), &link)?;
        Ok(link)
    }

    /// Removes the directory and its symlink if one was made.
    pub fn remove(self) -> Result<()> {
        let link = self.symlink_path();
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)?;
        }
        self.dir.close()?;
        Ok(())
    }
}

// =============================================================================
// Sandbox Builder
// =============================================================================

/// Per-process fixture factory.
pub struct Fixtures {
    runtime: RuntimeClient,
    cgroup_parent: OnceCell<String>,
}

impl Fixtures {
    pub fn new(runtime: RuntimeClient) -> Self {
        Self {
            runtime,
            cgroup_parent: OnceCell::new(),
        }
    }

    /// Cgroup parent for sandboxes, probed once. Falls back to the cgroupfs
    /// layout if the runtime cannot be asked.
    pub async fn cgroup_parent(&self) -> String {
        self.cgroup_parent
            .get_or_init(|| async {
                match self.runtime.status(true).await {
                    Ok(status) => cgroup_parent_from_info(&status.info).to_string(),
                    Err(err) => {
                        warn!("Cgroup driver probe failed ({}), assuming cgroupfs", err);
                        CGROUPFS_CGROUP_PARENT.to_string()
                    }
                }
            })
            .await
            .clone()
    }

    /// Starts a sandbox configuration named `<prefix>-<uuid>`.
    pub async fn sandbox(&self, prefix: &str) -> SandboxBuilder {
        SandboxBuilder::new(prefix, &self.cgroup_parent().await)
    }
}

/// Sandbox configuration plus the host log directory it may own.
#[derive(Debug)]
pub struct SandboxFixture {
    pub config: PodSandboxConfig,
    pub log_dir: Option<HostDir>,
}

/// Builder for [`PodSandboxConfig`].
#[derive(Debug)]
pub struct SandboxBuilder {
    config: PodSandboxConfig,
    log_dir: Option<HostDir>,
}

impl SandboxBuilder {
    pub fn new(prefix: &str, cgroup_parent: &str) -> Self {
        let config = PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: unique_name(prefix),
                uid: unique_name(&format!("{prefix}-uid")),
                namespace: DEFAULT_POD_NAMESPACE.to_string(),
                attempt: 0,
            }),
            labels: default_pod_labels(),
            linux: Some(LinuxPodSandboxConfig {
                cgroup_parent: cgroup_parent.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        Self {
            config,
            log_dir: None,
        }
    }

    fn linux(&mut self) -> &mut LinuxPodSandboxConfig {
        self.config.linux.get_or_insert_with(Default::default)
    }

    /// Allocates a host temp dir and uses it as the sandbox log directory.
    pub fn with_log_directory(mut self) -> Result<Self> {
        let uid = self
            .config
            .metadata
            .as_ref()
            .map(|m| m.uid.clone())
            .unwrap_or_default();
        let dir = HostDir::create(&uid)?;
        self.config.log_directory = dir.path().to_string_lossy().into_owned();
        self.log_dir = Some(dir);
        Ok(self)
    }

    pub fn with_dns_config(mut self, servers: &[&str], searches: &[&str], options: &[&str]) -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        self.config.dns_config = Some(DnsConfig {
            servers: owned(servers),
            searches: owned(searches),
            options: owned(options),
        });
        self
    }

    pub fn with_port_mappings(mut self, mappings: Vec<PortMapping>) -> Self {
        self.config.port_mappings = mappings;
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.config.hostname = hostname.to_string();
        self
    }

    pub fn with_sysctls(mut self, sysctls: HashMap<String, String>) -> Self {
        self.linux().sysctls = sysctls;
        self
    }

    /// Runs the sandbox in the node's network namespace.
    pub fn with_host_network(mut self) -> Self {
        let security = self
            .linux()
            .security_context
            .get_or_insert_with(Default::default);
        let namespaces = security
            .namespace_options
            .get_or_insert_with(Default::default);
        namespaces.set_network(NamespaceMode::Node);
        self
    }

    pub fn build(self) -> SandboxFixture {
        SandboxFixture {
            config: self.config,
            log_dir: self.log_dir,
        }
    }
}

// =============================================================================
// Container Builder
// =============================================================================

/// Builder for [`ContainerConfig`].
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    config: ContainerConfig,
}

impl ContainerBuilder {
    /// Container named `<prefix>-<uuid>` running `image`.
    pub fn new(prefix: &str, image: &str) -> Self {
        Self {
            config: ContainerConfig {
                metadata: Some(ContainerMetadata {
                    name: unique_name(prefix),
                    attempt: 0,
                }),
                image: Some(ImageSpec {
                    image: image.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    fn security_context(&mut self) -> &mut LinuxContainerSecurityContext {
        self.config
            .linux
            .get_or_insert_with(LinuxContainerConfig::default)
            .security_context
            .get_or_insert_with(Default::default)
    }

    pub fn with_command(mut self, argv: &[&str]) -> Self {
        self.config.command = argv.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_privileged(mut self) -> Self {
        self.security_context().privileged = true;
        self
    }

    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.config.mounts.extend(mounts);
        self
    }

    /// Log path relative to the sandbox log directory.
    pub fn with_log_path(mut self, path: &str) -> Self {
        self.config.log_path = path.to_string();
        self
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.config.labels = labels;
        self
    }

    pub fn with_stdin(mut self) -> Self {
        self.config.stdin = true;
        self
    }

    pub fn with_stdin_once(mut self) -> Self {
        self.config.stdin_once = true;
        self
    }

    pub fn with_tty(mut self) -> Self {
        self.config.tty = true;
        self
    }

    pub fn build(self) -> ContainerConfig {
        self.config
    }
}

/// Bind mount of `host_path` at `container_path`.
pub fn bind_mount(host_path: &Path, container_path: &str) -> Mount {
    Mount {
        host_path: host_path.to_string_lossy().into_owned(),
        container_path: container_path.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_parent_probe() {
        let containerd = HashMap::from([(
            "config".to_string(),
            r#"{"containerd": {"runtimes": {"runc": {"options": {"SystemdCgroup": true}}}}}"#
                .to_string(),
        )]);
        assert_eq!(cgroup_parent_from_info(&containerd), SYSTEMD_CGROUP_PARENT);

        let crio = HashMap::from([(
            "config".to_string(),
            r#"{"cgroup_manager": "systemd"}"#.to_string(),
        )]);
        assert_eq!(cgroup_parent_from_info(&crio), SYSTEMD_CGROUP_PARENT);

        assert_eq!(cgroup_parent_from_info(&HashMap::new()), CGROUPFS_CGROUP_PARENT);
    }

    #[test]
    fn test_container_builder_flags() {
        let config = ContainerBuilder::new("tty", "busybox")
            .with_stdin()
            .with_stdin_once()
            .with_tty()
            .with_privileged()
            .with_log_path("tty.log")
            .build();
        assert!(config.stdin);
        assert!(config.stdin_once);
        assert!(config.tty);
        assert!(config.linux.unwrap().security_context.unwrap().privileged);
        assert_eq!(config.log_path, "tty.log");

        let plain = ContainerBuilder::new("plain", "busybox").build();
        assert!(!plain.stdin && !plain.stdin_once && !plain.tty);
        assert!(plain.linux.is_none());
    }

    #[test]
    fn test_unique_names() {
        let a = unique_name("pod");
        let b = unique_name("pod");
        assert!(a.starts_with("pod-"));
        assert_ne!(a, b);
    }
}
