//! Harness configuration.
//!
//! Loaded from an optional TOML file, then overridden field by field from
//! the command line (which also reads `CONTAINER_RUNTIME_ENDPOINT` and
//! `IMAGE_SERVICE_ENDPOINT`).
//!
//! ```toml
//! runtime_endpoint = "unix:///run/containerd/containerd.sock"
//! call_timeout_secs = 30
//! focus = "Conformance"
//! skip = "Serial"
//! parallel = 4
//! ```

use crate::constants::{DEFAULT_CALL_TIMEOUT, DEFAULT_RUNTIME_ENDPOINT};
use crate::cri::unix_socket_path;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Runtime service socket.
    pub runtime_endpoint: String,
    /// Image service socket; the runtime endpoint when unset.
    pub image_endpoint: Option<String>,
    /// Bound on each CRI call, in seconds.
    pub call_timeout_secs: u64,
    /// Only leaves whose path matches run.
    pub focus: Option<String>,
    /// Leaves whose path matches are skipped.
    pub skip: Option<String>,
    /// Leaves run concurrently.
    pub parallel: usize,
    /// Handler passed to RunPodSandbox.
    pub runtime_handler: String,
    /// Where to write the JSON report.
    pub report_json: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_endpoint: DEFAULT_RUNTIME_ENDPOINT.to_string(),
            image_endpoint: None,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs(),
            focus: None,
            skip: None,
            parallel: 1,
            runtime_handler: String::new(),
            report_json: None,
        }
    }
}

impl Config {
    /// Parses a TOML file. Absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// The image endpoint, falling back to the runtime endpoint.
    pub fn image_endpoint(&self) -> &str {
        self.image_endpoint
            .as_deref()
            .unwrap_or(&self.runtime_endpoint)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(Error::Config("parallel must be at least 1".to_string()));
        }
        if self.call_timeout_secs == 0 {
            return Err(Error::Config("call timeout must be non-zero".to_string()));
        }
        unix_socket_path(&self.runtime_endpoint)?;
        unix_socket_path(self.image_endpoint())?;
        Ok(())
    }
}
