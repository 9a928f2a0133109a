//! Helpers shared by scenarios: run a sandbox or container and register its
//! teardown in one step, and wait for lifecycle transitions.

use crate::constants::{DEFAULT_CONTAINER_IMAGE, DEFAULT_EXEC_TIMEOUT, DEFAULT_STOP_TIMEOUT};
use crate::cri::{ContainerFilter, ContainerState, PodSandboxConfig};
use crate::error::Result;
use crate::expect::{equal, eventually, expect, have_len};
use crate::fixture::{ContainerBuilder, HostDir, SandboxFixture};
use crate::poll::Poller;
use crate::runtime::ExecOutput;
use crate::suite::Context;
use std::path::PathBuf;
use tracing::debug;

/// Running sandbox owned by the current leaf.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub config: PodSandboxConfig,
    pub log_dir: Option<PathBuf>,
}

impl Sandbox {
    /// Host path of a container log, given its path relative to the sandbox
    /// log directory.
    pub fn log_file(&self, relative: &str) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| dir.join(relative))
    }
}

/// Runs the default sandbox for `prefix`.
pub async fn run_sandbox(ctx: &Context, prefix: &str) -> Result<Sandbox> {
    let fixture = ctx.fixtures().sandbox(prefix).await.build();
    run_sandbox_with(ctx, fixture).await
}

/// Runs a sandbox built by the caller and registers its removal (and the
/// removal of its log directory, after the sandbox is gone).
pub async fn run_sandbox_with(ctx: &Context, fixture: SandboxFixture) -> Result<Sandbox> {
    let SandboxFixture { config, log_dir } = fixture;
    let log_path = log_dir.as_ref().map(|dir| dir.path().to_path_buf());
    if let Some(dir) = log_dir {
        defer_host_dir_removal(ctx, dir);
    }

    let id = ctx.runtime().run_pod_sandbox(&config).await?;
    ctx.defer_sandbox_removal(&id);
    Ok(Sandbox {
        id,
        config,
        log_dir: log_path,
    })
}

/// Registers removal of a host directory (and its symlink).
pub fn defer_host_dir_removal(ctx: &Context, dir: HostDir) {
    let label = format!("remove host dir {}", dir.path().display());
    ctx.defer(label, move || async move { dir.remove() });
}

/// Creates a container in `sandbox` and registers its removal.
pub async fn create_container(
    ctx: &Context,
    sandbox: &Sandbox,
    builder: ContainerBuilder,
) -> Result<String> {
    let config = builder.build();
    let id = ctx
        .runtime()
        .create_container(&sandbox.id, &config, &sandbox.config)
        .await?;
    ctx.defer_container_removal(&id);
    Ok(id)
}

/// Default image running `sh -c top`.
pub fn long_running(prefix: &str) -> ContainerBuilder {
    ContainerBuilder::new(prefix, DEFAULT_CONTAINER_IMAGE).with_command(&["sh", "-c", "top"])
}

/// Waits for the container to report `state`.
pub async fn wait_for_state(ctx: &Context, id: &str, state: ContainerState) -> Result<()> {
    let runtime = ctx.runtime();
    eventually(move || runtime.container_state(id))
        .should(equal(state))
        .await?;
    debug!("Container {} reached {:?}", id, state);
    Ok(())
}

/// Starts the container and waits for it to run.
pub async fn start_container(ctx: &Context, id: &str) -> Result<()> {
    ctx.runtime().start_container(id).await?;
    wait_for_state(ctx, id, ContainerState::ContainerRunning).await
}

/// Stops the container under the watchdog and waits for it to exit.
pub async fn stop_container(ctx: &Context, id: &str) -> Result<()> {
    ctx.runtime()
        .stop_container_and_wait(id, DEFAULT_STOP_TIMEOUT, Poller::state_transition())
        .await
}

/// Creates and starts a long-running container.
pub async fn run_container(ctx: &Context, sandbox: &Sandbox, prefix: &str) -> Result<String> {
    let id = create_container(ctx, sandbox, long_running(prefix)).await?;
    start_container(ctx, &id).await?;
    Ok(id)
}

/// ExecSync with the default timeout.
pub async fn exec(ctx: &Context, id: &str, argv: &[&str]) -> Result<ExecOutput> {
    ctx.runtime().exec_sync(id, argv, DEFAULT_EXEC_TIMEOUT).await
}

/// Runs `argv` and expects exit code 0, returning stdout.
pub async fn exec_ok(ctx: &Context, id: &str, argv: &[&str]) -> Result<String> {
    let output = exec(ctx, id, argv).await?;
    expect(output.exit_code)
        .described_as(format!(
            "exec {argv:?} in {id}: stdout {:?}, stderr {:?}",
            output.stdout_str(),
            output.stderr_str()
        ))
        .to(equal(0))?;
    Ok(output.stdout_str())
}

/// Expects exactly one listed container with `id`.
pub async fn expect_listed(ctx: &Context, id: &str) -> Result<()> {
    let filter = ContainerFilter {
        id: id.to_string(),
        ..Default::default()
    };
    let ids: Vec<String> = ctx
        .runtime()
        .list_containers(Some(filter))
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect();
    expect(&ids).to(have_len(1))?;
    expect(&ids[0]).to(equal(id))
}
