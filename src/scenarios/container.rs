//! Container lifecycle, exec, stats, mount and log scenarios.
//!
//! Every leaf runs inside a sandbox with a host log directory, started by the
//! group's before-each hook and handed over through the context.

use super::common::{
    create_container, defer_host_dir_removal, exec, exec_ok, expect_listed, long_running,
    run_container, run_sandbox_with, start_container, stop_container, wait_for_state, Sandbox,
};
use crate::constants::{DEFAULT_CONTAINER_IMAGE, LONG_RUNNING_COMMAND};
use crate::cri::{ContainerState, ContainerStatsFilter};
use crate::error::{Error, Result};
use crate::expect::{
    be_empty, be_true, contain_element, equal, eventually, consistently, expect, expect_ok,
    have_len, not_zero,
};
use crate::fixture::{bind_mount, unique_name, ContainerBuilder, HostDir};
use crate::logs::{count_log_lines, read_log_file, serialize_records};
use crate::poll::Poller;
use crate::suite::{Context, Registry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub fn register(registry: &mut Registry) {
    registry.describe("[k8s.io] Container", |group| {
        group.before_each(|ctx| async move {
            let fixture = ctx
                .fixtures()
                .sandbox("container")
                .await
                .with_log_directory()?
                .build();
            let sandbox = run_sandbox_with(&ctx, fixture).await?;
            ctx.set(sandbox);
            Ok(())
        });

        group.describe("runtime should support basic operations on container", |basic| {
            basic.it("runtime should support creating container [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let id = create_container(&ctx, &sandbox, long_running("create")).await?;
                expect_listed(&ctx, &id).await?;
                wait_for_state(&ctx, &id, ContainerState::ContainerCreated).await
            });

            basic.it("runtime should support starting container [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let id = create_container(&ctx, &sandbox, long_running("start")).await?;
                start_container(&ctx, &id).await
            });

            basic.it("runtime should support stopping container [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let id = run_container(&ctx, &sandbox, "stop").await?;
                stop_container(&ctx, &id).await
            });

            basic.it("runtime should support removing container [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let id = create_container(&ctx, &sandbox, long_running("remove")).await?;
                ctx.runtime().teardown_container(&id).await?;
                ctx.runtime().teardown_container(&id).await?;

                let filter = crate::cri::ContainerFilter {
                    id: id.clone(),
                    ..Default::default()
                };
                let listed = ctx.runtime().list_containers(Some(filter)).await?;
                expect(listed.len()).to(equal(0usize))
            });

            basic.it(
                "runtime should support creating container with stdin and tty [Conformance]",
                |ctx| async move {
                    let sandbox: Sandbox = ctx.get()?;
                    let id = create_container(
                        &ctx,
                        &sandbox,
                        long_running("tty").with_stdin().with_stdin_once().with_tty(),
                    )
                    .await?;
                    start_container(&ctx, &id).await?;
                    let output = exec(&ctx, &id, &["echo", "tty"]).await?;
                    expect(output.stdout_str()).to(equal("tty\n"))
                },
            );

            basic.it(
                "runtime should accept or reject creating a container in a removed PodSandbox",
                |ctx| async move {
                    let sandbox: Sandbox = ctx.get()?;
                    ctx.runtime().teardown_sandbox(&sandbox.id).await?;
                    let config = long_running("orphan").build();
                    let created = ctx
                        .runtime()
                        .create_container(&sandbox.id, &config, &sandbox.config)
                        .await;
                    match created {
                        Ok(id) => {
                            info!("Runtime accepted container {} in removed sandbox", id);
                            ctx.defer_container_removal(&id);
                            Ok(())
                        }
                        Err(Error::InvalidState { .. }) => Ok(()),
                        // containerd reports a container's removed sandbox as missing.
                        Err(Error::NotFound(reason)) => {
                            info!("Runtime reported the removed sandbox as missing: {}", reason);
                            Ok(())
                        }
                        Err(err) => Err(Error::assertion(format!(
                            "expected success, an invalid-state error, or NotFound for the \
                             removed sandbox (as containerd reports it), got: {err}"
                        ))),
                    }
                },
            );
        });

        group.describe("runtime should support execSync", |execs| {
            execs.it("runtime should support execSync [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let id = run_container(&ctx, &sandbox, "exec").await?;
                let output = exec(&ctx, &id, &["echo", "hello"]).await?;
                expect(output.stdout_str()).to(equal("hello\n"))?;
                expect(output.stderr_str()).to(be_empty())?;
                expect(output.exit_code).to(equal(0))
            });

            execs.it("runtime should support execSync with timeout [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let id = run_container(&ctx, &sandbox, "exec-timeout").await?;

                let timed_out = ctx
                    .runtime()
                    .exec_sync(&id, &["sleep", "1000"], Duration::from_secs(1))
                    .await;
                match timed_out {
                    Err(err) => info!("ExecSync failed as expected: {}", err),
                    Ok(output) => expect(output.exit_code)
                        .described_as("exec of `sleep 1000` with a 1s timeout")
                        .to(not_zero())?,
                }

                // The timed-out process must not be left behind.
                let runtime = ctx.runtime();
                let container = id.as_str();
                eventually(move || async move {
                    let output = runtime
                        .exec_sync(container, &["pgrep", "sleep"], Duration::from_secs(10))
                        .await?;
                    Ok::<_, Error>(output.exit_code)
                })
                .should(equal(1))
                .await?;
                Ok(())
            });
        });

        group.describe("runtime should support container stats", |stats| {
            stats.it("runtime should support ContainerStats [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let id = run_container(&ctx, &sandbox, "stats").await?;

                let stats = ctx.runtime().container_stats(&id).await?;
                let attributes = stats.attributes.unwrap_or_default();
                expect(&attributes.id).to(equal(&id))?;

                let filter = ContainerStatsFilter {
                    id: id.clone(),
                    ..Default::default()
                };
                let listed = ctx.runtime().list_container_stats(Some(filter)).await?;
                let ids: Vec<String> = listed
                    .into_iter()
                    .filter_map(|s| s.attributes.map(|a| a.id))
                    .collect();
                expect(&ids).to(have_len(1))?;
                expect(&ids).to(contain_element(&id))
            });

            stats.it(
                "runtime should support ListContainerStats filtered by label [Conformance]",
                |ctx| async move {
                    let sandbox: Sandbox = ctx.get()?;
                    let run = unique_name("stats");
                    let selected = HashMap::from([
                        ("cricheck.io/run".to_string(), run.clone()),
                        ("cricheck.io/role".to_string(), "selected".to_string()),
                    ]);
                    let other = HashMap::from([
                        ("cricheck.io/run".to_string(), run),
                        ("cricheck.io/role".to_string(), "other".to_string()),
                    ]);

                    let mut wanted = Vec::new();
                    for labels in [selected.clone(), other] {
                        let id = create_container(
                            &ctx,
                            &sandbox,
                            long_running("labelled").with_labels(labels.clone()),
                        )
                        .await?;
                        start_container(&ctx, &id).await?;
                        if labels == selected {
                            wanted.push(id);
                        }
                    }

                    let filter = ContainerStatsFilter {
                        label_selector: selected.clone(),
                        ..Default::default()
                    };
                    let listed = ctx.runtime().list_container_stats(Some(filter)).await?;
                    expect(listed.len()).to(equal(wanted.len()))?;
                    for entry in listed {
                        let attributes = entry.attributes.unwrap_or_default();
                        for (key, value) in &selected {
                            expect(attributes.labels.get(key))
                                .described_as(format!("label {key} of {}", attributes.id))
                                .to(equal(value))?;
                        }
                        expect(&wanted).to(contain_element(&attributes.id))?;
                    }
                    Ok(())
                },
            );
        });

        group.describe("runtime should support mounts", |mounts| {
            mounts.it("runtime should support starting container with volume [Conformance]", |ctx| async move {
                check_host_path_mount(&ctx, false).await
            });

            mounts.it(
                "runtime should support starting container with volume when host path is a symlink [Conformance]",
                |ctx| async move { check_host_path_mount(&ctx, true).await },
            );
        });

        group.describe("runtime should support log", |logs| {
            logs.it("runtime should support starting container with log [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let log_path = format!("{}.log", unique_name("echo"));
                let id = create_container(
                    &ctx,
                    &sandbox,
                    ContainerBuilder::new("log", DEFAULT_CONTAINER_IMAGE)
                        .with_command(&["echo", "hello"])
                        .with_log_path(&log_path),
                )
                .await?;
                ctx.runtime().start_container(&id).await?;
                wait_for_state(&ctx, &id, ContainerState::ContainerExited).await?;

                let path = log_file(&sandbox, &log_path)?;
                eventually(|| count_log_lines(&path))
                    .within(Poller::log_appearance())
                    .should(not_zero())
                    .await?;
                let records = read_log_file(&path).await?;
                expect(records.len()).to(equal(1usize))?;
                expect(records[0].stream.as_str()).to(equal("stdout"))?;
                expect(&records[0].payload).to(equal("hello\n"))?;

                let written = tokio::fs::read_to_string(&path).await?;
                expect(serialize_records(&records).trim_end_matches('\n'))
                    .described_as("re-serialized log file")
                    .to(equal(written.trim_end_matches('\n')))
            });

            logs.it("runtime should support reopening container log [Conformance]", |ctx| async move {
                let sandbox: Sandbox = ctx.get()?;
                let log_path = format!("{}.log", unique_name("reopen"));
                let id = create_container(
                    &ctx,
                    &sandbox,
                    ContainerBuilder::new("reopen", DEFAULT_CONTAINER_IMAGE)
                        .with_command(&["sh", "-c", "while true; do echo hello World; sleep 0.1; done"])
                        .with_log_path(&log_path),
                )
                .await?;
                start_container(&ctx, &id).await?;

                let path = log_file(&sandbox, &log_path)?;
                eventually(|| count_log_lines(&path))
                    .within(Poller::log_appearance())
                    .should(not_zero())
                    .await?;

                let rotated = PathBuf::from(format!("{}.1", path.display()));
                tokio::fs::rename(&path, &rotated).await?;
                ctx.runtime().reopen_container_log(&id).await?;

                eventually(|| exists(&path))
                    .within(Poller::log_appearance())
                    .should(be_true())
                    .await?;
                eventually(|| count_log_lines(&path))
                    .within(Poller::log_appearance())
                    .should(not_zero())
                    .await?;

                let settled = count_log_lines(&rotated).await?;
                consistently(|| count_log_lines(&rotated))
                    .should(equal(settled))
                    .await?;
                Ok(())
            });
        });
    });
}

fn log_file(sandbox: &Sandbox, relative: &str) -> Result<PathBuf> {
    sandbox
        .log_file(relative)
        .ok_or_else(|| Error::Internal("sandbox has no log directory".to_string()))
}

async fn exists(path: &Path) -> Result<bool> {
    Ok(tokio::fs::try_exists(path).await?)
}

/// Mounts a host directory holding a marker file and reads it back from the
/// container, optionally through `<dir>-symlink`.
async fn check_host_path_mount(ctx: &Context, through_symlink: bool) -> Result<()> {
    let sandbox: Sandbox = ctx.get()?;
    let dir = HostDir::create(&sandbox.id)?;
    let marker = unique_name("marker");
    tokio::fs::write(dir.path().join("marker"), &marker).await?;

    let host_path = if through_symlink {
        dir.create_symlink()?
    } else {
        dir.path().to_path_buf()
    };
    defer_host_dir_removal(ctx, dir);

    let id = create_container(
        ctx,
        &sandbox,
        ContainerBuilder::new("mount", DEFAULT_CONTAINER_IMAGE)
            .with_command(&LONG_RUNNING_COMMAND)
            .with_mounts(vec![bind_mount(&host_path, "/mnt/host")]),
    )
    .await?;
    start_container(ctx, &id).await?;

    let status = expect_ok(ctx.runtime().container_status(&id, false).await, "ContainerStatus")?;
    let container_paths: Vec<&str> = status
        .mounts
        .iter()
        .map(|m| m.container_path.as_str())
        .collect();
    expect(&container_paths).to(contain_element("/mnt/host"))?;

    let content = exec_ok(ctx, &id, &["cat", "/mnt/host/marker"]).await?;
    expect(content).to(equal(marker))
}
