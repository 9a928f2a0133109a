//! PodSandbox lifecycle scenarios.

use super::common::run_sandbox;
use crate::cri::{PodSandboxFilter, PodSandboxState};
use crate::expect::{be_empty, equal, eventually, expect, have_len};
use crate::suite::{Context, Registry};

pub fn register(registry: &mut Registry) {
    registry.describe("[k8s.io] PodSandbox", |group| {
        group.it(
            "runtime should support running PodSandbox [Conformance]",
            |ctx| async move {
                let sandbox = run_sandbox(&ctx, "run").await?;
                let status = ctx.runtime().pod_sandbox_status(&sandbox.id).await?;
                expect(status.state())
                    .to(equal(PodSandboxState::SandboxReady))?;
                expect_listed(&ctx, &sandbox.id, 1).await
            },
        );

        group.it(
            "runtime should support stopping PodSandbox [Conformance]",
            |ctx| async move {
                let sandbox = run_sandbox(&ctx, "stop").await?;
                ctx.runtime().stop_pod_sandbox(&sandbox.id).await?;
                let runtime = ctx.runtime();
                let id = sandbox.id.as_str();
                eventually(move || async move {
                    Ok::<_, crate::Error>(runtime.pod_sandbox_status(id).await?.state())
                })
                .should(equal(PodSandboxState::SandboxNotready))
                .await?;
                Ok(())
            },
        );

        group.it(
            "runtime should support removing PodSandbox [Conformance]",
            |ctx| async move {
                let sandbox = run_sandbox(&ctx, "remove").await?;
                ctx.runtime().teardown_sandbox(&sandbox.id).await?;
                expect_listed(&ctx, &sandbox.id, 0).await?;
                // Removing again is a no-op.
                ctx.runtime().teardown_sandbox(&sandbox.id).await?;
                expect_listed(&ctx, &sandbox.id, 0).await
            },
        );

        group.it(
            "runtime should report the sandbox metadata it was given [Conformance]",
            |ctx| async move {
                let sandbox = run_sandbox(&ctx, "metadata").await?;
                let status = ctx.runtime().pod_sandbox_status(&sandbox.id).await?;
                expect(&status.id).to(equal(&sandbox.id))?;
                let want = sandbox.config.metadata.clone().unwrap_or_default();
                let got = status.metadata.unwrap_or_default();
                expect(&got.name).to(equal(&want.name))?;
                expect(&got.uid).to(equal(&want.uid))?;
                expect(&got.namespace).to(equal(&want.namespace))?;
                expect(got.attempt).to(equal(0u32))
            },
        );
    });
}

async fn expect_listed(ctx: &Context, id: &str, count: usize) -> crate::Result<()> {
    let filter = PodSandboxFilter {
        id: id.to_string(),
        ..Default::default()
    };
    let items = ctx.runtime().list_pod_sandbox(Some(filter)).await?;
    let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
    if count == 0 {
        expect(&ids).to(be_empty())
    } else {
        expect(&ids).to(have_len(count))
    }
}
