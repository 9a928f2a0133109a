//! Security context scenarios: privileged containers and namespaced sysctls.

use super::common::{create_container, exec, exec_ok, long_running, run_sandbox_with, start_container};
use crate::expect::{equal, expect, not_zero};
use crate::suite::Registry;
use std::collections::HashMap;

const SYSCTL_KEY: &str = "kernel.shm_rmid_forced";
const SYSCTL_PATH: &str = "/proc/sys/kernel/shm_rmid_forced";

/// Needs CAP_NET_ADMIN, which only a privileged container holds.
const PRIVILEGED_COMMAND: [&str; 3] = [
    "sh",
    "-c",
    "ip link add cricheck0 type dummy && ip link del cricheck0",
];

pub fn register(registry: &mut Registry) {
    registry.describe("[k8s.io] Security Context", |group| {
        group.it(
            "runtime should support privileged container [Conformance]",
            |ctx| async move {
                let sandbox = run_sandbox_with(&ctx, ctx.fixtures().sandbox("privileged").await.build())
                    .await?;
                let id = create_container(&ctx, &sandbox, long_running("privileged").with_privileged())
                    .await?;
                start_container(&ctx, &id).await?;
                exec_ok(&ctx, &id, &PRIVILEGED_COMMAND).await?;
                Ok(())
            },
        );

        group.it(
            "runtime should not grant privileges to an unprivileged container [Conformance]",
            |ctx| async move {
                let sandbox = run_sandbox_with(&ctx, ctx.fixtures().sandbox("unprivileged").await.build())
                    .await?;
                let id = create_container(&ctx, &sandbox, long_running("unprivileged")).await?;
                start_container(&ctx, &id).await?;
                let output = exec(&ctx, &id, &PRIVILEGED_COMMAND).await?;
                expect(output.exit_code).to(not_zero())
            },
        );

        group.it(
            "runtime should support sysctls [Conformance]",
            |ctx| async move {
                let fixture = ctx
                    .fixtures()
                    .sandbox("sysctl")
                    .await
                    .with_sysctls(HashMap::from([(SYSCTL_KEY.to_string(), "1".to_string())]))
                    .build();
                let sandbox = run_sandbox_with(&ctx, fixture).await?;
                let id = create_container(&ctx, &sandbox, long_running("sysctl")).await?;
                start_container(&ctx, &id).await?;
                let value = exec_ok(&ctx, &id, &["cat", SYSCTL_PATH]).await?;
                expect(value.trim_end()).to(equal("1"))
            },
        );
    });
}
