//! Version and status reporting.

use crate::cri::{NETWORK_READY, RUNTIME_READY};
use crate::expect::{be_empty, be_true, contain_element, equal, expect, not};
use crate::suite::Registry;

pub fn register(registry: &mut Registry) {
    registry.describe("[k8s.io] Runtime info", |group| {
        group.it("runtime should report its version [Conformance]", |ctx| async move {
            let version = ctx.runtime().version().await?;
            expect(&version.runtime_api_version).to(equal("v1"))?;
            expect(&version.runtime_name).to(not(be_empty()))?;
            expect(&version.runtime_version).to(not(be_empty()))
        });

        group.it("runtime should report ready conditions [Conformance]", |ctx| async move {
            let status = ctx.runtime().status(false).await?.status.unwrap_or_default();
            let types: Vec<&str> = status.conditions.iter().map(|c| c.r#type.as_str()).collect();
            for required in [RUNTIME_READY, NETWORK_READY] {
                expect(&types).to(contain_element(required))?;
                let ready = status
                    .conditions
                    .iter()
                    .any(|c| c.r#type == required && c.status);
                expect(ready)
                    .described_as(format!("condition {required}"))
                    .to(be_true())?;
            }
            Ok(())
        });
    });
}
