//! # Scenario Library
//!
//! Concrete conformance scenarios, grouped by subject. Each module exposes a
//! `register` function; [`register_all`] is the single entry point that
//! populates a [`Registry`].
//!
//! | Module | Group |
//! |--------|-------|
//! | `runtime_info` | `[k8s.io] Runtime info` |
//! | `pod` | `[k8s.io] PodSandbox` |
//! | `container` | `[k8s.io] Container` |
//! | `security` | `[k8s.io] Security Context` |
//! | `networking` | `[k8s.io] Networking` |
//! | `image` | `[k8s.io] Image Manager` |
//! | `consistency` | `[k8s.io] Image Consistency [Serial]` |

pub mod common;
mod consistency;
mod container;
mod image;
mod networking;
mod pod;
mod runtime_info;
mod security;

use crate::suite::Registry;

/// Registers every scenario in source order.
pub fn register_all(registry: &mut Registry) {
    runtime_info::register(registry);
    pod::register(registry);
    container::register(registry);
    security::register(registry);
    networking::register(registry);
    image::register(registry);
    consistency::register(registry);
}
