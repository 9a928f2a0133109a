//! # Scenario Registry
//!
//! Scenarios are registered into an explicit tree before anything runs:
//!
//! ```rust,ignore
//! let mut registry = Registry::new();
//! registry.describe("[k8s.io] Container", |group| {
//!     group.before_each(|ctx| async move { /* run a sandbox, ctx.set(..) */ Ok(()) });
//!     group.it("runtime should support listing container stats [Conformance]", |ctx| async move {
//!         Ok(())
//!     });
//! });
//! let plan = registry.plan(&Filter::new(Some("Container"), None)?);
//! ```
//!
//! [`Registry::plan`] flattens the tree into one [`PlannedLeaf`] per leaf with
//! its ancestors' hooks already collected: before-each root to leaf,
//! after-each leaf to root. The runner then only iterates.
//!
//! Tags are the bracketed markers in labels (`[Conformance]`, `[Serial]`) and
//! are inherited from ancestor groups.

mod context;
mod filter;
mod runner;

pub use context::{Context, Environment, Worker};
pub use filter::Filter;
pub use runner::Runner;

use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

/// Hook or body of a leaf.
pub type Step = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Tag that makes a leaf run alone.
pub const SERIAL_TAG: &str = "Serial";

fn step<F, Fut>(f: F) -> Step
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Extracts `[Tag]` markers from a label.
pub fn tags_of(label: &str) -> Vec<String> {
    label
        .split('[')
        .skip(1)
        .filter_map(|rest| rest.split_once(']'))
        .map(|(tag, _)| tag.to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

// =============================================================================
// Tree
// =============================================================================

/// Node of the scenario tree.
pub enum Node {
    Group(Group),
    Leaf(Leaf),
}

/// Terminal scenario.
pub struct Leaf {
    label: String,
    body: Step,
}

/// Group of scenarios with shared hooks.
#[derive(Default)]
pub struct Group {
    label: String,
    before_each: Vec<Step>,
    after_each: Vec<Step>,
    children: Vec<Node>,
}

impl Group {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Adds a nested group, populated by `f`.
    pub fn describe(&mut self, label: &str, f: impl FnOnce(&mut Group)) -> &mut Self {
        let mut group = Group::new(label);
        f(&mut group);
        self.children.push(Node::Group(group));
        self
    }

    /// Adds a leaf.
    pub fn it<F, Fut>(&mut self, label: &str, body: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.children.push(Node::Leaf(Leaf {
            label: label.to_string(),
            body: step(body),
        }));
        self
    }

    /// Adds a hook run before every leaf below this group.
    pub fn before_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_each.push(step(hook));
        self
    }

    /// Adds a hook run after every leaf below this group, even if the leaf
    /// failed.
    pub fn after_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after_each.push(step(hook));
        self
    }

    fn flatten(
        &self,
        labels: &mut Vec<String>,
        before: &mut Vec<Step>,
        after: &mut Vec<Vec<Step>>,
        filter: &Filter,
        out: &mut Vec<PlannedLeaf>,
    ) {
        let pushed_label = !self.label.is_empty();
        if pushed_label {
            labels.push(self.label.clone());
        }
        let before_len = before.len();
        before.extend(self.before_each.iter().cloned());
        after.push(self.after_each.clone());

        for child in &self.children {
            match child {
                Node::Group(group) => group.flatten(labels, before, after, filter, out),
                Node::Leaf(leaf) => {
                    labels.push(leaf.label.clone());
                    out.push(PlannedLeaf::new(
                        labels.clone(),
                        before.clone(),
                        leaf.body.clone(),
                        after.iter().rev().flatten().cloned().collect(),
                        filter,
                    ));
                    labels.pop();
                }
            }
        }

        after.pop();
        before.truncate(before_len);
        if pushed_label {
            labels.pop();
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide scenario tree.
#[derive(Default)]
pub struct Registry {
    root: Group,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a top-level group.
    pub fn describe(&mut self, label: &str, f: impl FnOnce(&mut Group)) -> &mut Self {
        self.root.describe(label, f);
        self
    }

    /// Root group, for top-level hooks and leaves.
    pub fn root(&mut self) -> &mut Group {
        &mut self.root
    }

    /// Flattens the tree in source order, marking leaves the filter
    /// rejects.
    pub fn plan(&self, filter: &Filter) -> Vec<PlannedLeaf> {
        let mut out = Vec::new();
        self.root
            .flatten(&mut Vec::new(), &mut Vec::new(), &mut Vec::new(), filter, &mut out);
        out
    }
}

/// Leaf with its full hook chain precomputed.
#[derive(Clone)]
pub struct PlannedLeaf {
    pub path: String,
    pub labels: Vec<String>,
    pub tags: BTreeSet<String>,
    pub selected: bool,
    pub(crate) before: Vec<Step>,
    pub(crate) body: Step,
    pub(crate) after: Vec<Step>,
}

impl PlannedLeaf {
    fn new(
        labels: Vec<String>,
        before: Vec<Step>,
        body: Step,
        after: Vec<Step>,
        filter: &Filter,
    ) -> Self {
        let path = labels.join(" ");
        let tags = labels.iter().flat_map(|label| tags_of(label)).collect();
        Self {
            selected: filter.matches(&path),
            path,
            labels,
            tags,
            before,
            body,
            after,
        }
    }

    pub fn is_serial(&self) -> bool {
        self.tags.contains(SERIAL_TAG)
    }

    /// Number of before-each and after-each hooks in the chain.
    pub fn hook_counts(&self) -> (usize, usize) {
        (self.before.len(), self.after.len())
    }
}
