//! Focus/skip selection over leaf paths.
//!
//! A leaf path is its ancestors' labels and its own label joined by spaces,
//! so tags (`[Serial]`) and group names are matched like any other text.

use crate::error::{Error, Result};
use regex::Regex;

/// Leaf selection predicate.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    focus: Option<Regex>,
    skip: Option<Regex>,
}

impl Filter {
    /// Compiles the focus and skip expressions. An invalid expression is
    /// [`Error::Filter`].
    pub fn new(focus: Option<&str>, skip: Option<&str>) -> Result<Self> {
        Ok(Self {
            focus: focus.map(compile).transpose()?,
            skip: skip.map(compile).transpose()?,
        })
    }

    /// A leaf runs if it matches focus (when set) and does not match skip.
    pub fn matches(&self, path: &str) -> bool {
        let focused = self.focus.as_ref().map_or(true, |re| re.is_match(path));
        let skipped = self.skip.as_ref().is_some_and(|re| re.is_match(path));
        focused && !skipped
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| Error::Filter {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}
