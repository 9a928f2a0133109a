//! Run report.
//!
//! One [`LeafReport`] per planned leaf, in plan order. The human summary is
//! printed by the binary; the JSON form is written with `serde_json` when
//! `--report-json` is given.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Every selected leaf passed.
pub const EXIT_SUCCESS: u8 = 0;
/// At least one leaf failed.
pub const EXIT_FAILURE: u8 = 1;
/// The focus or skip expression did not parse.
pub const EXIT_FILTER_ERROR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeafReport {
    pub path: String,
    pub tags: Vec<String>,
    pub outcome: Outcome,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl LeafReport {
    pub fn skipped(path: &str, tags: Vec<String>) -> Self {
        Self {
            path: path.to_string(),
            tags,
            outcome: Outcome::Skipped,
            duration: Duration::ZERO,
            failure: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub leaves: Vec<LeafReport>,
}

impl Report {
    pub fn new(started_at: DateTime<Utc>, duration: Duration, leaves: Vec<LeafReport>) -> Self {
        Self {
            started_at,
            duration,
            leaves,
        }
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.leaves.iter().filter(|l| l.outcome == outcome).count()
    }

    pub fn passed(&self) -> usize {
        self.count(Outcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    pub fn failures(&self) -> impl Iterator<Item = &LeafReport> {
        self.leaves.iter().filter(|l| l.outcome == Outcome::Failed)
    }

    /// 0 if no leaf failed, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.failed() == 0 {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    /// Human-readable summary: each failure with its cause, then totals.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for leaf in self.failures() {
            out.push_str(&format!("[FAIL] {}\n", leaf.path));
            if let Some(failure) = &leaf.failure {
                for line in failure.lines() {
                    out.push_str(&format!("    {line}\n"));
                }
            }
        }
        out.push_str(&format!(
            "Ran {} of {} scenarios in {:.3}s: {} passed, {} failed, {} skipped\n",
            self.passed() + self.failed(),
            self.leaves.len(),
            self.duration.as_secs_f64(),
            self.passed(),
            self.failed(),
            self.skipped()
        ));
        out
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Internal(format!("failed to encode report: {e}")))
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}
