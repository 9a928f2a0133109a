//! Container log format.
//!
//! CRI runtimes write one record per line:
//!
//! ```text
//! 2016-10-06T00:17:09.669794202Z stdout P The content of the log entry 1
//! 2016-10-06T00:17:10.113242941Z stderr F The content of the log entry 2
//! ```
//!
//! Fields are an RFC3339 timestamp with nanoseconds, the stream, a tag
//! (`P` partial, `F` full) and the payload, which is everything after the
//! third space. Parsed payloads are re-terminated with `\n`.

use crate::error::{Error, Result};
use chrono::{DateTime, FixedOffset, Offset, Timelike};
use std::path::Path;

// =============================================================================
// Record Types
// =============================================================================

/// Output stream a log record came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Any other token, kept verbatim.
    Other(String),
}

impl LogStream {
    fn parse(token: &str) -> Self {
        match token {
            "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Other(token) => token,
        }
    }
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial/full marker. Exposed, not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTag {
    Partial,
    Full,
    Other(String),
}

impl LogTag {
    fn parse(token: &str) -> Self {
        match token {
            "P" => Self::Partial,
            "F" => Self::Full,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Partial => "P",
            Self::Full => "F",
            Self::Other(token) => token,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial)
    }
}

/// One decoded line of a container log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub stream: LogStream,
    pub tag: LogTag,
    /// Payload including the trailing `\n`.
    pub payload: String,
}

impl LogRecord {
    /// Re-encodes the record as a log line, without the line terminator.
    pub fn to_line(&self) -> String {
        let payload = self.payload.strip_suffix('\n').unwrap_or(&self.payload);
        format!(
            "{} {} {} {}",
            format_rfc3339_nano(&self.timestamp),
            self.stream,
            self.tag.as_str(),
            payload
        )
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Parses a single log line (without its terminator).
pub fn parse_log_line(line: &str) -> Result<LogRecord> {
    let mut fields = line.splitn(4, ' ');
    let (Some(timestamp), Some(stream), Some(tag), Some(payload)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(Error::MalformedLogLine {
            line: line.to_string(),
            reason: "expected <timestamp> <stream> <tag> <payload>".to_string(),
        });
    };

    let timestamp =
        DateTime::parse_from_rfc3339(timestamp).map_err(|e| Error::MalformedLogLine {
            line: line.to_string(),
            reason: format!("bad timestamp: {e}"),
        })?;

    Ok(LogRecord {
        timestamp,
        stream: LogStream::parse(stream),
        tag: LogTag::parse(tag),
        payload: format!("{payload}\n"),
    })
}

/// Reads and parses every line of a container log file.
pub async fn read_log_file(path: &Path) -> Result<Vec<LogRecord>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::LogUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    content.lines().map(parse_log_line).collect()
}

/// Counts the lines currently in a log file.
pub async fn count_log_lines(path: &Path) -> Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::LogUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(content.lines().count())
}

/// Serializes records back into log file content, one line per record.
pub fn serialize_records(records: &[LogRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.to_line());
        out.push('\n');
    }
    out
}

/// Formats like Go's RFC3339Nano: trailing zeros of the fraction trimmed,
/// `Z` for UTC.
fn format_rfc3339_nano(ts: &DateTime<FixedOffset>) -> String {
    let mut out = ts.format("%Y-%m-%dT%H:%M:%S").to_string();

    let nanos = ts.nanosecond() % 1_000_000_000;
    if nanos != 0 {
        let fraction = format!("{nanos:09}");
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }

    if ts.offset().fix().local_minus_utc() == 0 {
        out.push('Z');
    } else {
        out.push_str(&ts.format("%:z").to_string());
    }
    out
}
