//! Tests for reading container log files from disk.

use cricheck::logs::{count_log_lines, read_log_file, serialize_records, LogStream};
use cricheck::Error;
use tempfile::TempDir;

const CONTENT: &str = concat!(
    "2016-10-06T00:17:09.669794202Z stdout P The content of the log entry 1\n",
    "2016-10-06T00:17:10.113242941Z stderr F The content of the log entry 2\n",
    "2016-10-06T00:17:10.2Z stdout F \n",
);

#[tokio::test]
async fn test_read_log_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("container.log");
    tokio::fs::write(&path, CONTENT).await.unwrap();

    let records = read_log_file(&path).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].stream, LogStream::Stdout);
    assert!(records[0].tag.is_partial());
    assert_eq!(records[1].stream, LogStream::Stderr);
    assert_eq!(records[1].payload, "The content of the log entry 2\n");
    assert_eq!(records[2].payload, "\n");

    assert_eq!(count_log_lines(&path).await.unwrap(), 3);
    assert_eq!(serialize_records(&records), CONTENT);
}

#[tokio::test]
async fn test_missing_log_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.log");

    let err = read_log_file(&path).await.unwrap_err();
    assert!(matches!(err, Error::LogUnavailable { .. }));
    assert!(count_log_lines(&path).await.is_err());
}

#[tokio::test]
async fn test_malformed_line_fails_the_whole_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.log");
    tokio::fs::write(&path, "2016-10-06T00:17:09Z stdout F ok\nnot a log line\n")
        .await
        .unwrap();

    let err = read_log_file(&path).await.unwrap_err();
    match err {
        Error::MalformedLogLine { line, .. } => assert_eq!(line, "not a log line"),
        other => panic!("expected MalformedLogLine, got {other:?}"),
    }
}
