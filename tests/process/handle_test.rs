//! Tests for process handles driven against the mock tool.

use std::sync::Arc;

use exif_proxy::process::{ProcessHandle, ProcessRegistry, ProxyError};
use exif_proxy::protocol::{keep_alive_argv, CommandEnvelope};

use crate::common::{args, MockTool};

fn start_keep_alive(tool: &MockTool, registry: &Arc<ProcessRegistry>) -> Arc<ProcessHandle> {
    ProcessHandle::start(&keep_alive_argv(&tool.path(), &[]), true, registry).unwrap()
}

#[tokio::test]
async fn example_file_size_request() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let handle = start_keep_alive(&tool, &registry);

    let batch = handle
        .send_and_await(&CommandEnvelope::new(["-n", "-S", "-FileSize", "img.jpg"]))
        .await
        .unwrap();
    assert_eq!(batch, vec!["FileSize: 1024"]);

    assert_eq!(
        tool.input_lines(),
        args(&["-n", "-S", "-FileSize", "img.jpg", "-echo4", "{ready}", "-execute"])
    );
    handle.close().await;
}

#[tokio::test]
async fn sentinel_is_excluded_for_zero_one_and_many_lines() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let handle = start_keep_alive(&tool, &registry);

    let empty = handle
        .send_and_await(&CommandEnvelope::new(["img.jpg"]))
        .await
        .unwrap();
    assert!(empty.is_empty());

    let one = handle
        .send_and_await(&CommandEnvelope::new(["echo:only"]))
        .await
        .unwrap();
    assert_eq!(one, vec!["only"]);

    let many = handle
        .send_and_await(&CommandEnvelope::new(["echo:a", "echo:b", "echo:c"]))
        .await
        .unwrap();
    assert_eq!(many, vec!["a", "b", "c"]);

    handle.close().await;
}

#[tokio::test]
async fn stderr_error_line_is_tool_reported() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let handle = start_keep_alive(&tool, &registry);

    let err = handle
        .send_and_await(&CommandEnvelope::new(["echo:before", "-badtag"]))
        .await
        .unwrap_err();
    match err {
        ProxyError::ToolReported { message, record } => {
            assert_eq!(message, "Error: bad tag");
            assert_eq!(record.lines, args(&["before"]));
            assert_eq!(record.args, args(&["echo:before", "-badtag"]));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The stream is still usable afterwards.
    assert!(!handle.is_closed());
    let batch = handle
        .send_and_await(&CommandEnvelope::new(["-ver"]))
        .await
        .unwrap();
    assert_eq!(batch, vec!["12.76"]);
    handle.close().await;
}

#[tokio::test]
async fn stderr_warning_does_not_fail_call() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let handle = start_keep_alive(&tool, &registry);

    let batch = handle
        .send_and_await(&CommandEnvelope::new(["-warn", "-FileSize"]))
        .await
        .unwrap();
    assert_eq!(batch, vec!["FileSize: 1024"]);
    handle.close().await;
}

#[tokio::test]
async fn tool_error_never_slips_into_next_request() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let handle = start_keep_alive(&tool, &registry);

    for _ in 0..50 {
        let err = handle
            .send_and_await(&CommandEnvelope::new(["-badtag"]))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ProxyError::ToolReported { message, .. } if message == "Error: bad tag"),
            "unexpected error: {err}"
        );
        let batch = handle
            .send_and_await(&CommandEnvelope::new(["-ver"]))
            .await
            .unwrap();
        assert_eq!(batch, vec!["12.76"]);
    }
    handle.close().await;
}

#[tokio::test]
async fn close_sends_shutdown_handshake() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let handle = start_keep_alive(&tool, &registry);

    handle
        .send_and_await(&CommandEnvelope::new(["-ver"]))
        .await
        .unwrap();
    handle.close().await;

    let input = tool.input_lines();
    assert_eq!(&input[input.len() - 2..], &args(&["-stay_open", "False"])[..]);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn single_use_handle_reads_until_exit() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let envelope = CommandEnvelope::new(["-FileSize", "-ver"]);
    let argv = envelope.single_use_argv(&tool.path(), &[]);

    let handle = ProcessHandle::start(&argv, false, &registry).unwrap();
    let batch = handle.send_and_await(&envelope).await.unwrap();
    assert_eq!(batch, vec!["FileSize: 1024", "12.76"]);
    handle.close().await;

    assert!(tool.input_lines().is_empty());
}
