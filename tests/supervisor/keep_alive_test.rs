//! Tests for the keep-alive supervisor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use exif_proxy::process::{ProcessRegistry, ProxyError};
use exif_proxy::supervisor::{HandleState, KeepAliveSupervisor, SupervisorBuilder, MAX_ATTEMPTS};

use crate::common::{args, eventually, process_exists, MockTool};

fn supervisor(tool: &MockTool, registry: &Arc<ProcessRegistry>) -> KeepAliveSupervisor {
    SupervisorBuilder::new(tool.path())
        .registry(Arc::clone(registry))
        .build_keep_alive()
}

#[tokio::test]
async fn example_scenario_returns_batch() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let batch = supervisor
        .execute(None, &args(&["-n", "-S", "-FileSize", "img.jpg"]))
        .await
        .unwrap();
    assert_eq!(batch, vec!["FileSize: 1024"]);
    assert_eq!(supervisor.state(), HandleState::Ready);
    assert_eq!(registry.len(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn process_is_reused_across_calls() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let first = supervisor.execute(None, &args(&["-pid"])).await.unwrap();
    let second = supervisor.execute(None, &args(&["-pid"])).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(supervisor.spawn_count(), 1);
    assert_eq!(tool.spawn_count(), 1);
    assert_eq!(supervisor.stats().calls, 2);

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_are_not_interleaved() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let supervisor = supervisor.clone();
        tasks.push(tokio::spawn(async move {
            let request = vec![
                format!("echo:call{i}-a"),
                format!("echo:call{i}-b"),
                format!("echo:call{i}-c"),
            ];
            let batch = supervisor.execute(None, &request).await.unwrap();
            (i, batch)
        }));
    }
    for task in tasks {
        let (i, batch) = task.await.unwrap();
        let expected: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|s| format!("call{i}-{s}"))
            .collect();
        assert_eq!(batch.lines(), &expected[..]);
    }

    let input = tool.input_lines();
    let requests: Vec<&[String]> = input.split(|line| line == "-execute").collect();
    // Eight requests plus the empty tail after the last `-execute`.
    assert_eq!(requests.len(), 9);
    for request in &requests[..8] {
        assert_eq!(request.len(), 5);
        let (body, tail) = request.split_at(3);
        let call = body[0].trim_start_matches("echo:").split('-').next().unwrap();
        assert!(
            body.iter().all(|line| line.starts_with(&format!("echo:{call}-"))),
            "interleaved request: {request:?}"
        );
        assert_eq!(tail, &args(&["-echo4", "{ready}"])[..]);
    }
    assert_eq!(supervisor.spawn_count(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn restarts_after_process_killed_while_idle() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let batch = supervisor.execute(None, &args(&["-pid"])).await.unwrap();
    let pid: i32 = batch.lines()[0].parse().unwrap();
    kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
    assert!(eventually(Duration::from_secs(5), || !supervisor.is_ready()).await);
    assert_eq!(supervisor.state(), HandleState::Closed);
    assert_eq!(supervisor.current_pid(), None);

    let batch = supervisor.execute(None, &args(&["-pid"])).await.unwrap();
    let new_pid: i32 = batch.lines()[0].parse().unwrap();
    assert_ne!(pid, new_pid);
    assert_eq!(supervisor.spawn_count(), 2);
    assert_eq!(supervisor.stats().restarts, 1);
    assert_eq!(registry.len(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn idle_process_is_evicted_and_recreated() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = SupervisorBuilder::new(tool.path())
        .registry(Arc::clone(&registry))
        .inactivity_timeout(Duration::from_millis(200))
        .build_keep_alive();

    supervisor.execute(None, &args(&["-ver"])).await.unwrap();
    assert!(supervisor.is_ready());

    let evicted = eventually(Duration::from_secs(5), || !supervisor.is_ready()).await;
    assert!(evicted, "idle process was not evicted");
    assert!(eventually(Duration::from_secs(5), || supervisor.stats().evictions == 1).await);
    assert!(eventually(Duration::from_secs(5), || supervisor.state() == HandleState::Absent).await);
    assert!(registry.is_empty());

    let batch = supervisor.execute(None, &args(&["-ver"])).await.unwrap();
    assert_eq!(batch, vec!["12.76"]);
    assert_eq!(supervisor.spawn_count(), 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn zero_inactivity_timeout_never_evicts() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = SupervisorBuilder::new(tool.path())
        .registry(Arc::clone(&registry))
        .inactivity_timeout(Duration::ZERO)
        .build_keep_alive();

    supervisor.execute(None, &args(&["-ver"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(supervisor.is_ready());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn hung_call_times_out_and_process_is_terminated() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let batch = supervisor.execute(None, &args(&["-pid"])).await.unwrap();
    let pid: u32 = batch.lines()[0].parse().unwrap();

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let err = supervisor
        .execute(Some(timeout), &args(&["echo:early", "-hang"]))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        ProxyError::TimedOut { timeout: t, record } => {
            assert_eq!(t, timeout);
            assert_eq!(record.args, args(&["echo:early", "-hang"]));
            assert_eq!(record.lines, args(&["early"]));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(1500), "took {elapsed:?}");

    assert!(
        eventually(Duration::from_secs(5), || !process_exists(pid)).await,
        "timed-out process was leaked"
    );
    assert!(eventually(Duration::from_secs(5), || registry.is_empty()).await);
    assert_eq!(supervisor.stats().timeouts, 1);
    assert_eq!(supervisor.spawn_count(), 1);

    // The next call gets a fresh process.
    let batch = supervisor.execute(Some(timeout), &args(&["-ver"])).await.unwrap();
    assert_eq!(batch, vec!["12.76"]);
    assert_eq!(supervisor.spawn_count(), 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn watchdog_is_disarmed_after_fast_call() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    supervisor
        .execute(Some(Duration::from_millis(200)), &args(&["-ver"]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(supervisor.is_ready());
    assert_eq!(supervisor.stats().timeouts, 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn shutdown_fences_further_calls() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    supervisor.execute(None, &args(&["-ver"])).await.unwrap();
    supervisor.shutdown().await;
    assert!(supervisor.is_shutting_down());
    assert!(registry.is_empty());

    for _ in 0..3 {
        let err = supervisor.execute(None, &args(&["-ver"])).await.unwrap_err();
        assert!(matches!(err, ProxyError::ShuttingDown));
    }
    assert!(matches!(
        supervisor.startup().await,
        Err(ProxyError::ShuttingDown)
    ));
    assert_eq!(supervisor.spawn_count(), 1);
    assert_eq!(tool.spawn_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_fails_in_flight_call() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);
    supervisor.startup().await.unwrap();

    let caller = supervisor.clone();
    let call = tokio::spawn(async move { caller.execute(None, &args(&["-hang"])).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    supervisor.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("in-flight call stayed blocked")
        .unwrap();
    assert!(matches!(result, Err(ProxyError::ShuttingDown)));
    assert_eq!(tool.spawn_count(), 1);
}

#[tokio::test]
async fn tool_error_is_surfaced_without_restart() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let err = supervisor
        .execute(None, &args(&["-badtag"]))
        .await
        .unwrap_err();
    match err {
        ProxyError::ToolReported { message, .. } => assert_eq!(message, "Error: bad tag"),
        other => panic!("unexpected error: {other}"),
    }

    let batch = supervisor
        .execute(None, &args(&["-warn", "-FileSize"]))
        .await
        .unwrap();
    assert_eq!(batch, vec!["FileSize: 1024"]);
    assert_eq!(supervisor.spawn_count(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn tool_errors_are_reported_on_every_call() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    for round in 0..30 {
        let err = supervisor
            .execute(None, &args(&["-badtag"]))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ProxyError::ToolReported { .. }),
            "round {round}: {err}"
        );
        let batch = supervisor
            .execute(None, &args(&["-ver"]))
            .await
            .unwrap();
        assert_eq!(batch, vec!["12.76"], "round {round}");
    }
    assert_eq!(supervisor.spawn_count(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn tool_dying_on_start_exhausts_retries() {
    let tool = MockTool::dying();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let err = supervisor
        .execute(None, &args(&["-ver"]))
        .await
        .unwrap_err();
    match err {
        ProxyError::RetriesExhausted { attempts, record } => {
            assert_eq!(attempts, MAX_ATTEMPTS);
            assert_eq!(record.args, args(&["-ver"]));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tool.spawn_count(), 3);
    assert_eq!(supervisor.spawn_count(), 3);
    assert!(registry.is_empty());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn tool_dying_mid_call_exhausts_retries() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let err = supervisor
        .execute(None, &args(&["-die"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(tool.spawn_count(), 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn missing_sentinel_is_protocol_violation() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let err = supervisor
        .execute(None, &args(&["-partial"]))
        .await
        .unwrap_err();
    match err {
        ProxyError::ProtocolViolation { record } => {
            assert_eq!(record.lines, args(&["partial"]));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tool.spawn_count(), 1);
    assert!(!supervisor.is_ready());

    let batch = supervisor.execute(None, &args(&["-ver"])).await.unwrap();
    assert_eq!(batch, vec!["12.76"]);
    assert_eq!(tool.spawn_count(), 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn registry_close_all_is_recovered_from() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    supervisor.execute(None, &args(&["-ver"])).await.unwrap();
    assert_eq!(registry.close_all().await, 1);
    assert!(!supervisor.is_ready());

    supervisor.execute(None, &args(&["-ver"])).await.unwrap();
    assert_eq!(supervisor.spawn_count(), 2);

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_startup_spawns_once() {
    let tool = MockTool::healthy();
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = supervisor(&tool, &registry);

    let (a, b, c) = tokio::join!(
        supervisor.startup(),
        supervisor.startup(),
        supervisor.startup()
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(supervisor.spawn_count(), 1);
    assert_eq!(tool.spawn_count(), 1);

    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), HandleState::Closed);
}
