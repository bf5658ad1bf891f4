//! Process registry integration tests: spawn, observe, kill.
//!
//! Run with: `cargo test`

use std::time::Duration;

use argus::procs::{run_worker, spawn_registered, ProcessRegistry};

#[tokio::test]
async fn test_spawn_registers_and_exit_unregisters() {
    let registry = ProcessRegistry::new();
    let args = vec!["-c".to_string(), "exit 0".to_string()];

    let mut worker =
        spawn_registered(&registry, "test", None, "sh", &args, false, false, false)
            .expect("spawn");
    assert_eq!(registry.list_all().len(), 1);
    assert_eq!(registry.list_all()[0].context, "test");

    worker.child.wait().await.expect("wait");
    registry.unregister(worker.pid);
    assert!(registry.list_all().is_empty());
}

#[tokio::test]
async fn test_stderr_lines_reach_log_and_caller() {
    let registry = ProcessRegistry::new();
    let args = vec![
        "-c".to_string(),
        "echo one >&2; echo two >&2".to_string(),
    ];

    let mut worker =
        spawn_registered(&registry, "test", None, "sh", &args, false, false, true)
            .expect("spawn");
    let mut rx = worker.lines.take().expect("forwarded lines");

    let mut seen = Vec::new();
    while let Some(line) = rx.recv().await {
        seen.push(line);
    }
    assert_eq!(seen, vec!["one".to_string(), "two".to_string()]);

    worker.child.wait().await.expect("wait");
    // The rolling log kept the same lines.
    let tail = registry.log_tail(worker.pid).expect("log tail");
    assert_eq!(tail, vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn test_run_worker_surfaces_failure_with_log_tail() {
    let registry = ProcessRegistry::new();

    let ok = vec!["-c".to_string(), "exit 0".to_string()];
    run_worker(&registry, "trim", "sh", &ok).await.expect("zero exit is ok");

    let bad = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
    let err = run_worker(&registry, "trim", "sh", &bad).await.expect_err("nonzero exit");
    let msg = err.to_string();
    assert!(msg.contains("boom"), "error carries the log tail: {msg}");

    // One-shot workers never linger in the registry.
    assert!(registry.list_all().is_empty());
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let registry = ProcessRegistry::new();
    let err = match spawn_registered(
        &registry,
        "test",
        None,
        "/nonexistent/binary",
        &[],
        false,
        false,
        false,
    ) {
        Ok(_) => panic!("spawning a missing binary must fail"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("/nonexistent/binary"));
    assert!(registry.list_all().is_empty());
}

#[tokio::test]
async fn test_kill_session_streams_is_selective() {
    let registry = ProcessRegistry::new();
    let sleep = vec!["-c".to_string(), "sleep 30".to_string()];

    let mut a = spawn_registered(
        &registry,
        "stream",
        Some("session-a".to_string()),
        "sh",
        &sleep,
        false,
        false,
        false,
    )
    .expect("spawn a");
    let mut b = spawn_registered(
        &registry,
        "stream",
        Some("session-b".to_string()),
        "sh",
        &sleep,
        false,
        false,
        false,
    )
    .expect("spawn b");
    assert_eq!(registry.list_all().len(), 2);

    // Only session-a's worker dies.
    let killed = registry.kill_session_streams("session-a");
    assert_eq!(killed, 1);

    let status = tokio::time::timeout(Duration::from_secs(5), a.child.wait())
        .await
        .expect("a exits promptly")
        .expect("wait a");
    assert!(!status.success());

    let remaining = registry.list_all();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id.as_deref(), Some("session-b"));

    registry.kill(b.pid);
    let _ = tokio::time::timeout(Duration::from_secs(5), b.child.wait()).await;
}
