//! Integration tests for the subprocess session.
//!
//! These tests run real child processes through `/bin/sh` and coreutils:
//! - Output content preservation
//! - Input ordering and end-of-input
//! - Exit reporting and stop signals
//! - Drop behaviour

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use session::{ExitStatus, Session, SessionError, SessionEvent, SessionState, StreamKind};
use tokio::sync::oneshot;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

// =============================================================================
// Output Tests
// =============================================================================

#[tokio::test]
async fn test_stdout_chunks_concatenate_to_child_output() {
    let script = r#"i=0; while [ $i -lt 2000 ]; do echo "line $i"; i=$((i+1)); done"#;
    let (_session, events) = Session::builder("sh")
        .args(sh(script))
        .event_capacity(1)
        .spawn()
        .unwrap();

    let output = timeout(TEST_TIMEOUT, events.collect()).await.unwrap();

    let expected: String = (0..2000).map(|i| format!("line {}\n", i)).collect();
    assert_eq!(String::from_utf8(output.stdout).unwrap(), expected);
    assert_eq!(output.status, Some(ExitStatus::Exited(0)));
}

#[tokio::test]
async fn test_stderr_is_reported_separately() {
    let (_session, events) =
        Session::spawn("sh", sh("echo visible; echo 'EE: Wrong command: x' >&2")).unwrap();

    let output = timeout(TEST_TIMEOUT, events.collect()).await.unwrap();
    assert_eq!(output.stdout, b"visible\n");
    assert_eq!(output.stderr, b"EE: Wrong command: x\n");
}

#[tokio::test]
async fn test_chunks_keep_order_within_stream() {
    let (_session, mut events) =
        Session::spawn("sh", sh("for n in 1 2 3 4 5; do echo $n; echo e$n >&2; done")).unwrap();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(event) = timeout(TEST_TIMEOUT, events.recv()).await.unwrap() {
        match event {
            SessionEvent::Output(StreamKind::Stdout, chunk) => stdout.extend(chunk),
            SessionEvent::Output(StreamKind::Stderr, chunk) => stderr.extend(chunk),
            SessionEvent::Exit(status) => assert!(status.success()),
        }
    }

    assert_eq!(stdout, b"1\n2\n3\n4\n5\n");
    assert_eq!(stderr, b"e1\ne2\ne3\ne4\ne5\n");
}

#[tokio::test]
async fn test_env_and_working_directory() {
    let (_session, events) = Session::builder("sh")
        .args(sh("echo $GCD_SESSION_TEST; pwd"))
        .env("GCD_SESSION_TEST", "from-env")
        .current_dir("/")
        .spawn()
        .unwrap();

    let output = timeout(TEST_TIMEOUT, events.collect()).await.unwrap();
    assert_eq!(output.stdout, b"from-env\n/\n");
}

// =============================================================================
// Input Tests
// =============================================================================

#[tokio::test]
async fn test_writes_reach_child_in_order() {
    let (session, events) = Session::spawn("cat", Vec::<String>::new()).unwrap();

    let mut expected = Vec::new();
    for n in 0..500 {
        let line = format!("go G0X{}Y{}\n", n, n);
        session.write(line.as_bytes()).await.unwrap();
        expected.extend_from_slice(line.as_bytes());
    }
    session.close_input().await.unwrap();

    let output = timeout(TEST_TIMEOUT, events.collect()).await.unwrap();
    assert_eq!(output.stdout, expected);
}

#[tokio::test]
async fn test_child_sees_exact_input_then_eof() {
    let script = r#"read line; echo "got:$line"; if read more; then echo "extra:$more"; else echo eof; fi"#;
    let (session, events) = Session::spawn("sh", sh(script)).unwrap();

    session.write(b"q\n").await.unwrap();
    session.close_input().await.unwrap();

    let output = timeout(TEST_TIMEOUT, events.collect()).await.unwrap();
    assert_eq!(output.stdout, b"got:q\neof\n");
    assert_eq!(output.status, Some(ExitStatus::Exited(0)));
}

#[tokio::test]
async fn test_write_after_child_closed_input() {
    // The child closes stdin and keeps running.
    let (session, mut events) = Session::spawn("sh", sh("exec 0<&-; echo ready; exec sleep 30")).unwrap();

    let first = timeout(TEST_TIMEOUT, events.recv()).await.unwrap();
    assert_eq!(first, Some(SessionEvent::Output(StreamKind::Stdout, b"ready\n".to_vec())));

    let result = session.write(b"q\n").await;
    assert!(matches!(result, Err(SessionError::InputClosed(_))), "{result:?}");
    assert!(!session.is_input_open().await);

    let _ = timeout(TEST_TIMEOUT, session.kill()).await.unwrap();
}

// =============================================================================
// Exit Tests
// =============================================================================

#[tokio::test]
async fn test_on_exit_fires_exactly_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (exit_tx, exit_rx) = oneshot::channel();

    let counter = Arc::clone(&calls);
    let (session, _events) = Session::builder("sh")
        .args(sh("exit 4"))
        .on_exit(move |status| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = exit_tx.send(status);
        })
        .spawn()
        .unwrap();

    let status = timeout(TEST_TIMEOUT, exit_rx).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Exited(4));

    // Waiting again and signalling afterwards must not produce another exit.
    assert_eq!(session.wait().await.unwrap(), ExitStatus::Exited(4));
    assert!(session.terminate().await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exit_follows_all_output() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (exit_tx, exit_rx) = oneshot::channel();

    let sink = Arc::clone(&received);
    let exit_sink = Arc::clone(&received);
    let (_session, _events) = Session::builder("sh")
        .args(sh("printf 'partial'; sleep 0.2; printf ' done'"))
        .on_stdout(move |chunk| sink.lock().unwrap().extend_from_slice(chunk))
        .on_exit(move |status| {
            let seen = exit_sink.lock().unwrap().clone();
            let _ = exit_tx.send((status, seen));
        })
        .spawn()
        .unwrap();

    let (status, seen_at_exit) = timeout(TEST_TIMEOUT, exit_rx).await.unwrap().unwrap();
    assert!(status.success());
    assert_eq!(seen_at_exit, b"partial done");
}

#[tokio::test]
async fn test_missing_executable_never_exits() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);

    let result = Session::builder("/nonexistent/gcd")
        .args(["-c", "../v3.json", "--configtest"])
        .on_exit(move |_| flag.store(true, Ordering::SeqCst))
        .spawn();

    match result {
        Err(err) => assert!(err.is_not_found(), "unexpected error: {err}"),
        Ok(_) => panic!("spawning a missing executable must fail"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_non_executable_file_is_a_spawn_error() {
    // A regular file without any execute bit.
    let result = Session::spawn("/etc/passwd", Vec::<String>::new());
    let err = result.unwrap_err();
    assert!(matches!(err, SessionError::Spawn { .. }));
    assert!(err.is_permission_denied(), "unexpected error: {err}");
}

// =============================================================================
// Stop Tests
// =============================================================================

#[tokio::test]
async fn test_shutdown_escalates_when_sigterm_is_ignored() {
    let (session, mut events) =
        Session::spawn("sh", sh("trap '' TERM; echo ready; exec sleep 30")).unwrap();

    // Only signal once the trap is installed.
    let first = timeout(TEST_TIMEOUT, events.recv()).await.unwrap();
    assert_eq!(first, Some(SessionEvent::Output(StreamKind::Stdout, b"ready\n".to_vec())));

    let status = timeout(TEST_TIMEOUT, session.shutdown(Duration::from_millis(200)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, ExitStatus::Signaled(9));
}

#[tokio::test]
async fn test_shutdown_graceful_within_grace_period() {
    let (session, _events) = Session::spawn("sleep", ["30"]).unwrap();

    let status = timeout(TEST_TIMEOUT, session.shutdown(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, ExitStatus::Signaled(15));
}

#[tokio::test]
async fn test_kill_with_unread_events() {
    // Far more output than the event channel holds, and nobody reading it.
    let (session, _events) = Session::builder("yes").event_capacity(4).spawn().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let status = timeout(TEST_TIMEOUT, session.kill()).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Signaled(9));
    assert!(!session.is_running());
    assert_eq!(session.exit_status(), Some(ExitStatus::Signaled(9)));
}

#[tokio::test]
async fn test_wait_with_unread_events_keeps_output() {
    let script = r#"i=0; while [ $i -lt 2000 ]; do echo "line $i"; i=$((i+1)); done"#;
    let (session, events) = Session::builder("sh")
        .args(sh(script))
        .event_capacity(4)
        .spawn()
        .unwrap();

    let status = timeout(TEST_TIMEOUT, session.wait()).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Exited(0));

    // Output left behind is still delivered, followed by the exit.
    let output = timeout(TEST_TIMEOUT, events.collect()).await.unwrap();
    let expected: String = (0..2000).map(|i| format!("line {}\n", i)).collect();
    assert_eq!(String::from_utf8(output.stdout).unwrap(), expected);
    assert_eq!(output.status, Some(ExitStatus::Exited(0)));
    assert_eq!(session.state(), SessionState::Terminated(ExitStatus::Exited(0)));
}

#[tokio::test]
async fn test_shutdown_with_unread_events() {
    let (session, _events) = Session::builder("yes").event_capacity(1).spawn().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let status = timeout(TEST_TIMEOUT, session.shutdown(Duration::from_secs(2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, ExitStatus::Signaled(15));
}

// =============================================================================
// Drop Tests
// =============================================================================

#[tokio::test]
async fn test_dropping_session_closes_input() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (exit_tx, exit_rx) = oneshot::channel();

    let sink = Arc::clone(&received);
    let (session, _events) = Session::builder("cat")
        .on_stdout(move |chunk| sink.lock().unwrap().extend_from_slice(chunk))
        .on_exit(move |status| {
            let _ = exit_tx.send(status);
        })
        .spawn()
        .unwrap();

    session.write_line("status").await.unwrap();
    drop(session);

    let status = timeout(TEST_TIMEOUT, exit_rx).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(*received.lock().unwrap(), b"status\n");
}

#[tokio::test]
async fn test_kill_on_drop() {
    let (exit_tx, exit_rx) = oneshot::channel();

    let (session, _events) = Session::builder("sleep")
        .arg("30")
        .kill_on_drop(true)
        .on_exit(move |status| {
            let _ = exit_tx.send(status);
        })
        .spawn()
        .unwrap();

    drop(session);

    let status = timeout(TEST_TIMEOUT, exit_rx).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Signaled(9));
}
