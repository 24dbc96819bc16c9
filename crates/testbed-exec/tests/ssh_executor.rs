//! Tests for the SSH executor against a scripted shell

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use testbed_exec::backends::scripted::{ScriptedResponse, ScriptedShell};
use testbed_exec::{Error, SshExecutor};

fn address() -> IpAddr {
    "10.0.0.13".parse().unwrap()
}

fn executor(shell: &ScriptedShell) -> SshExecutor {
    SshExecutor::new(Arc::new(shell.clone()))
        .with_poll_interval(Duration::from_millis(1))
        .with_retry_delay(Duration::from_millis(5))
}

#[smol_potat::test]
async fn test_run_captures_exit_code_and_output() {
    let shell = ScriptedShell::new().respond(
        "uname -s",
        ScriptedResponse::exit(0)
            .with_stdout("Linux\n")
            .with_polls(3),
    );

    let output = executor(&shell)
        .run(address(), "uname -s", Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout_lossy(), "Linux\n");
    assert!(output.stderr.is_empty());
    assert_eq!(shell.commands(), vec![(address(), "uname -s".to_string())]);
    assert_eq!(shell.sessions_closed(), 1);
}

#[smol_potat::test]
async fn test_run_does_not_fail_on_non_zero_exit() {
    let shell = ScriptedShell::new().respond(
        "false",
        ScriptedResponse::exit(1).with_stderr("nope"),
    );

    let output = executor(&shell)
        .run(address(), "false", Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(output.exit_code, 1);
    assert_eq!(output.stderr_lossy(), "nope");
}

#[smol_potat::test]
async fn test_must_run_fails_iff_exit_code_non_zero() {
    for code in [0, 1, 127] {
        let shell = ScriptedShell::new().respond("check", ScriptedResponse::exit(code));
        let result = executor(&shell)
            .must_run(address(), "check", Duration::from_secs(1))
            .await;

        match (code, result) {
            (0, Ok(output)) => assert_eq!(output.exit_code, 0),
            (_, Err(Error::NonZeroExit(output))) => assert_eq!(output.exit_code, code),
            (code, other) => panic!("unexpected result for exit code {code}: {other:?}"),
        }
    }
}

#[smol_potat::test]
async fn test_missing_exit_status_reports_minus_one() {
    let shell = ScriptedShell::new().respond("killed", ScriptedResponse::default());

    let output = executor(&shell)
        .run(address(), "killed", Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(output.exit_code, -1);
}

#[smol_potat::test]
async fn test_connect_retries_until_session_opens() {
    let shell = ScriptedShell::new().refuse_sessions(3);

    let output = executor(&shell)
        .run(address(), "true", Duration::from_secs(5))
        .await
        .unwrap();

    assert!(output.success());
    assert_eq!(shell.session_attempts(), 4);
}

#[smol_potat::test]
async fn test_connect_times_out() {
    let shell = ScriptedShell::new().refuse_sessions(usize::MAX);

    let result = executor(&shell)
        .run(address(), "true", Duration::from_millis(40))
        .await;

    match result {
        Err(Error::ConnectTimeout { host, last_error, .. }) => {
            assert_eq!(host, "10.0.0.13");
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("expected connect timeout, got {other:?}"),
    }
    assert!(shell.session_attempts() >= 2);
    assert!(shell.commands().is_empty());
}

#[smol_potat::test]
async fn test_zero_timeout_makes_exactly_one_attempt() {
    let shell = ScriptedShell::new().refuse_sessions(1);

    let result = executor(&shell)
        .run(address(), "true", Duration::ZERO)
        .await;

    assert!(matches!(result, Err(Error::ConnectTimeout { .. })));
    assert_eq!(shell.session_attempts(), 1);
}
