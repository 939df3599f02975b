//! End-to-end tests for single-command execution.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use shellward_engine::{AuditLog, EngineError, SafeRunner};
use shellward_policy::{AllowRule, Policy};

fn base_policy() -> Policy {
    Policy {
        working_dir: Some(PathBuf::from("/tmp")),
        ..Policy::default()
    }
}

fn runner_with(policy: Policy) -> SafeRunner {
    SafeRunner::new(policy, AuditLog::new(None))
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_run_captures_output() {
    let mut policy = base_policy();
    policy.add_allowed_command("/bin/echo");
    let runner = runner_with(policy);

    let result = runner
        .run(&argv(&["/bin/echo", "hello"]), CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.stdout_lossy(), "hello\n");
    assert!(result.stderr.is_empty());
    assert!(!result.truncated);
    assert!(!result.timed_out);
}

#[tokio::test]
async fn test_run_denied_command_reports_rule_message() {
    let runner = runner_with(base_policy());

    let err = runner
        .run(&argv(&["rm", "-rf", "/tmp/x"]), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        EngineError::Denied { command, reason } => {
            assert_eq!(command, "rm");
            assert_eq!(reason, "Remove command is not allowed");
        }
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_unlisted_command_denied() {
    let runner = runner_with(base_policy());

    let err = runner
        .run(&argv(&["curl", "http://example.com"]), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        EngineError::Denied { reason, .. } => {
            assert_eq!(reason, "Command not allowed by security policy");
        }
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_empty_argv_is_an_error() {
    let runner = runner_with(base_policy());
    let err = runner.run(&[], CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Execution(_)));
}

#[tokio::test]
async fn test_run_subcommand_constraints_apply() {
    let mut policy = base_policy();
    policy
        .allow_commands
        .push(AllowRule::new("/bin/echo").with_sub_commands(["hello"]));
    let runner = runner_with(policy);

    let result = runner
        .run(&argv(&["/bin/echo", "hello"]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.stdout_lossy(), "hello\n");

    let err = runner
        .run(&argv(&["/bin/echo", "bye"]), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        EngineError::Denied { reason, .. } => {
            assert!(reason.contains("'bye' is not permitted"));
        }
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_children_see_only_the_restricted_env() {
    let mut policy = base_policy();
    policy.add_allowed_command("/usr/bin/env");
    policy
        .restricted_env
        .insert("MARKER".to_string(), "from-policy".to_string());
    policy
        .restricted_env
        .insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    let runner = runner_with(policy);

    let result = runner
        .run(&argv(&["/usr/bin/env"]), CancellationToken::new())
        .await
        .unwrap();

    let stdout = result.stdout_lossy().into_owned();
    assert!(stdout.contains("MARKER=from-policy"), "got: {stdout}");
    // The parent environment must not leak through.
    assert!(!stdout.contains("HOME="), "got: {stdout}");
}

#[tokio::test]
async fn test_run_output_is_capped_without_failing_the_command() {
    let mut policy = base_policy();
    policy.add_allowed_command("/usr/bin/seq");
    policy.max_output_size = 64;
    let runner = runner_with(policy);

    let result = runner
        .run(&argv(&["/usr/bin/seq", "1", "1000"]), CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success());
    assert!(result.truncated);
    assert_eq!(result.stdout.len(), 64);
}

#[tokio::test]
async fn test_run_nonzero_exit_is_not_an_error() {
    let mut policy = base_policy();
    policy.add_allowed_command("/bin/cat");
    let runner = runner_with(policy);

    let result = runner
        .run(
            &argv(&["/bin/cat", "/definitely-not-here.txt"]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!result.success());
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
async fn test_run_deadline_kills_and_returns_partial_output() {
    let mut policy = base_policy();
    policy.add_allowed_command("/bin/sh");
    policy.max_execution_time = 1;
    let runner = runner_with(policy);

    let started = Instant::now();
    let err = runner
        .run(
            &argv(&["/bin/sh", "-c", "echo start; sleep 30"]),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    match err {
        EngineError::Timeout { limit, partial } => {
            assert_eq!(limit, Duration::from_secs(1));
            assert!(partial.timed_out);
            assert!(partial.stdout_lossy().contains("start"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_cancellation_kills_the_process() {
    let mut policy = base_policy();
    policy.add_allowed_command("/bin/sleep");
    let runner = Arc::new(runner_with(policy));

    let cancel = CancellationToken::new();
    let task = {
        let runner = runner.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(&argv(&["/bin/sleep", "30"]), cancel).await })
    };

    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_run_rejects_disallowed_working_dir() {
    let mut policy = base_policy();
    policy.add_allowed_command("/bin/echo");
    policy.working_dir = Some(PathBuf::from("/etc"));
    let runner = runner_with(policy);

    let err = runner
        .run(&argv(&["/bin/echo", "hi"]), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        EngineError::Denied { reason, .. } => {
            assert!(reason.contains("working directory"));
        }
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_denials_append_to_block_log() {
    let dir = tempfile::tempdir().unwrap();
    let block_log = dir.path().join("blocked.log");

    let mut policy = base_policy();
    policy.block_log_path = Some(block_log.clone());
    let runner = SafeRunner::new(policy.clone(), AuditLog::new(policy.block_log_path.as_deref()));

    let _ = runner
        .run(&argv(&["rm", "-rf", "/"]), CancellationToken::new())
        .await;

    let contents = std::fs::read_to_string(&block_log).unwrap();
    assert!(contents.contains("BLOCKED"));
    assert!(contents.contains("command=rm"));
    assert!(contents.contains("Remove command is not allowed"));
}
