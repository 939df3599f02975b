//! Policy-enforced command execution.
//!
//! [`SafeRunner`] is the only way commands leave this crate. The two
//! entry points, [`SafeRunner::run`] for a single argv and
//! [`SafeRunner::run_script`] for whole scripts, share one enforcement
//! core: every launch is evaluated against the policy and audited,
//! children run under a cleared environment and in a validated working
//! directory, and each top-level call carries a single wall-clock
//! deadline and output cap.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shellward_policy::{Policy, Verdict};

use crate::audit::AuditLog;
use crate::error::{EngineError, Result};
use crate::interp::Interp;
use crate::limits::{BoundedSink, SharedWriter};
use crate::validate::CommandValidator;

/// Outcome of one `run` or `run_script` call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Exit code of the command, or of the last statement for scripts.
    pub exit_code: i32,
    /// Captured standard output, up to the policy's output cap.
    pub stdout: Vec<u8>,
    /// Captured standard error, up to the policy's output cap.
    pub stderr: Vec<u8>,
    /// True when either stream exceeded the cap and was truncated.
    pub truncated: bool,
    /// Wall-clock time the call took.
    pub duration: Duration,
    /// True when the call was cut short by the execution deadline.
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process tracking and output plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Process groups spawned under one top-level call. On timeout or
/// cancellation every tracked group is killed, taking the whole
/// process tree with it.
#[derive(Clone, Default)]
pub(crate) struct ProcessSet {
    pids: Arc<Mutex<HashSet<i32>>>,
}

impl ProcessSet {
    pub(crate) fn track(&self, pid: i32) {
        self.pids.lock().insert(pid);
    }

    pub(crate) fn untrack(&self, pid: i32) {
        self.pids.lock().remove(&pid);
    }

    pub(crate) fn kill_all(&self) {
        let pids: Vec<i32> = self.pids.lock().drain().collect();
        for pid in pids {
            // Children are spawned as group leaders, so the negative
            // pid addresses the whole group.
            let _ = unsafe { libc::kill(-pid, libc::SIGKILL) };
        }
    }
}

/// The capped capture sinks for one top-level call. Every command in a
/// script writes into the same pair, so the cap bounds the call, not
/// the individual command.
#[derive(Clone)]
pub(crate) struct CallSinks {
    pub(crate) stdout: Arc<Mutex<BoundedSink>>,
    pub(crate) stderr: Arc<Mutex<BoundedSink>>,
}

impl CallSinks {
    pub(crate) fn new(
        cap: usize,
        stdout: Option<SharedWriter>,
        stderr: Option<SharedWriter>,
    ) -> Self {
        let make = |forward: Option<SharedWriter>| match forward {
            Some(writer) => BoundedSink::forwarding(cap, writer),
            None => BoundedSink::new(cap),
        };
        Self {
            stdout: Arc::new(Mutex::new(make(stdout))),
            stderr: Arc::new(Mutex::new(make(stderr))),
        }
    }
}

/// Drains `reader` into `sink` on its own task so a child that outruns
/// the cap never blocks on a full pipe.
pub(crate) fn pump<R>(mut reader: R, sink: Arc<Mutex<BoundedSink>>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let _ = sink.lock().write_all(&buf[..n]);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "output pump ended");
                    break;
                }
            }
        }
    })
}

pub(crate) fn collect_result(
    exit_code: i32,
    sinks: &CallSinks,
    started: Instant,
    timed_out: bool,
) -> ExecutionResult {
    let mut stdout = sinks.stdout.lock();
    let mut stderr = sinks.stderr.lock();
    ExecutionResult {
        exit_code,
        truncated: stdout.truncated() || stderr.truncated(),
        stdout: stdout.take_captured(),
        stderr: stderr.take_captured(),
        duration: started.elapsed(),
        timed_out,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SafeRunner
// ─────────────────────────────────────────────────────────────────────────────

/// Executes commands and scripts under a [`Policy`].
pub struct SafeRunner {
    policy: Arc<Policy>,
    audit: AuditLog,
    stdout: Option<SharedWriter>,
    stderr: Option<SharedWriter>,
}

impl SafeRunner {
    pub fn new(policy: Policy, audit: AuditLog) -> Self {
        Self {
            policy: Arc::new(policy),
            audit,
            stdout: None,
            stderr: None,
        }
    }

    /// Streams child output to the given writers, in addition to the
    /// capped capture. Only the capped prefix is forwarded.
    pub fn set_outputs(&mut self, stdout: SharedWriter, stderr: SharedWriter) {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub(crate) fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Runs a single command given as argv.
    ///
    /// The command is checked against the policy and audited, then
    /// spawned with the restricted environment, the validated working
    /// directory, and the policy deadline. Cancelling `cancel` kills
    /// the process tree.
    ///
    /// # Errors
    ///
    /// [`EngineError::Denied`] when policy rejects the command,
    /// [`EngineError::Timeout`] with the partial output when the
    /// deadline passes, [`EngineError::Cancelled`] on cancellation, and
    /// [`EngineError::Launch`] when the process cannot start.
    pub async fn run(&self, args: &[String], cancel: CancellationToken) -> Result<ExecutionResult> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let result = self.run_inner(run_id, args, &cancel, started).await;
        if let Err(err) = &result {
            if !matches!(err, EngineError::Denied { .. }) {
                self.audit.log_error(run_id, "run", err);
            }
        }
        result
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        args: &[String],
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let Some((command, rest)) = args.split_first() else {
            return Err(EngineError::Execution("no command provided".to_string()));
        };

        let working_dir = self.resolve_working_dir(run_id, command)?;
        self.enforce(run_id, command, rest)?;

        let sinks = CallSinks::new(
            self.policy.max_output_size,
            self.stdout.clone(),
            self.stderr.clone(),
        );
        let procs = ProcessSet::default();
        let deadline = self.policy.execution_timeout();

        tokio::select! {
            result = self.exec_once(command, rest, working_dir.as_deref(), &sinks, &procs) => {
                let exit_code = result?;
                Ok(collect_result(exit_code, &sinks, started, false))
            }
            _ = cancel.cancelled() => {
                procs.kill_all();
                Err(EngineError::Cancelled)
            }
            _ = tokio::time::sleep(deadline) => {
                procs.kill_all();
                let partial = collect_result(-1, &sinks, started, true);
                Err(EngineError::Timeout {
                    limit: deadline,
                    partial: Box::new(partial),
                })
            }
        }
    }

    async fn exec_once(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        sinks: &CallSinks,
        procs: &ProcessSet,
    ) -> Result<i32> {
        let mut cmd = self.base_command(command, args, &self.policy.restricted_env, working_dir);
        let mut child = self.spawn_child(&mut cmd, command, procs)?;
        let pid = child.id().map(|id| id as i32);

        let stdout_pump = child.stdout.take().map(|out| pump(out, sinks.stdout.clone()));
        let stderr_pump = child.stderr.take().map(|err| pump(err, sinks.stderr.clone()));

        let status = child.wait().await?;
        if let Some(pid) = pid {
            procs.untrack(pid);
        }
        if let Some(handle) = stdout_pump {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_pump {
            let _ = handle.await;
        }

        Ok(status.code().unwrap_or(-1))
    }

    /// Runs a shell script: parse, validate every reachable command,
    /// then execute with the same per-launch enforcement as [`run`].
    ///
    /// One deadline and one output cap cover the whole script.
    ///
    /// [`run`]: SafeRunner::run
    pub async fn run_script(
        &self,
        script: &str,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let result = self.run_script_inner(run_id, script, &cancel, started).await;
        if let Err(err) = &result {
            if !matches!(err, EngineError::Denied { .. }) {
                self.audit.log_error(run_id, "run_script", err);
            }
        }
        result
    }

    async fn run_script_inner(
        &self,
        run_id: Uuid,
        script: &str,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let validator = CommandValidator::new(self.policy.clone());
        let program = match validator.validate_script(script) {
            Ok(program) => program,
            Err(EngineError::Denied { command, reason }) => {
                self.audit
                    .log_attempt(run_id, &command, &[], &Verdict::Deny(reason.clone()));
                return Err(EngineError::Denied { command, reason });
            }
            Err(err) => return Err(err),
        };

        let sinks = CallSinks::new(
            self.policy.max_output_size,
            self.stdout.clone(),
            self.stderr.clone(),
        );
        let procs = ProcessSet::default();
        let mut interp = Interp::new(self, run_id, procs.clone(), sinks.clone())?;
        let deadline = self.policy.execution_timeout();

        tokio::select! {
            result = interp.exec_program(&program) => {
                let exit_code = result?;
                Ok(collect_result(exit_code, &sinks, started, false))
            }
            _ = cancel.cancelled() => {
                procs.kill_all();
                Err(EngineError::Cancelled)
            }
            _ = tokio::time::sleep(deadline) => {
                procs.kill_all();
                let partial = collect_result(-1, &sinks, started, true);
                Err(EngineError::Timeout {
                    limit: deadline,
                    partial: Box::new(partial),
                })
            }
        }
    }

    /// Reads a script from `reader` and runs it via [`run_script`].
    ///
    /// [`run_script`]: SafeRunner::run_script
    pub async fn run_script_file<R: std::io::Read>(
        &self,
        mut reader: R,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let mut script = String::new();
        reader.read_to_string(&mut script)?;
        self.run_script(&script, cancel).await
    }

    // ─────────────────────────────────────────────────────────────────
    // Shared enforcement core
    // ─────────────────────────────────────────────────────────────────

    /// Evaluates one launch against the policy and records the attempt.
    pub(crate) fn enforce(&self, run_id: Uuid, command: &str, args: &[String]) -> Result<()> {
        let verdict = self.policy.decide(command, args);
        self.audit.log_attempt(run_id, command, args, &verdict);
        match verdict {
            Verdict::Allow => Ok(()),
            Verdict::Deny(reason) => Err(EngineError::Denied {
                command: command.to_string(),
                reason,
            }),
        }
    }

    /// Validates the directory children will run in. The configured
    /// working directory is used when present; otherwise the current
    /// directory must satisfy the confinement, if any is configured.
    pub(crate) fn resolve_working_dir(
        &self,
        run_id: Uuid,
        context: &str,
    ) -> Result<Option<PathBuf>> {
        if let Some(dir) = &self.policy.working_dir {
            let resolved = dir.canonicalize().map_err(|err| {
                EngineError::Execution(format!(
                    "working directory '{}' is not usable: {err}",
                    dir.display()
                ))
            })?;
            if !self.policy.is_dir_allowed(&resolved) {
                return Err(self.deny_working_dir(run_id, context, &resolved));
            }
            return Ok(Some(resolved));
        }

        if !self.policy.allowed_directories.is_empty() {
            let current = std::env::current_dir()?.canonicalize()?;
            if !self.policy.is_dir_allowed(&current) {
                return Err(self.deny_working_dir(run_id, context, &current));
            }
            return Ok(Some(current));
        }

        Ok(None)
    }

    fn deny_working_dir(&self, run_id: Uuid, context: &str, dir: &Path) -> EngineError {
        let reason = format!(
            "working directory '{}' is outside the allowed directories",
            dir.display()
        );
        self.audit
            .log_attempt(run_id, context, &[], &Verdict::Deny(reason.clone()));
        EngineError::Denied {
            command: context.to_string(),
            reason,
        }
    }

    /// The one place child processes are configured: cleared
    /// environment replaced by exactly `env`, no inherited stdin,
    /// piped output, own process group.
    pub(crate) fn base_command(
        &self,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        working_dir: Option<&Path>,
    ) -> Command {
        let mut cmd = Command::new(resolve_program(program));
        cmd.args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    pub(crate) fn spawn_child(
        &self,
        cmd: &mut Command,
        command: &str,
        procs: &ProcessSet,
    ) -> Result<Child> {
        let child = cmd.spawn().map_err(|source| EngineError::Launch {
            command: command.to_string(),
            source,
        })?;
        if let Some(pid) = child.id() {
            procs.track(pid as i32);
            tracing::debug!(command, pid, "spawned child process");
        }
        Ok(child)
    }
}

/// Resolves a bare program name against the parent's `PATH`, the way
/// `execvp` would before the child environment is cleared. Names that
/// carry a slash are used as-is; unresolvable names are passed through
/// so the spawn failure surfaces as a launch error.
fn resolve_program(program: &str) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    let Some(path) = std::env::var_os("PATH") else {
        return PathBuf::from(program);
    };
    for dir in std::env::split_paths(&path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return candidate;
        }
    }
    PathBuf::from(program)
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_set_tracks_and_clears() {
        let procs = ProcessSet::default();
        procs.track(12345);
        procs.untrack(12345);
        // Nothing left to kill; must not touch unrelated processes.
        procs.kill_all();
        assert!(procs.pids.lock().is_empty());
    }

    #[test]
    fn test_resolve_program_searches_path() {
        let resolved = resolve_program("sh");
        assert!(resolved.is_absolute(), "got: {}", resolved.display());
        assert!(resolved.ends_with("sh"));

        // Slash-carrying names pass through untouched.
        assert_eq!(resolve_program("/bin/sh"), PathBuf::from("/bin/sh"));
        assert_eq!(resolve_program("./local"), PathBuf::from("./local"));

        // Unresolvable names fall through to the spawn error.
        let missing = resolve_program("no-such-program-cbfe41");
        assert_eq!(missing, PathBuf::from("no-such-program-cbfe41"));
    }

    #[test]
    fn test_collect_result_merges_truncation() {
        let sinks = CallSinks::new(4, None, None);
        sinks.stdout.lock().write_all(b"abcdefgh").unwrap();
        sinks.stderr.lock().write_all(b"xy").unwrap();

        let result = collect_result(0, &sinks, Instant::now(), false);
        assert!(result.truncated);
        assert_eq!(result.stdout, b"abcd");
        assert_eq!(result.stderr, b"xy");
        assert!(result.success());
        assert!(!result.timed_out);
    }
}
