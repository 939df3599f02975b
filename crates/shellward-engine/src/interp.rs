//! Script interpretation.
//!
//! [`Interp`] walks a lowered [`Program`] and executes it statement by
//! statement. Every external launch goes back through the runner's
//! enforcement core, so the policy holds even for commands assembled
//! from variables at runtime. Expansion is deliberately small: plain
//! variables, command substitution, and whitespace field splitting.

use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use shellward_policy::Verdict;

use crate::ast::{
    AndOrOp, Program, Redirect, RedirectKind, SimpleCommand, Stmt, Word, WordPart,
};
use crate::error::{EngineError, Result};
use crate::limits::BoundedSink;
use crate::runner::{pump, CallSinks, ProcessSet, SafeRunner};
use crate::validate::resolve_creatable;

/// How a statement finished: normally with a status, or via `exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal(i32),
    Exit(i32),
}

#[derive(Debug, Clone)]
struct Var {
    value: String,
    exported: bool,
}

/// Per-stage launch plan: argv and environment are fully expanded and
/// enforced before anything spawns.
struct StagePlan {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    redirs: RedirPlan,
}

/// Redirections resolved to open files and dup flags.
#[derive(Default)]
struct RedirPlan {
    stdin: Option<std::fs::File>,
    stdout: Option<std::fs::File>,
    stderr: Option<std::fs::File>,
    stdout_to_stderr: bool,
    stderr_to_stdout: bool,
}

fn is_builtin_name(name: &str) -> bool {
    matches!(name, "true" | "false" | "exit" | "cd" | "export" | "unset")
}

/// One script execution. Subshells and command substitutions run on a
/// clone that shares the process set and output sinks but owns its
/// variables, functions, and working directory.
pub(crate) struct Interp<'r> {
    runner: &'r SafeRunner,
    run_id: Uuid,
    procs: ProcessSet,
    sinks: CallSinks,
    vars: HashMap<String, Var>,
    functions: HashMap<String, Stmt>,
    cwd: Option<PathBuf>,
}

impl<'r> Interp<'r> {
    pub(crate) fn new(
        runner: &'r SafeRunner,
        run_id: Uuid,
        procs: ProcessSet,
        sinks: CallSinks,
    ) -> Result<Self> {
        let cwd = runner.resolve_working_dir(run_id, "<script>")?;
        let mut vars = HashMap::new();
        for (name, value) in &runner.policy().restricted_env {
            vars.insert(
                name.clone(),
                Var {
                    value: value.clone(),
                    exported: true,
                },
            );
        }
        Ok(Self {
            runner,
            run_id,
            procs,
            sinks,
            vars,
            functions: HashMap::new(),
            cwd,
        })
    }

    fn subshell(&self) -> Interp<'r> {
        Interp {
            runner: self.runner,
            run_id: self.run_id,
            procs: self.procs.clone(),
            sinks: self.sinks.clone(),
            vars: self.vars.clone(),
            functions: self.functions.clone(),
            cwd: self.cwd.clone(),
        }
    }

    pub(crate) async fn exec_program(&mut self, program: &Program) -> Result<i32> {
        match self.exec_block(&program.stmts).await? {
            Flow::Normal(code) | Flow::Exit(code) => Ok(code),
        }
    }

    async fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        let mut status = 0;
        for stmt in stmts {
            // The boxing point that keeps recursive statement futures
            // finitely sized.
            match Box::pin(self.exec_stmt(stmt)).await? {
                Flow::Normal(code) => status = code,
                exit @ Flow::Exit(_) => return Ok(exit),
            }
        }
        Ok(Flow::Normal(status))
    }

    async fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        match stmt {
            Stmt::Simple(cmd) => self.exec_simple(cmd, &[]).await,
            Stmt::Pipeline(stages) => self.exec_pipeline(stages, &[]).await,
            Stmt::AndOr { op, lhs, rhs } => {
                let flow = Box::pin(self.exec_stmt(lhs)).await?;
                let Flow::Normal(code) = flow else {
                    return Ok(flow);
                };
                let run_rhs = match op {
                    AndOrOp::And => code == 0,
                    AndOrOp::Or => code != 0,
                };
                if run_rhs {
                    Box::pin(self.exec_stmt(rhs)).await
                } else {
                    Ok(Flow::Normal(code))
                }
            }
            Stmt::Not(inner) => match Box::pin(self.exec_stmt(inner)).await? {
                Flow::Normal(0) => Ok(Flow::Normal(1)),
                Flow::Normal(_) => Ok(Flow::Normal(0)),
                exit => Ok(exit),
            },
            Stmt::Subshell(stmts) => {
                let mut sub = self.subshell();
                // `exit` inside a subshell only leaves the subshell.
                let code = match sub.exec_block(stmts).await? {
                    Flow::Normal(code) | Flow::Exit(code) => code,
                };
                Ok(Flow::Normal(code))
            }
            Stmt::BraceGroup(stmts) => self.exec_block(stmts).await,
            Stmt::If { arms, else_body } => {
                for arm in arms {
                    let flow = self.exec_block(&arm.cond).await?;
                    let Flow::Normal(code) = flow else {
                        return Ok(flow);
                    };
                    if code == 0 {
                        return self.exec_block(&arm.body).await;
                    }
                }
                self.exec_block(else_body).await
            }
            Stmt::While { until, cond, body } => {
                let mut status = 0;
                loop {
                    let flow = self.exec_block(cond).await?;
                    let Flow::Normal(code) = flow else {
                        return Ok(flow);
                    };
                    if (code == 0) == *until {
                        break;
                    }
                    let flow = self.exec_block(body).await?;
                    let Flow::Normal(code) = flow else {
                        return Ok(flow);
                    };
                    status = code;
                }
                Ok(Flow::Normal(status))
            }
            Stmt::For { var, items, body } => {
                let mut values = Vec::new();
                for item in items {
                    self.expand_word_into(item, &mut values).await?;
                }
                let mut status = 0;
                for value in values {
                    let exported = self.vars.get(var).map(|v| v.exported).unwrap_or(false);
                    self.vars.insert(var.clone(), Var { value, exported });
                    let flow = self.exec_block(body).await?;
                    let Flow::Normal(code) = flow else {
                        return Ok(flow);
                    };
                    status = code;
                }
                Ok(Flow::Normal(status))
            }
            Stmt::FunctionDef { name, body } => {
                self.functions.insert(name.clone(), (**body).clone());
                Ok(Flow::Normal(0))
            }
            Stmt::Assign(assignments) => {
                for assignment in assignments {
                    let value = self.expand_word_joined(&assignment.value).await?;
                    self.set_var(&assignment.name, value);
                }
                Ok(Flow::Normal(0))
            }
            Stmt::Redirected { stmt, redirects } => match stmt.as_ref() {
                Stmt::Simple(cmd) => self.exec_simple(cmd, redirects).await,
                Stmt::Pipeline(stages) => self.exec_pipeline(stages, redirects).await,
                _ => Err(EngineError::Execution(
                    "redirection on compound commands is not supported".to_string(),
                )),
            },
        }
    }

    async fn exec_simple(&mut self, cmd: &SimpleCommand, redirects: &[Redirect]) -> Result<Flow> {
        let mut cmd_env = BTreeMap::new();
        for assignment in &cmd.assignments {
            let value = self.expand_word_joined(&assignment.value).await?;
            cmd_env.insert(assignment.name.clone(), value);
        }

        let mut argv = Vec::new();
        for word in &cmd.words {
            self.expand_word_into(word, &mut argv).await?;
        }

        let Some((name, args)) = argv.split_first() else {
            // Assignment-only command: the assignments persist.
            for (name, value) in cmd_env {
                self.set_var(&name, value);
            }
            return Ok(Flow::Normal(0));
        };

        if let Some(body) = self.functions.get(name).cloned() {
            if !args.is_empty() {
                return Err(EngineError::Execution(
                    "arguments to function calls are not supported".to_string(),
                ));
            }
            if !redirects.is_empty() || !cmd_env.is_empty() {
                return Err(EngineError::Execution(
                    "redirections and environment prefixes on function calls are not supported"
                        .to_string(),
                ));
            }
            return Box::pin(self.exec_stmt(&body)).await;
        }

        // Runtime enforcement: names assembled from expansions are
        // judged here, with the audit record.
        self.runner.enforce(self.run_id, name, args)?;

        if let Some(flow) = self.try_builtin(name, args, &cmd_env, redirects)? {
            return Ok(flow);
        }

        let redirs = self.plan_redirects(redirects).await?;
        let env = self.child_env(&cmd_env);
        let code = self.run_stages(vec![StagePlan { argv, env, redirs }]).await?;
        Ok(Flow::Normal(code))
    }

    async fn exec_pipeline(&mut self, stages: &[Stmt], outer: &[Redirect]) -> Result<Flow> {
        let mut plans = Vec::with_capacity(stages.len());
        for stage in stages {
            let (cmd, redirects): (&SimpleCommand, &[Redirect]) = match stage {
                Stmt::Simple(cmd) => (cmd, &[]),
                Stmt::Redirected { stmt, redirects } => match stmt.as_ref() {
                    Stmt::Simple(cmd) => (cmd, redirects.as_slice()),
                    _ => {
                        return Err(EngineError::Execution(
                            "pipelines may only contain simple commands".to_string(),
                        ));
                    }
                },
                _ => {
                    return Err(EngineError::Execution(
                        "pipelines may only contain simple commands".to_string(),
                    ));
                }
            };

            let mut cmd_env = BTreeMap::new();
            for assignment in &cmd.assignments {
                let value = self.expand_word_joined(&assignment.value).await?;
                cmd_env.insert(assignment.name.clone(), value);
            }
            let mut argv = Vec::new();
            for word in &cmd.words {
                self.expand_word_into(word, &mut argv).await?;
            }
            let Some((name, args)) = argv.split_first() else {
                return Err(EngineError::Execution(
                    "pipeline stage expanded to an empty command".to_string(),
                ));
            };
            if self.functions.contains_key(name) || is_builtin_name(name) {
                return Err(EngineError::Execution(format!(
                    "'{name}' cannot be used in a pipeline"
                )));
            }

            // Every stage is enforced before the first one spawns.
            self.runner.enforce(self.run_id, name, args)?;

            let redirs = self.plan_redirects(redirects).await?;
            let env = self.child_env(&cmd_env);
            plans.push(StagePlan { argv, env, redirs });
        }

        // Trailing redirects on the pipeline bind to the last stage.
        if !outer.is_empty() {
            let mut outer_plan = self.plan_redirects(outer).await?;
            if let Some(last) = plans.last_mut() {
                if outer_plan.stdin.is_some() {
                    last.redirs.stdin = outer_plan.stdin.take();
                }
                if outer_plan.stdout.is_some() {
                    last.redirs.stdout = outer_plan.stdout.take();
                }
                if outer_plan.stderr.is_some() {
                    last.redirs.stderr = outer_plan.stderr.take();
                }
                last.redirs.stdout_to_stderr |= outer_plan.stdout_to_stderr;
                last.redirs.stderr_to_stdout |= outer_plan.stderr_to_stdout;
            }
        }

        let code = self.run_stages(plans).await?;
        Ok(Flow::Normal(code))
    }

    /// Spawns one or more stages wired stdout-to-stdin, waits for all
    /// of them, and returns the last stage's exit code.
    async fn run_stages(&mut self, plans: Vec<StagePlan>) -> Result<i32> {
        let stage_count = plans.len();
        let mut children = Vec::with_capacity(stage_count);
        let mut pumps: Vec<JoinHandle<()>> = Vec::new();
        let mut prev_stdout: Option<tokio::process::ChildStdout> = None;

        for (index, plan) in plans.into_iter().enumerate() {
            let last = index + 1 == stage_count;
            let Some((name, args)) = plan.argv.split_first() else {
                return Err(EngineError::Execution("no command provided".to_string()));
            };

            let mut redirs = plan.redirs;
            // Dups against a redirected stream resolve to the file.
            if redirs.stderr_to_stdout {
                if let Some(file) = &redirs.stdout {
                    redirs.stderr = Some(file.try_clone()?);
                    redirs.stderr_to_stdout = false;
                }
            }
            if redirs.stdout_to_stderr {
                if let Some(file) = &redirs.stderr {
                    redirs.stdout = Some(file.try_clone()?);
                    redirs.stdout_to_stderr = false;
                }
            }
            if !last && (redirs.stdout_to_stderr || redirs.stderr_to_stdout) {
                return Err(EngineError::Execution(
                    "stream duplication inside pipelines is not supported".to_string(),
                ));
            }

            let mut cmd = self
                .runner
                .base_command(name, args, &plan.env, self.cwd.as_deref());

            if let Some(file) = redirs.stdin.take() {
                cmd.stdin(Stdio::from(file));
                prev_stdout = None;
            } else if let Some(prev) = prev_stdout.take() {
                let stdio: Stdio = prev.try_into().map_err(|err: std::io::Error| {
                    EngineError::Execution(format!("failed to wire pipeline: {err}"))
                })?;
                cmd.stdin(stdio);
            }
            if let Some(file) = redirs.stdout.take() {
                cmd.stdout(Stdio::from(file));
            }
            if let Some(file) = redirs.stderr.take() {
                cmd.stderr(Stdio::from(file));
            }

            let mut child = self.runner.spawn_child(&mut cmd, name, &self.procs)?;
            let pid = child.id().map(|id| id as i32);

            if let Some(err_pipe) = child.stderr.take() {
                let sink = if redirs.stderr_to_stdout {
                    self.sinks.stdout.clone()
                } else {
                    self.sinks.stderr.clone()
                };
                pumps.push(pump(err_pipe, sink));
            }
            if last {
                if let Some(out_pipe) = child.stdout.take() {
                    let sink = if redirs.stdout_to_stderr {
                        self.sinks.stderr.clone()
                    } else {
                        self.sinks.stdout.clone()
                    };
                    pumps.push(pump(out_pipe, sink));
                }
            } else {
                prev_stdout = child.stdout.take();
            }

            children.push((child, pid));
        }

        let mut code = 0;
        for (mut child, pid) in children {
            let status = child.wait().await?;
            if let Some(pid) = pid {
                self.procs.untrack(pid);
            }
            code = status.code().unwrap_or(-1);
        }
        for handle in pumps {
            let _ = handle.await;
        }
        Ok(code)
    }

    // ─────────────────────────────────────────────────────────────────
    // Builtins
    // ─────────────────────────────────────────────────────────────────

    fn try_builtin(
        &mut self,
        name: &str,
        args: &[String],
        cmd_env: &BTreeMap<String, String>,
        redirects: &[Redirect],
    ) -> Result<Option<Flow>> {
        if !is_builtin_name(name) {
            return Ok(None);
        }
        if !redirects.is_empty() || !cmd_env.is_empty() {
            return Err(EngineError::Execution(format!(
                "redirections and environment prefixes on '{name}' are not supported"
            )));
        }

        let flow = match name {
            "true" => Flow::Normal(0),
            "false" => Flow::Normal(1),
            "exit" => {
                let code = match args.first() {
                    Some(arg) => arg.parse::<i32>().unwrap_or(2),
                    None => 0,
                };
                Flow::Exit(code)
            }
            "cd" => self.builtin_cd(args)?,
            "export" => {
                for arg in args {
                    match arg.split_once('=') {
                        Some((name, value)) => {
                            self.vars.insert(
                                name.to_string(),
                                Var {
                                    value: value.to_string(),
                                    exported: true,
                                },
                            );
                        }
                        None => {
                            let value = self
                                .vars
                                .get(arg)
                                .map(|v| v.value.clone())
                                .unwrap_or_default();
                            self.vars.insert(
                                arg.clone(),
                                Var {
                                    value,
                                    exported: true,
                                },
                            );
                        }
                    }
                }
                Flow::Normal(0)
            }
            "unset" => {
                for arg in args {
                    self.vars.remove(arg);
                }
                Flow::Normal(0)
            }
            _ => return Ok(None),
        };
        Ok(Some(flow))
    }

    /// `cd`: missing or unreadable targets fail softly with status 1,
    /// but a target outside the allowed directories is a hard denial.
    fn builtin_cd(&mut self, args: &[String]) -> Result<Flow> {
        let target = match args.first() {
            Some(dir) => PathBuf::from(dir),
            None => match self.vars.get("HOME") {
                Some(home) if !home.value.is_empty() => PathBuf::from(&home.value),
                _ => {
                    self.write_stderr("cd: HOME not set\n");
                    return Ok(Flow::Normal(1));
                }
            },
        };

        let joined = if target.is_absolute() {
            target.clone()
        } else {
            self.base_dir().join(&target)
        };
        let resolved = match joined.canonicalize() {
            Ok(dir) if dir.is_dir() => dir,
            Ok(_) => {
                self.write_stderr(&format!("cd: {}: not a directory\n", target.display()));
                return Ok(Flow::Normal(1));
            }
            Err(err) => {
                self.write_stderr(&format!("cd: {}: {err}\n", target.display()));
                return Ok(Flow::Normal(1));
            }
        };

        if !self.runner.policy().is_dir_allowed(&resolved) {
            let reason = format!(
                "directory '{}' is outside the allowed directories",
                resolved.display()
            );
            self.runner.audit().log_attempt(
                self.run_id,
                "cd",
                args,
                &Verdict::Deny(reason.clone()),
            );
            return Err(EngineError::Denied {
                command: "cd".to_string(),
                reason,
            });
        }

        self.cwd = Some(resolved);
        Ok(Flow::Normal(0))
    }

    // ─────────────────────────────────────────────────────────────────
    // Expansion
    // ─────────────────────────────────────────────────────────────────

    /// Expands `word` into zero or more fields. Unquoted variable and
    /// substitution results are split on whitespace; quoted ones and
    /// literals are not. An empty unquoted expansion produces no field.
    async fn expand_word_into(&self, word: &Word, out: &mut Vec<String>) -> Result<()> {
        let mut field: Option<String> = None;
        for part in &word.parts {
            let (text, split) = self.expand_part(part).await?;
            if !split {
                field.get_or_insert_with(String::new).push_str(&text);
                continue;
            }

            let starts_ws = text.starts_with(|c: char| c.is_ascii_whitespace());
            let ends_ws = text.ends_with(|c: char| c.is_ascii_whitespace());
            let mut pieces = text.split_ascii_whitespace();

            let Some(first) = pieces.next() else {
                // Whitespace-only expansions close the current field;
                // empty ones vanish entirely.
                if !text.is_empty() {
                    if let Some(done) = field.take() {
                        out.push(done);
                    }
                }
                continue;
            };
            if starts_ws {
                if let Some(done) = field.take() {
                    out.push(done);
                }
                field = Some(first.to_string());
            } else {
                field.get_or_insert_with(String::new).push_str(first);
            }
            for piece in pieces {
                if let Some(done) = field.take() {
                    out.push(done);
                }
                field = Some(piece.to_string());
            }
            if ends_ws {
                if let Some(done) = field.take() {
                    out.push(done);
                }
            }
        }
        if let Some(done) = field.take() {
            out.push(done);
        }
        Ok(())
    }

    /// Expands `word` to a single string without field splitting, the
    /// form assignments use.
    async fn expand_word_joined(&self, word: &Word) -> Result<String> {
        let mut out = String::new();
        for part in &word.parts {
            let (text, _) = self.expand_part(part).await?;
            out.push_str(&text);
        }
        Ok(out)
    }

    async fn expand_part(&self, part: &WordPart) -> Result<(String, bool)> {
        match part {
            WordPart::Literal(text) => Ok((text.clone(), false)),
            WordPart::VarRef { name, quoted } => Ok((self.lookup(name), !quoted)),
            WordPart::CmdSubst { program, quoted } => {
                Ok((self.capture_subst(program).await?, !quoted))
            }
            WordPart::Unsupported(text) => Err(EngineError::Execution(format!(
                "unsupported expansion '{text}'"
            ))),
        }
    }

    fn lookup(&self, name: &str) -> String {
        self.vars
            .get(name)
            .map(|var| var.value.clone())
            .unwrap_or_default()
    }

    /// Runs a `$(...)` program on a subshell clone, capturing its
    /// stdout. Stderr still flows to the call's stderr sink, and the
    /// trailing newlines are trimmed the way shells do.
    async fn capture_subst(&self, program: &Program) -> Result<String> {
        let capture = Arc::new(Mutex::new(BoundedSink::new(
            self.runner.policy().max_output_size,
        )));
        let mut sub = self.subshell();
        sub.sinks = CallSinks {
            stdout: capture.clone(),
            stderr: self.sinks.stderr.clone(),
        };
        sub.exec_block(&program.stmts).await?;

        let bytes = capture.lock().take_captured();
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        while text.ends_with('\n') {
            text.pop();
        }
        Ok(text)
    }

    // ─────────────────────────────────────────────────────────────────
    // Environment and redirect plumbing
    // ─────────────────────────────────────────────────────────────────

    fn set_var(&mut self, name: &str, value: String) {
        let exported = self.vars.get(name).map(|v| v.exported).unwrap_or(false);
        self.vars.insert(name.to_string(), Var { value, exported });
    }

    /// The complete child environment: exported variables overlaid
    /// with any per-command prefix assignments.
    fn child_env(&self, cmd_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .vars
            .iter()
            .filter(|(_, var)| var.exported)
            .map(|(name, var)| (name.clone(), var.value.clone()))
            .collect();
        for (name, value) in cmd_env {
            env.insert(name.clone(), value.clone());
        }
        env
    }

    fn base_dir(&self) -> PathBuf {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn write_stderr(&self, message: &str) {
        let _ = self.sinks.stderr.lock().write_all(message.as_bytes());
    }

    async fn plan_redirects(&self, redirects: &[Redirect]) -> Result<RedirPlan> {
        let mut plan = RedirPlan::default();
        for redirect in redirects {
            match redirect.kind {
                RedirectKind::In => {
                    if !matches!(redirect.fd, None | Some(0)) {
                        return Err(EngineError::Execution(
                            "unsupported input redirect descriptor".to_string(),
                        ));
                    }
                    let target = self.expand_word_joined(&redirect.target).await?;
                    plan.stdin = Some(self.open_read(&target)?);
                }
                RedirectKind::Out | RedirectKind::Append => {
                    let append = redirect.kind == RedirectKind::Append;
                    let target = self.expand_word_joined(&redirect.target).await?;
                    let file = self.open_write(&target, append)?;
                    match redirect.fd {
                        None | Some(1) => plan.stdout = Some(file),
                        Some(2) => plan.stderr = Some(file),
                        Some(fd) => {
                            return Err(EngineError::Execution(format!(
                                "unsupported redirect descriptor {fd}"
                            )));
                        }
                    }
                }
                RedirectKind::OutErr => {
                    let target = self.expand_word_joined(&redirect.target).await?;
                    let file = self.open_write(&target, false)?;
                    plan.stderr = Some(file.try_clone()?);
                    plan.stdout = Some(file);
                }
                RedirectKind::Dup => {
                    let target = self.expand_word_joined(&redirect.target).await?;
                    match (redirect.fd, target.as_str()) {
                        (Some(2), "1") => plan.stderr_to_stdout = true,
                        (None | Some(1), "2") => plan.stdout_to_stderr = true,
                        (fd, other) => {
                            return Err(EngineError::Execution(format!(
                                "unsupported descriptor duplication '{}>&{other}'",
                                fd.unwrap_or(1)
                            )));
                        }
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Opens a redirect target for writing, confined to the allowed
    /// directories. Targets are re-checked here because expansion can
    /// produce paths the static pass never saw.
    fn open_write(&self, target: &str, append: bool) -> Result<std::fs::File> {
        let path = self.resolve_redirect_path(target)?;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        options.open(&path).map_err(|err| {
            EngineError::Execution(format!("cannot open '{target}' for writing: {err}"))
        })
    }

    fn open_read(&self, target: &str) -> Result<std::fs::File> {
        let path = self.resolve_redirect_path(target)?;
        std::fs::File::open(&path).map_err(|err| {
            EngineError::Execution(format!("cannot open '{target}' for reading: {err}"))
        })
    }

    fn resolve_redirect_path(&self, target: &str) -> Result<PathBuf> {
        let joined = self.base_dir().join(target);
        let resolved = resolve_creatable(&joined).map_err(|err| {
            EngineError::Execution(format!("cannot resolve '{target}': {err}"))
        })?;
        if !self.runner.policy().is_dir_allowed(&resolved) {
            let reason = format!("redirect target '{target}' is outside the allowed directories");
            self.runner.audit().log_attempt(
                self.run_id,
                "<redirect>",
                &[],
                &Verdict::Deny(reason.clone()),
            );
            return Err(EngineError::Denied {
                command: "<redirect>".to_string(),
                reason,
            });
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use shellward_policy::Policy;

    fn unconfined_runner() -> SafeRunner {
        let policy = Policy {
            allowed_directories: Vec::new(),
            ..Policy::default()
        };
        SafeRunner::new(policy, AuditLog::new(None))
    }

    fn interp(runner: &SafeRunner) -> Interp<'_> {
        Interp::new(
            runner,
            Uuid::new_v4(),
            ProcessSet::default(),
            CallSinks::new(4096, None, None),
        )
        .unwrap()
    }

    fn var_ref(name: &str, quoted: bool) -> WordPart {
        WordPart::VarRef {
            name: name.to_string(),
            quoted,
        }
    }

    #[tokio::test]
    async fn test_unquoted_expansion_field_splits() {
        let runner = unconfined_runner();
        let mut it = interp(&runner);
        it.vars.insert(
            "X".to_string(),
            Var {
                value: "1 2".to_string(),
                exported: false,
            },
        );

        let word = Word {
            parts: vec![WordPart::Literal("a".to_string()), var_ref("X", false)],
        };
        let mut out = Vec::new();
        it.expand_word_into(&word, &mut out).await.unwrap();
        assert_eq!(out, vec!["a1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_quoted_expansion_is_one_field() {
        let runner = unconfined_runner();
        let mut it = interp(&runner);
        it.vars.insert(
            "X".to_string(),
            Var {
                value: "1 2".to_string(),
                exported: false,
            },
        );

        let word = Word {
            parts: vec![var_ref("X", true)],
        };
        let mut out = Vec::new();
        it.expand_word_into(&word, &mut out).await.unwrap();
        assert_eq!(out, vec!["1 2".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_unquoted_expansion_drops_the_field() {
        let runner = unconfined_runner();
        let it = interp(&runner);

        let mut out = Vec::new();
        it.expand_word_into(
            &Word {
                parts: vec![var_ref("UNSET", false)],
            },
            &mut out,
        )
        .await
        .unwrap();
        assert!(out.is_empty());

        it.expand_word_into(
            &Word {
                parts: vec![var_ref("UNSET", true)],
            },
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(out, vec![String::new()]);
    }

    #[tokio::test]
    async fn test_unsupported_expansion_is_an_error() {
        let runner = unconfined_runner();
        let it = interp(&runner);
        let word = Word {
            parts: vec![WordPart::Unsupported("${x:-y}".to_string())],
        };
        let err = it.expand_word_joined(&word).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[tokio::test]
    async fn test_export_and_unset_update_child_env() {
        let runner = unconfined_runner();
        let mut it = interp(&runner);
        let empty = BTreeMap::new();

        it.try_builtin("export", &["GREETING=hi".to_string()], &empty, &[])
            .unwrap();
        assert_eq!(it.child_env(&empty).get("GREETING").map(String::as_str), Some("hi"));

        it.try_builtin("unset", &["GREETING".to_string()], &empty, &[])
            .unwrap();
        assert!(!it.child_env(&empty).contains_key("GREETING"));
    }

    #[tokio::test]
    async fn test_plain_assignment_is_not_exported() {
        let runner = unconfined_runner();
        let mut it = interp(&runner);
        it.set_var("LOCAL", "x".to_string());
        assert!(!it.child_env(&BTreeMap::new()).contains_key("LOCAL"));
        assert_eq!(it.lookup("LOCAL"), "x");
    }

    #[tokio::test]
    async fn test_exit_builtin_returns_exit_flow() {
        let runner = unconfined_runner();
        let mut it = interp(&runner);
        let empty = BTreeMap::new();

        let flow = it
            .try_builtin("exit", &["3".to_string()], &empty, &[])
            .unwrap();
        assert_eq!(flow, Some(Flow::Exit(3)));

        let flow = it.try_builtin("exit", &[], &empty, &[]).unwrap();
        assert_eq!(flow, Some(Flow::Exit(0)));
    }

    #[tokio::test]
    async fn test_cd_updates_cwd_and_enforces_confinement() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();

        let policy = Policy {
            allowed_directories: vec![root.display().to_string()],
            working_dir: Some(root.clone()),
            ..Policy::default()
        };
        let runner = SafeRunner::new(policy, AuditLog::new(None));
        let mut it = interp(&runner);

        let flow = it.builtin_cd(&["sub".to_string()]).unwrap();
        assert_eq!(flow, Flow::Normal(0));
        assert_eq!(it.cwd.as_deref(), Some(root.join("sub").as_path()));

        // Missing directory fails softly.
        let flow = it.builtin_cd(&["missing".to_string()]).unwrap();
        assert_eq!(flow, Flow::Normal(1));

        // Leaving the allowed tree is a hard denial.
        let err = it.builtin_cd(&["/etc".to_string()]).unwrap_err();
        assert!(matches!(err, EngineError::Denied { .. }));
    }
}
