//! Run command - validate a command or script and execute it.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::{ArgGroup, Args};
use tokio_util::sync::CancellationToken;

use shellward_engine::{shared_writer, AuditLog, EngineError, SafeRunner};
use shellward_policy::Policy;

use super::Context;

/// Arguments for the run command.
#[derive(Args, Debug)]
#[command(group(ArgGroup::new("input").required(true).args(["cmd", "script", "file"])))]
pub struct RunArgs {
    /// Command line to execute, split into argv before validation
    #[arg(long)]
    pub cmd: Option<String>,

    /// Inline shell script to validate and execute
    #[arg(long)]
    pub script: Option<String>,

    /// Path to a shell script to validate and execute
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Policy file (JSON); built-in defaults apply when omitted
    #[arg(long, short = 'c', env = "SHELLWARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Extra allowed commands, comma-separated (only without --config)
    #[arg(long, value_delimiter = ',')]
    pub allow: Vec<String>,

    /// Execution timeout in seconds, overriding the policy
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Working directory, validated against the allowed directories
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// Run the command or script under the policy.
///
/// Returns the process exit code for `main` to propagate: the child's
/// own code when it ran, or a non-zero engine code otherwise.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<i32> {
    let policy = build_policy(&args)?;
    let audit = AuditLog::new(policy.block_log_path.as_deref());

    let mut runner = SafeRunner::new(policy, audit);
    runner.set_outputs(
        shared_writer(std::io::stdout()),
        shared_writer(std::io::stderr()),
    );

    // Ctrl-C cancels the call and kills the spawned process tree.
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let outcome = if let Some(cmd) = &args.cmd {
        let Some(argv) = shlex::split(cmd) else {
            bail!("could not split command line: {cmd}");
        };
        runner.run(&argv, cancel).await
    } else if let Some(script) = &args.script {
        runner.run_script(script, cancel).await
    } else if let Some(path) = &args.file {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open script file {}", path.display()))?;
        runner.run_script_file(file, cancel).await
    } else {
        // The clap group guarantees one input flag is present.
        bail!("one of --cmd, --script or --file is required");
    };

    std::io::stdout().flush()?;

    match outcome {
        Ok(result) => {
            if result.truncated {
                tracing::warn!("output exceeded the configured cap and was truncated");
            }
            if ctx.verbose {
                eprintln!(
                    "shellward: exit={} duration={:?}",
                    result.exit_code, result.duration
                );
            }
            Ok(result.exit_code)
        }
        Err(err) => {
            eprintln!("shellward: {err}");
            Ok(exit_code_for(&err))
        }
    }
}

fn build_policy(args: &RunArgs) -> Result<Policy> {
    let mut policy = match &args.config {
        Some(path) => Policy::load(path)
            .with_context(|| format!("failed to load policy from {}", path.display()))?,
        None => {
            let mut policy = Policy::default();
            for command in &args.allow {
                let command = command.trim();
                if !command.is_empty() {
                    policy.add_allowed_command(command);
                }
            }
            policy
        }
    };

    if args.config.is_some() && !args.allow.is_empty() {
        tracing::warn!("--allow extends the built-in defaults only; ignored with --config");
    }
    if let Some(seconds) = args.timeout {
        policy.max_execution_time = seconds;
    }
    if let Some(dir) = &args.dir {
        policy.working_dir = Some(dir.clone());
    }
    Ok(policy)
}

/// Distinct exit codes per failure class. 124 matches the coreutils
/// `timeout` convention, 130 the shell's SIGINT convention.
fn exit_code_for(err: &EngineError) -> i32 {
    match err {
        EngineError::Parse(_) => 2,
        EngineError::Denied { .. } => 3,
        EngineError::Timeout { .. } => 124,
        EngineError::Cancelled => 130,
        _ => 1,
    }
}
