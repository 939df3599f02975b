//! Shellward - policy-enforced command and script execution.
//!
//! Main entry point for the shellward CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::run;

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Shellward - validate and execute shell commands under a security policy
#[derive(Parser)]
#[command(name = "shellward")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a command or script against the policy and execute it
    Run(run::RunArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays reserved for command output.
    let filter = if cli.verbose {
        "shellward=debug,shellward_engine=debug,shellward_policy=debug,info"
    } else {
        "shellward=info,shellward_engine=info,shellward_policy=info,warn"
    };
    tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let ctx = commands::Context {
        verbose: cli.verbose,
    };

    let code = match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
