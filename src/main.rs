use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use devenv::logging::{LogFormat, init_logging};

mod cmd;

#[derive(Parser)]
#[command(name = "devenv")]
#[command(version, about = "Sandboxed dev environment: mount, install, serve and sync a project")]
pub struct Cli {
    /// Debug-level diagnostics (overridden by DEVENV_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mount the project into a sandbox, install, run the dev server and keep
    /// both sides in sync until Ctrl-C
    Up {
        /// Directory backing the sandbox filesystem (defaults to .devenv/sandbox)
        #[arg(long)]
        sandbox_dir: Option<PathBuf>,
    },
    /// Print the mount tree built from the project files as JSON
    Tree,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_logging(cli.verbose, format)?;

    let project_dir = match cli.project.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Up { sandbox_dir } => cmd::cmd_up(&project_dir, sandbox_dir.clone()).await?,
        Commands::Tree => cmd::cmd_tree(&project_dir).await?,
        Commands::Config => cmd::cmd_config(&project_dir)?,
    }

    Ok(())
}
