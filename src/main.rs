use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use stagehand::logging::{LogFormat, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Resumable build-and-publish orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to stagehand.toml (defaults to <project-dir>/stagehand.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Defaults to `resume`, which is what a host restart should invoke.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discard any run in progress and start the pipeline from the first step
    Start,
    /// Continue the run in progress, if any
    Resume,
    /// Show the run in progress and its step-local progress
    Status,
    /// List the assembled steps in execution order
    Steps,
    /// Clear the cursor
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Run the pipeline, relaunching it whenever the host asks to restart
    Supervise {
        /// Give up after this many restarts
        #[arg(long, default_value = "32")]
        max_restarts: u32,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("Error: Failed to get current directory: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    let log_dir = stagehand::config::log_dir(&project_dir);
    let log_dir = std::fs::create_dir_all(&log_dir).ok().map(|_| log_dir);
    init_tracing(cli.verbose, cli.log_format, log_dir.as_deref());

    let result = match cli.command.as_ref().unwrap_or(&Commands::Resume) {
        Commands::Start => cmd::cmd_start(&cli, &project_dir).await,
        Commands::Resume => cmd::cmd_resume(&cli, &project_dir).await,
        Commands::Status => cmd::cmd_status(&cli, &project_dir),
        Commands::Steps => cmd::cmd_steps(&cli, &project_dir),
        Commands::Reset { force } => cmd::cmd_reset(&cli, &project_dir, *force),
        Commands::Supervise { max_restarts } => {
            cmd::cmd_supervise(&cli, &project_dir, *max_restarts).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
