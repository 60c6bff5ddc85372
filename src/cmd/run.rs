//! Pipeline execution: `stagehand start`, `stagehand resume` and
//! `stagehand supervise`.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use stagehand::config::StagehandConfig;
use stagehand::context::BuildContext;
use stagehand::cursor::{CursorManager, FileCursorStore};
use stagehand::errors::{ConfigError, PipelineError, StoreError};
use stagehand::host::{HostControl, ProcessHost, RESTART_EXIT_CODE};
use stagehand::logging::{LOG_TAG, LogFormat};
use stagehand::orchestrator::{Pipeline, PipelineOutcome};
use stagehand::pipeline::builtin_registry;
use stagehand::services::{RemoteArtifact, Services};

use super::super::Cli;

/// Load the descriptor. A descriptor that no longer loads cannot resume
/// anything, so a leftover cursor is cleared before the error surfaces.
fn load_config(cli: &Cli, project_dir: &Path) -> Result<StagehandConfig> {
    match StagehandConfig::load(project_dir, cli.config.as_deref(), cli.verbose) {
        Ok(config) => {
            for warning in config.toml.validate() {
                tracing::warn!("{} {}", LOG_TAG, warning);
            }
            Ok(config)
        }
        Err(e) => {
            abandon_run(project_dir, &e);
            Err(e.into())
        }
    }
}

fn abandon_run(project_dir: &Path, error: &ConfigError) {
    let path = stagehand::config::cursor_file(project_dir);
    if !path.exists() {
        return;
    }
    tracing::error!("{} Abandoning run in progress: {}", LOG_TAG, error);
    match FileCursorStore::open_discarding_corrupt(&path) {
        Ok(store) => {
            if let Err(e) = CursorManager::new(Arc::new(store)).clear() {
                tracing::warn!("{} Could not clear cursor: {}", LOG_TAG, e);
            }
        }
        Err(e) => tracing::warn!("{} Could not open cursor store: {}", LOG_TAG, e),
    }
}

fn prepare(config: &StagehandConfig, store: FileCursorStore) -> (Pipeline, BuildContext) {
    let cursor = CursorManager::new(Arc::new(store));

    let host: Arc<dyn HostControl> = Arc::new(ProcessHost);
    let services = Services::local(config, host);
    let registry = builtin_registry(config, &services);
    let pipeline = Pipeline::assemble(&registry, cursor.clone());
    let ctx = BuildContext::from_config(config, cursor);
    (pipeline, ctx)
}

fn report(outcome: &PipelineOutcome, published: &[RemoteArtifact]) -> ExitCode {
    match outcome {
        PipelineOutcome::Completed { steps_run } => {
            println!(
                "{} Pipeline completed ({} steps run)",
                console::style("✓").green().bold(),
                steps_run
            );
            for remote in published {
                println!(
                    "  {} v{} → {}",
                    remote.destination_id,
                    remote.version,
                    remote.location.display()
                );
            }
        }
        PipelineOutcome::Aborted(error) => {
            eprintln!(
                "{} Pipeline failed: {}",
                console::style("✗").red().bold(),
                error
            );
        }
    }
    ExitCode::from(outcome.exit_code())
}

pub async fn cmd_start(cli: &Cli, project_dir: &Path) -> Result<ExitCode> {
    let config = load_config(cli, project_dir)?;
    config.ensure_directories()?;
    // A new run replaces whatever was there, readable or not.
    let store = FileCursorStore::open_discarding_corrupt(config.cursor_file())
        .context("Failed to open the cursor store")?;
    let (pipeline, mut ctx) = prepare(&config, store);
    let outcome = pipeline.start(&mut ctx).await;
    Ok(report(&outcome, &ctx.published))
}

pub async fn cmd_resume(cli: &Cli, project_dir: &Path) -> Result<ExitCode> {
    let config = load_config(cli, project_dir)?;
    config.ensure_directories()?;
    let store = match FileCursorStore::open(config.cursor_file()) {
        Ok(store) => store,
        Err(e @ StoreError::Corrupt { .. }) => {
            // Nothing can be resumed from an unreadable cursor: abort the run.
            tracing::error!("{} Pipeline aborted: {}", LOG_TAG, e);
            FileCursorStore::open_discarding_corrupt(config.cursor_file())
                .context("Failed to discard the cursor store")?;
            let outcome = PipelineOutcome::Aborted(PipelineError::Store(e));
            return Ok(report(&outcome, &[]));
        }
        Err(e) => return Err(e).context("Failed to open the cursor store"),
    };
    let (pipeline, mut ctx) = prepare(&config, store);
    match pipeline.resume(&mut ctx).await {
        Some(outcome) => Ok(report(&outcome, &ctx.published)),
        None => {
            println!("No run in progress.");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run `start` in a child process, then `resume` for as long as the child
/// exits asking to be restarted.
pub async fn cmd_supervise(cli: &Cli, project_dir: &Path, max_restarts: u32) -> Result<ExitCode> {
    let exe = std::env::current_exe().context("Failed to locate the stagehand executable")?;

    let mut base_args: Vec<std::ffi::OsString> = vec![
        "--project-dir".into(),
        project_dir.as_os_str().to_owned(),
        "--log-format".into(),
        match cli.log_format {
            LogFormat::Text => "text".into(),
            LogFormat::Json => "json".into(),
        },
    ];
    if let Some(config) = &cli.config {
        base_args.push("--config".into());
        base_args.push(config.as_os_str().to_owned());
    }
    if cli.verbose {
        base_args.push("--verbose".into());
    }

    let mut command = "start";
    let mut restarts = 0;
    loop {
        let status = tokio::process::Command::new(&exe)
            .args(&base_args)
            .arg(command)
            .status()
            .await
            .with_context(|| format!("Failed to launch '{} {}'", exe.display(), command))?;

        match status.code() {
            Some(RESTART_EXIT_CODE) => {
                restarts += 1;
                if restarts > max_restarts {
                    bail!(
                        "Host asked to restart {} times (limit {}); giving up",
                        restarts,
                        max_restarts
                    );
                }
                tracing::info!("{} Relaunching host (restart {})", LOG_TAG, restarts);
                command = "resume";
            }
            Some(code) => return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1))),
            None => bail!("Pipeline process was terminated by a signal"),
        }
    }
}
