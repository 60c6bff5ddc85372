//! Cursor inspection and reset: `stagehand status`, `steps`, `reset`.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use stagehand::config::{self, StagehandConfig};
use stagehand::cursor::{Cursor, CursorManager, FileCursorStore, MemoryCursorStore};
use stagehand::errors::StoreError;
use stagehand::host::RecordingHost;
use stagehand::orchestrator::Pipeline;
use stagehand::pipeline::builtin_registry;
use stagehand::services::Services;
use stagehand::step::Step;

use super::super::Cli;

/// Cursor as currently on disk, read without taking the store lock.
fn snapshot(project_dir: &Path) -> Result<CursorManager, StoreError> {
    let entries = FileCursorStore::snapshot(&config::cursor_file(project_dir))?;
    Ok(CursorManager::new(Arc::new(MemoryCursorStore::from_entries(
        entries,
    ))))
}

/// Assembled steps for display. Nothing runs, so restarts are only recorded.
fn assembled_steps(config: &StagehandConfig) -> Vec<Step> {
    let services = Services::local(config, Arc::new(RecordingHost::new()));
    let registry = builtin_registry(config, &services);
    Pipeline::assemble(&registry, CursorManager::new(Arc::new(MemoryCursorStore::new())))
        .steps()
        .to_vec()
}

pub fn cmd_status(cli: &Cli, project_dir: &Path) -> Result<ExitCode> {
    println!();
    println!("Stagehand Status");
    println!("================");
    println!();

    let config = StagehandConfig::load(project_dir, cli.config.as_deref(), cli.verbose);
    match &config {
        Ok(config) => println!("Config:  {}", config.config_path.display()),
        Err(e) => println!("Config:  {}", console::style(e).red()),
    }

    let loaded = snapshot(project_dir).and_then(|cursor| {
        let current = cursor.load()?;
        Ok((cursor, current))
    });
    let (cursor, current) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("Run:     {}", console::style(format!("unreadable ({})", e)).red());
            println!("         `stagehand start` or `stagehand reset` discards it");
            println!();
            return Ok(ExitCode::SUCCESS);
        }
    };
    let Some(current) = current else {
        println!("Run:     None in progress");
        println!();
        return Ok(ExitCode::SUCCESS);
    };

    println!(
        "Run:     {} (started {})",
        current.run_id,
        current.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let steps = config.as_ref().map(assembled_steps).unwrap_or_default();
    println!("Step:    {}", describe_position(&current, &steps));

    let progress = cursor.sub_progress()?;
    if !progress.is_empty() {
        println!();
        println!("Step progress:");
        for (key, value) in &progress {
            println!("  {} = {}", key, value);
        }
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

fn describe_position(cursor: &Cursor, steps: &[Step]) -> String {
    let Some(step) = steps.get(cursor.step_index) else {
        return format!("#{} (not in the current step list)", cursor.step_index);
    };
    let state = if cursor.attempts() == 0 {
        "not started".to_string()
    } else {
        format!("attempt {}", cursor.attempts())
    };
    format!(
        "{}/{} {} ({}, policy {}, retry limit {})",
        cursor.step_index + 1,
        steps.len(),
        step.name,
        state,
        step.policy,
        step.retry_limit
    )
}

pub fn cmd_steps(cli: &Cli, project_dir: &Path) -> Result<ExitCode> {
    let config = StagehandConfig::load(project_dir, cli.config.as_deref(), cli.verbose)?;
    let steps = assembled_steps(&config);
    // An unreadable cursor just means no marker.
    let current = snapshot(project_dir)
        .and_then(|c| c.load())
        .ok()
        .flatten()
        .map(|c| c.step_index);

    println!();
    println!(
        "{:<3} {:<6} {:<7} {:<9} {:<6} Name",
        "", "Index", "Order", "Policy", "Retry"
    );
    println!(
        "{:<3} {:<6} {:<7} {:<9} {:<6} ----",
        "", "-----", "-----", "------", "-----"
    );
    for (index, step) in steps.iter().enumerate() {
        let marker = if current == Some(index) { "→" } else { "" };
        let line = format!(
            "{:<3} {:<6} {:<7} {:<9} {:<6} {}",
            marker, index, step.order, step.policy, step.retry_limit, step.name
        );
        if current == Some(index) {
            println!("{}", console::style(line).bold());
        } else {
            println!("{}", line);
        }
    }
    println!();
    println!("{} steps", steps.len());
    println!();
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_reset(_cli: &Cli, project_dir: &Path, force: bool) -> Result<ExitCode> {
    use dialoguer::Confirm;

    let path = config::cursor_file(project_dir);
    if !path.exists() {
        println!("No run in progress.");
        return Ok(ExitCode::SUCCESS);
    }

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will discard the run in progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let store = match FileCursorStore::open_discarding_corrupt(&path) {
        Ok(store) => store,
        Err(e @ StoreError::Locked { .. }) => {
            return Err(e).context("Cannot reset while a run is active");
        }
        Err(e) => return Err(e.into()),
    };
    CursorManager::new(Arc::new(store)).clear()?;

    println!("Reset complete");
    Ok(ExitCode::SUCCESS)
}
