// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod task;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::loader::{load_from_path, LoadOptions};
use crate::engine::Builder;
use crate::exec::ProcManager;
use crate::task::{RegistryCredential, StepKind, Task};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - task loading (alias preprocessing, parsing, validation)
/// - the process manager and builder
/// - Ctrl-C handling
/// - execution, cleanup, and the final result
pub async fn run(args: CliArgs) -> Result<()> {
    let opts = LoadOptions {
        registry: args.registry.clone(),
        credentials: parse_credentials(&args.credentials)?,
        default_timeout: args.step_timeout,
        default_working_directory: args.working_directory.clone(),
    };
    let task = Arc::new(load_from_path(&args.file, &opts)?);

    if args.dry_run {
        print_dry_run(&task);
        return Ok(());
    }

    let proc_manager = Arc::new(ProcManager::new());
    let builder = Arc::new(Builder::new(
        Arc::clone(&proc_manager),
        &args.engine,
        &args.workspace_dir,
    ));

    // Ctrl-C → cancel the whole run.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("interrupt received, cancelling run");
            cancel.cancel();
        });
    }

    let result = Arc::clone(&builder).run_task(&cancel, &task).await;

    // Cleanup runs on its own token so a cancelled run still gets swept.
    let cleanup_cancel = CancellationToken::new();
    builder.clean_task(&cleanup_cancel, &task).await;

    result.map_err(|err| anyhow!(err))
}

/// Parse repeatable `registry;username;password` credential arguments.
fn parse_credentials(raw: &[String]) -> Result<Vec<RegistryCredential>> {
    raw.iter()
        .map(|entry| {
            let mut parts = entry.splitn(3, ';');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(registry), Some(username), Some(password))
                    if !registry.is_empty() && !username.is_empty() =>
                {
                    Ok(RegistryCredential {
                        registry: registry.to_string(),
                        username: username.to_string(),
                        password: password.to_string(),
                    })
                }
                _ => Err(anyhow!(
                    "invalid credential '{entry}' (expected registry;username;password)"
                )),
            }
        })
        .collect()
}

/// Simple dry-run output: print steps, kinds, dependencies, and resources.
fn print_dry_run(task: &Task) {
    println!("stevedore dry-run");
    println!("  stepTimeout = {}", task.step_timeout);
    if !task.working_directory.is_empty() {
        println!("  workingDirectory = {}", task.working_directory);
    }
    println!();

    println!("steps ({}):", task.steps.len());
    for step in &task.steps {
        println!("  - {}", step.id);
        match &step.kind {
            StepKind::Build(build) => println!("      build: {build}"),
            StepKind::Push(images) => println!("      push: {images:?}"),
            StepKind::Cmd(cmd) => println!("      cmd: {cmd}"),
        }
        if !step.when.is_empty() {
            println!("      when: {:?}", step.when);
        }
        if step.timeout > 0 {
            println!("      timeout: {}", step.timeout);
        }
        if step.retries > 0 {
            println!("      retries: {}", step.retries);
        }
        if step.ignore_errors {
            println!("      ignoreErrors: true");
        }
        if step.detach {
            println!("      detach: true");
        }
    }

    if !task.networks.is_empty() {
        println!("networks ({}):", task.networks.len());
        for network in &task.networks {
            println!("  - {}", network.name);
        }
    }
    if !task.volumes.is_empty() {
        println!("volumes ({}):", task.volumes.len());
        for volume in &task.volumes {
            println!("  - {}", volume.name);
        }
    }

    debug!("dry-run complete (no execution)");
}
