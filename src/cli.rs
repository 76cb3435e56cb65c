// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `stevedore`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stevedore",
    version,
    about = "Run a DAG of container image build, push, and command steps.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the task file (YAML).
    #[arg(short = 'f', long, value_name = "PATH", default_value = "stevedore.yaml")]
    pub file: String,

    /// Registry prefixed onto build tags and push targets.
    #[arg(long, value_name = "HOST", default_value = "")]
    pub registry: String,

    /// Resolved registry credential, repeatable.
    ///
    /// Format: `registry;username;password`.
    #[arg(long = "credential", value_name = "REGISTRY;USERNAME;PASSWORD")]
    pub credentials: Vec<String>,

    /// Default timeout in seconds for steps that declare none.
    #[arg(long, value_name = "SECONDS")]
    pub step_timeout: Option<u64>,

    /// Default working directory for steps that declare none.
    #[arg(long, value_name = "DIR", default_value = "")]
    pub working_directory: String,

    /// Host directory mounted into step containers as the workspace.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub workspace_dir: String,

    /// Container engine binary to drive.
    #[arg(long, value_name = "BIN", default_value = "docker")]
    pub engine: String,

    /// Parse and validate, print the task, but don't execute any steps.
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STEVEDORE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
