//! sandpatch CLI - one-shot dispatch of planner decisions.
//!
//! ```text
//! main() -> load config -> init tracing -> AgentRun::with_builtins() -> dispatch()
//! ```
//!
//! Results and error reports go to stdout as JSON; logs go to stderr.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandpatch_config::{CONFIG_ENV_VAR, SandpatchConfig};
use sandpatch_tools::fingerprint::fingerprint_file;
use sandpatch_tools::{AgentRun, Decision, PathSandbox, ToolError, ToolSettings};
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Run planner decisions through sandboxed file tools
#[derive(Parser, Debug)]
#[command(name = "sandpatch", version)]
struct Cli {
    /// Config file (default: ~/.sandpatch/config.toml)
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Directory holding the sandbox directory (overrides `[sandbox] base_dir`)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one decision, e.g. '{"action":"read_file","params":{"path":"a.rb"}}'. Use '-' for stdin.
    Exec { decision: String },
    /// Print the sha256 fingerprint of a sandboxed file
    Fingerprint { path: String },
    /// Print the registered tool definitions
    Tools,
}

fn init_tracing(config_filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries JSON results only.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(explicit: Option<&PathBuf>) -> Result<SandpatchConfig> {
    let loaded = match explicit {
        Some(path) => SandpatchConfig::load_from(path)?,
        None => SandpatchConfig::load()?,
    };
    Ok(loaded.unwrap_or_default())
}

fn settings(config: &SandpatchConfig, root: Option<PathBuf>) -> Result<ToolSettings> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let mut settings = config.to_tool_settings(&cwd);
    if let Some(root) = root {
        settings.sandbox.base_dir = cwd.join(root);
    }
    Ok(settings)
}

fn read_decision(arg: &str) -> Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .context("failed to read decision from stdin")?;
    Ok(buf)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a tool failure as a machine-readable report.
fn report_failure(err: &ToolError) -> Result<ExitCode> {
    tracing::warn!(error = err.kind(), "{err}");
    print_json(&serde_json::to_value(err.report())?)?;
    Ok(ExitCode::FAILURE)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(config.logging_filter());
    let settings = settings(&config, cli.root)?;

    match cli.command {
        Command::Exec { decision } => {
            let raw = read_decision(&decision)?;
            let decision = match Decision::from_json(&raw) {
                Ok(decision) => decision,
                Err(err) => return report_failure(&err),
            };
            let mut run = AgentRun::with_builtins(settings)?;
            match run.dispatch(&decision).await {
                Ok(result) => {
                    print_json(&result)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => report_failure(&err),
            }
        }
        Command::Fingerprint { path } => {
            let sandbox = PathSandbox::new(settings.sandbox)?;
            let outcome = sandbox
                .resolve(&path)
                .and_then(|resolved| fingerprint_file(&resolved));
            match outcome {
                Ok(fingerprint) => {
                    println!("{fingerprint}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => report_failure(&err),
            }
        }
        Command::Tools => {
            let run = AgentRun::with_builtins(settings)?;
            print_json(&serde_json::to_value(run.registry().definitions())?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
