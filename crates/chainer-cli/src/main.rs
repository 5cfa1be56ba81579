use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod completion;
mod config;
mod dispatch;
mod logging;
mod plan_view;
mod render;

use completion::CliCompletionShell;
use config::EngineConfig;
use dispatch::run_cli;
use render::OutputStyle;

#[derive(Parser, Debug)]
#[command(name = "chainer")]
#[command(version)]
#[command(about = "Setup chainer: installs, repairs and removes bundles of packages", long_about = None)]
struct Cli {
    /// Bundle manifest describing registration and packages.
    #[arg(long, global = true, default_value = "bundle.toml")]
    manifest: PathBuf,
    /// Directory holding the bundle's payloads; defaults to the manifest's directory.
    #[arg(long, global = true)]
    source_dir: Option<PathBuf>,
    #[arg(long, global = true, env = "CHAINER_CACHE_ROOT")]
    cache_root: Option<PathBuf>,
    #[arg(long, global = true, env = "CHAINER_REGISTRY_ROOT")]
    registry_root: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `chainer_engine=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report how the previous run ended and the state of every package.
    Detect,
    /// Show what a run of the given action would do.
    Plan {
        #[arg(value_enum, default_value_t = CliAction::Install)]
        action: CliAction,
        #[arg(long)]
        json: bool,
    },
    Install,
    Modify,
    Repair,
    Uninstall,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
    /// Worker entry point started by the driver for per-machine work.
    #[command(hide = true)]
    Elevated {
        #[arg(long)]
        pipe: String,
        #[arg(long)]
        token: String,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CliAction {
    Install,
    Modify,
    Repair,
    Uninstall,
}

fn current_output_style() -> OutputStyle {
    if std::io::stdout().is_terminal() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init_tracing(cli.log_level.as_deref()) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "chainer failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = EngineConfig::resolve(
        &cli.manifest,
        cli.source_dir.as_deref(),
        cli.cache_root.as_deref(),
        cli.registry_root.as_deref(),
        cli.log_level.as_deref(),
    )?;
    run_cli(cli.command, &config, current_output_style())
}

#[cfg(test)]
mod tests;
