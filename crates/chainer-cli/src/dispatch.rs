use std::path::PathBuf;
use std::process::{Command, ExitCode, Stdio};

use anyhow::{Context, Result};
use chainer_core::{status, BundleAction};
use chainer_elevation::{ChildLauncher, ChildProcess};
use chainer_engine::{serve_elevated, ApplyResult, ElevatedWorker, Engine, RestartState};
use chainer_resume::ProcessPrivilege;
use tracing::{debug, info};

use crate::completion::write_completions_script;
use crate::config::EngineConfig;
use crate::plan_view::PlanView;
use crate::render::{
    format_detect_lines, format_plan_lines, OutputStyle, TerminalObserver, TerminalRenderer,
};
use crate::{CliAction, Commands};

pub(crate) const EXIT_FAILED: u8 = 1;
pub(crate) const EXIT_USER_CANCELLED: u8 = 2;
pub(crate) const EXIT_RESTART_REQUIRED: u8 = 3;
pub(crate) const EXIT_RESTART_INITIATED: u8 = 4;

pub(crate) fn run_cli(command: Commands, config: &EngineConfig, style: OutputStyle) -> Result<ExitCode> {
    let renderer = TerminalRenderer::from_style(style);

    match command {
        Commands::Detect => {
            let mut engine = driver_engine(config)?;
            let mut observer = TerminalObserver::new(style);
            let resume = engine.detect(&mut observer)?;
            renderer.print_lines(&format_detect_lines(resume, engine.packages()));
        }
        Commands::Plan { action, json } => {
            let mut engine = driver_engine(config)?;
            let mut observer = TerminalObserver::new(style);
            engine.detect(&mut observer)?;
            engine.plan(bundle_action(action), &mut observer)?;
            if json {
                let view = PlanView::build(engine.current_plan(), engine.packages())?;
                println!("{}", view.to_json()?);
            } else {
                renderer.print_lines(&format_plan_lines(
                    engine.current_plan(),
                    engine.packages(),
                ));
            }
        }
        Commands::Install => return run_action(config, BundleAction::Install, style),
        Commands::Modify => return run_action(config, BundleAction::Modify, style),
        Commands::Repair => return run_action(config, BundleAction::Repair, style),
        Commands::Uninstall => return run_action(config, BundleAction::Uninstall, style),
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            write_completions_script(shell, &mut stdout)?;
        }
        Commands::Elevated { pipe, token } => {
            run_elevated_worker(config, &pipe, &token)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

pub(crate) fn bundle_action(action: CliAction) -> BundleAction {
    match action {
        CliAction::Install => BundleAction::Install,
        CliAction::Modify => BundleAction::Modify,
        CliAction::Repair => BundleAction::Repair,
        CliAction::Uninstall => BundleAction::Uninstall,
    }
}

/// Process exit code for a finished apply: 0 on success, then failure,
/// user cancel and the two restart outcomes.
pub(crate) fn exit_code_for(result: &ApplyResult) -> u8 {
    if !result.succeeded() {
        if result.status == status::E_INSTALLUSEREXIT {
            return EXIT_USER_CANCELLED;
        }
        return EXIT_FAILED;
    }
    match result.restart {
        RestartState::None => 0,
        RestartState::Required => EXIT_RESTART_REQUIRED,
        RestartState::Initiated => EXIT_RESTART_INITIATED,
    }
}

fn run_action(config: &EngineConfig, action: BundleAction, style: OutputStyle) -> Result<ExitCode> {
    let mut engine = driver_engine(config)?;
    let mut observer = TerminalObserver::new(style);

    engine.detect(&mut observer)?;
    let plan = engine.plan(action, &mut observer)?;
    info!(
        action = action.as_str(),
        execute = plan.execute_count(),
        cache = plan.cache_count(),
        "plan ready"
    );
    let result = engine.apply(&mut observer)?;
    Ok(ExitCode::from(exit_code_for(&result)))
}

fn driver_engine(config: &EngineConfig) -> Result<Engine> {
    let manifest = config.load_manifest()?;
    let privilege = if process_is_elevated() {
        ProcessPrivilege::Elevated
    } else {
        ProcessPrivilege::User
    };
    let executable = std::env::current_exe().context("failed resolving current executable")?;
    let resume = config
        .resume_registry(manifest.registration.clone(), privilege)?
        .with_source(Some(executable.clone()), Some(config.source_dir.clone()));
    let installer = config.installer_context(&manifest.registration);
    debug!(
        bundle = %manifest.registration.bundle_id,
        elevated = privilege == ProcessPrivilege::Elevated,
        "driver starting"
    );

    let launcher = ProcessLauncher {
        executable,
        config: config.clone(),
    };
    Ok(Engine::new(manifest, resume, installer)?.with_launcher(Box::new(launcher)))
}

fn run_elevated_worker(config: &EngineConfig, pipe: &str, token: &str) -> Result<()> {
    let manifest = config.load_manifest()?;
    let executable = std::env::current_exe().context("failed resolving current executable")?;
    let resume = config
        .resume_registry(manifest.registration.clone(), ProcessPrivilege::Elevated)?
        .with_source(Some(executable), Some(config.source_dir.clone()));
    let installer = config.installer_context(&manifest.registration);
    let mut worker = ElevatedWorker::new(manifest, resume, installer)?;
    serve_elevated(pipe, token, &mut worker)?;
    info!("elevated worker finished");
    Ok(())
}

/// Starts the worker by re-running this executable with the `elevated`
/// command. Raising the privilege level is left to the platform (e.g. the
/// executable's manifest or a wrapping `sudo`).
struct ProcessLauncher {
    executable: PathBuf,
    config: EngineConfig,
}

impl ChildLauncher for ProcessLauncher {
    fn launch(&mut self, pipe_name: &str, token: &str) -> Result<Box<dyn ChildProcess>> {
        let child = Command::new(&self.executable)
            .args(self.config.worker_arguments(pipe_name, token))
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| {
                format!(
                    "failed launching elevated worker {}",
                    self.executable.display()
                )
            })?;
        debug!(pid = child.id(), "elevated worker launched");
        Ok(Box::new(child))
    }
}

#[cfg(unix)]
fn process_is_elevated() -> bool {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata("/proc/self")
        .map(|meta| meta.uid() == 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn process_is_elevated() -> bool {
    false
}
