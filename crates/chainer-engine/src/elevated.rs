use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use chainer_core::status::{self, E_ABORT, E_FAIL};
use chainer_core::variables::{VARIABLE_BUNDLE_ID, VARIABLE_PRIVILEGED};
use chainer_core::{
    ActionState, BufferReader, BundleAction, BundleManifest, Package, PackageIndex, Packages,
    PayloadIndex, VariableValue, Variables,
};
use chainer_elevation::{open_server, run_message_pump, ElevatedHandler, ExecuteReporter};
use chainer_installer::{default_engines, InstallerContext, PayloadCache, ProcessRunner};
use chainer_plan::{ElevatedPlan, PackageEngines};
use chainer_resume::{ProcessPrivilege, ResumeRegistry};
use tracing::{debug, error, info};

/// Worker side of elevation: owns per-machine registration, caching and
/// execution for the packages the driver's plan hands over.
pub struct ElevatedWorker {
    packages: Packages,
    variables: Variables,
    engines: PackageEngines,
    cache: PayloadCache,
    runner: Rc<dyn ProcessRunner>,
    resume: ResumeRegistry,
    planned: Vec<PackageIndex>,
    action: Option<BundleAction>,
}

impl ElevatedWorker {
    pub fn new(
        manifest: BundleManifest,
        resume: ResumeRegistry,
        installer: InstallerContext,
    ) -> Result<Self> {
        if resume.privilege() != ProcessPrivilege::Elevated {
            return Err(anyhow!("elevated worker requires an elevated resume registry"));
        }
        let mut variables = Variables::new();
        variables.set_built_in(
            VARIABLE_BUNDLE_ID,
            VariableValue::String(manifest.registration.bundle_id.clone()),
        );
        variables.set_built_in(VARIABLE_PRIVILEGED, VariableValue::Numeric(1));

        Ok(Self {
            packages: manifest.packages,
            variables,
            engines: default_engines(&installer),
            cache: installer.cache,
            runner: installer.runner,
            resume,
            planned: Vec::new(),
            action: None,
        })
    }

    pub fn packages(&self) -> &Packages {
        &self.packages
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn is_planned(&self, package: PackageIndex) -> bool {
        self.planned.contains(&package)
    }

    fn planned_package(&self, index: PackageIndex) -> Result<&Package> {
        if !self.is_planned(index) {
            return Err(anyhow!(
                "package {index} is not part of the elevated plan"
            ));
        }
        self.packages.get(index)
    }
}

impl ElevatedHandler for ElevatedWorker {
    fn load_plan(&mut self, plan: &[u8]) -> Result<()> {
        let plan = ElevatedPlan::parse(plan)?;
        self.variables
            .load_bytes(&plan.variables)
            .context("failed loading plan variables")?;

        let mut planned = Vec::with_capacity(plan.packages.len());
        for state in &plan.packages {
            let package = self.packages.get_mut(state.package)?;
            if !package.per_machine {
                return Err(anyhow!(
                    "elevated plan contains per-user package '{}'",
                    package.id
                ));
            }
            let engine = self.engines.get(package.kind)?;
            let mut reader = BufferReader::new(&state.state);
            engine.deserialize_elevated_state(package, &mut reader)?;
            if !reader.is_empty() {
                return Err(anyhow!(
                    "elevated state for package '{}' has {} trailing bytes",
                    package.id,
                    reader.remaining()
                ));
            }
            planned.push(state.package);
        }
        self.planned = planned;
        info!(packages = self.planned.len(), "elevated plan loaded");
        Ok(())
    }

    fn session_begin(&mut self, action: BundleAction, estimated_size: u64) -> Result<()> {
        debug!(action = action.as_str(), estimated_size, "elevated session begin");
        self.action = Some(action);
        self.resume.session_begin(action)
    }

    fn session_suspend(&mut self, _action: BundleAction, reboot: bool) -> Result<()> {
        self.resume.session_suspend(reboot)
    }

    fn session_resume(&mut self, action: BundleAction) -> Result<()> {
        self.action = Some(action);
        self.resume.session_resume()
    }

    fn session_end(&mut self, action: BundleAction, rollback: bool) -> Result<()> {
        self.action = None;
        self.resume.session_end(action, rollback)
    }

    fn save_state(&mut self, state: &[u8]) -> Result<()> {
        self.resume.save_state(state)
    }

    fn cache_payload(&mut self, package: PackageIndex, payload: PayloadIndex) -> Result<()> {
        let package = self.planned_package(package)?;
        let payload = package.payload(payload)?;
        let outcome = self.cache.cache_payload(package, payload, |_, _| {})?;
        debug!(package = %package.id, payload = %payload.id, outcome = outcome.as_str(), "elevated cache");
        Ok(())
    }

    fn execute_package(
        &mut self,
        index: PackageIndex,
        action: ActionState,
        rollback: bool,
        reporter: &mut dyn ExecuteReporter,
    ) -> Result<u32> {
        if self.action.is_none() {
            return Err(anyhow!("cannot execute packages outside a session"));
        }
        let package = self.planned_package(index)?;
        let planned_action = if rollback {
            package.rollback_action
        } else {
            package.execute_action
        };
        if action != planned_action {
            return Err(anyhow!(
                "package '{}' was planned for {planned_action}, not {action}",
                package.id
            ));
        }

        let answer = reporter.progress(index, 0)?;
        if status::failed(answer) {
            return Ok(answer);
        }

        let engine = self.engines.get(package.kind)?;
        match engine.execute(package, action, &self.variables, rollback) {
            Ok(outcome) => {
                reporter.progress(index, 100)?;
                Ok(outcome.status_code())
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(package = %package.id, error = %message, "elevated package failed");
                let answer = reporter.error(E_FAIL, &message)?;
                Ok(if answer == E_ABORT { E_ABORT } else { E_FAIL })
            }
        }
    }

    fn launch_embedded_child(&mut self, program: &str, arguments: &[String]) -> Result<u32> {
        let exit_code = self.runner.run(Path::new(program), arguments)?;
        Ok(status::from_exit_code(exit_code))
    }
}

/// Connects to the driver's endpoint and serves requests until told to stop.
pub fn serve_elevated(pipe_name: &str, token: &str, worker: &mut ElevatedWorker) -> Result<()> {
    let mut channel = open_server(pipe_name, token)
        .with_context(|| format!("failed connecting to driver endpoint '{pipe_name}'"))?;
    info!(endpoint = pipe_name, "elevated worker connected");
    run_message_pump(&mut channel, worker).context("elevated message pump failed")?;
    Ok(())
}
