use std::collections::HashSet;
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chainer_core::status::{self, E_ABORT, E_FAIL, E_INSTALLUSEREXIT, S_OK};
use chainer_core::variables::{VARIABLE_BUNDLE_ACTION, VARIABLE_BUNDLE_ID, VARIABLE_PRIVILEGED};
use chainer_core::{
    ActionState, BundleAction, BundleManifest, Package, PackageIndex, Packages, Registration,
    VariableValue, Variables,
};
use chainer_elevation::{
    ChildLauncher, ElevationSession, ExecuteNotice, DEFAULT_CONNECT_TIMEOUT,
};
use chainer_installer::{default_engines, InstallerContext, PayloadCache};
use chainer_plan::{
    plan_packages, ExecutePlanEntry, PackageEngines, PackageOutcome, Plan, PlanContext,
};
use chainer_resume::{ProcessPrivilege, ResumeRegistry, ResumeType};
use tracing::{debug, info, warn};

use crate::observer::{ApplyResult, EngineObserver, ErrorResponse, RestartState};

/// Endpoint name prefix for the elevated worker.
pub const ELEVATION_PIPE_PREFIX: &str = "chainer-elevated";

/// Drives one bundle run: detect, plan, then apply (register, cache,
/// execute, roll back on failure, unregister). Per-machine work is forwarded
/// to an elevated worker unless this process is already privileged.
pub struct Engine {
    registration: Registration,
    packages: Packages,
    variables: Variables,
    engines: PackageEngines,
    cache: PayloadCache,
    resume: ResumeRegistry,
    privileged: bool,
    launcher: Option<Box<dyn ChildLauncher>>,
    connect_timeout: Duration,
    resume_type: ResumeType,
    plan: Plan,
}

impl Engine {
    pub fn new(
        manifest: BundleManifest,
        resume: ResumeRegistry,
        installer: InstallerContext,
    ) -> Result<Self> {
        if manifest.registration.bundle_id != resume.registration().bundle_id {
            return Err(anyhow!(
                "resume registry belongs to bundle '{}', not '{}'",
                resume.registration().bundle_id,
                manifest.registration.bundle_id
            ));
        }
        let privileged = resume.privilege() == ProcessPrivilege::Elevated;
        let mut variables = Variables::new();
        variables.set_built_in(
            VARIABLE_BUNDLE_ID,
            VariableValue::String(manifest.registration.bundle_id.clone()),
        );
        variables.set_built_in(VARIABLE_PRIVILEGED, VariableValue::Numeric(i64::from(privileged)));

        Ok(Self {
            registration: manifest.registration,
            packages: manifest.packages,
            variables,
            engines: default_engines(&installer),
            cache: installer.cache,
            resume,
            privileged,
            launcher: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            resume_type: ResumeType::None,
            plan: Plan::new(),
        })
    }

    /// How the elevated worker is started when a plan needs one.
    pub fn with_launcher(mut self, launcher: Box<dyn ChildLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_engines(mut self, engines: PackageEngines) -> Self {
        self.engines = engines;
        self
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn packages(&self) -> &Packages {
        &self.packages
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    pub fn resume_type(&self) -> ResumeType {
        self.resume_type
    }

    pub fn current_plan(&self) -> &Plan {
        &self.plan
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Determines how the previous run ended, restores its variables when it
    /// left state behind, and detects every package.
    pub fn detect(&mut self, observer: &mut dyn EngineObserver) -> Result<ResumeType> {
        observer.on_detect_begin(self.packages.len());

        self.resume_type = self.resume.detect_resume_type()?;
        if self.resume_type.has_saved_state() {
            match self.resume.load_state()? {
                Some(bytes) => {
                    self.variables
                        .load_bytes(&bytes)
                        .context("failed restoring variables from resume state")?;
                    info!(
                        resume = self.resume_type.as_str(),
                        variables = self.variables.len(),
                        "restored variables from previous run"
                    );
                }
                None => debug!(resume = self.resume_type.as_str(), "no resume state saved"),
            }
        }

        for package in self.packages.iter_mut() {
            package.reset_run_state();
            let engine = self.engines.get(package.kind)?;
            let detection = engine
                .detect(package, &self.variables)
                .with_context(|| format!("failed to detect package '{}'", package.id))?;
            package.current_state = detection.state;
            package.installed_version = detection.installed_version;
            package.cached = self.cache.is_cached(package)?;
            debug!(
                package = %package.id,
                state = ?package.current_state,
                cached = package.cached,
                "detected package"
            );
            observer.on_detect_package_complete(package);
        }

        observer.on_detect_complete(self.resume_type);
        Ok(self.resume_type)
    }

    /// Builds the plan for `action`. Packages must have been detected.
    pub fn plan(&mut self, action: BundleAction, observer: &mut dyn EngineObserver) -> Result<&Plan> {
        observer.on_plan_begin(action);
        self.variables.set_built_in(
            VARIABLE_BUNDLE_ACTION,
            VariableValue::Numeric(i64::from(action.as_u32())),
        );
        let context = PlanContext {
            action,
            variables: &self.variables,
            registration: Some(&self.registration),
            engines: &self.engines,
            privileged: self.privileged,
        };
        plan_packages(&mut self.packages, &context, &mut self.plan)?;
        observer.on_plan_complete(&self.plan);
        Ok(&self.plan)
    }

    fn needs_elevation(&self) -> bool {
        if self.privileged {
            return false;
        }
        self.plan.requires_elevation()
            || (self.registration.per_machine && self.plan.execute_count() > 0)
    }

    /// Runs the ready plan to completion.
    pub fn apply(&mut self, observer: &mut dyn EngineObserver) -> Result<ApplyResult> {
        if !self.plan.is_ready() {
            return Err(anyhow!("apply requires a ready plan"));
        }
        observer.on_apply_begin(&self.plan);

        let mut elevation = None;
        if self.needs_elevation() {
            let timeout = self.connect_timeout;
            let launcher = self.launcher.as_deref_mut().ok_or_else(|| {
                anyhow!("plan requires elevation but no elevated launcher is configured")
            })?;
            let mut session = ElevationSession::launch(launcher, ELEVATION_PIPE_PREFIX, timeout)?;
            if let Err(err) = check(session.load_plan(self.plan.elevated_plan())?, "load elevated plan") {
                let _ = session.terminate();
                return Err(err);
            }
            elevation = Some(session);
        }

        let result = self.run_session(&mut elevation, observer);
        if let Some(mut session) = elevation {
            if let Err(err) = session.terminate() {
                warn!(error = %format!("{err:#}"), "failed stopping elevated worker");
            }
        }
        let result = result?;

        info!(
            status = %status::describe(result.status),
            restart = result.restart.as_str(),
            rolled_back = result.rolled_back,
            "apply complete"
        );
        observer.on_apply_complete(&result);
        Ok(result)
    }

    fn run_session<S: Read + Write>(
        &self,
        elevation: &mut Option<ElevationSession<S>>,
        observer: &mut dyn EngineObserver,
    ) -> Result<ApplyResult> {
        let action = self.plan.action();
        let resuming = self.resumes_session();

        if resuming {
            self.resume
                .session_resume()
                .context("failed to resume registration session")?;
        } else {
            self.resume
                .session_begin(action)
                .context("failed to begin registration session")?;
        }

        let mut executed = Vec::new();
        let (failure, restart) =
            match self.run_phases(resuming, elevation, observer, &mut executed) {
                Ok(phases) => phases,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "apply interrupted; rolling back");
                    self.abandon_session(&executed, elevation, observer);
                    return Err(err.context("apply interrupted and was rolled back"));
                }
            };

        if restart == RestartState::Initiated {
            info!("package initiated a restart; suspending session");
            self.resume
                .session_suspend(true)
                .context("failed to suspend registration session")?;
            if let Some(session) = elevation.as_mut() {
                check(session.session_suspend(action, true)?, "elevated session suspend")?;
            }
            return Ok(ApplyResult {
                status: S_OK,
                restart,
                rolled_back: false,
            });
        }

        let rolled_back = failure.is_some();
        if rolled_back {
            self.rollback(&executed, elevation, observer);
        }

        self.resume
            .session_end(action, rolled_back)
            .context("failed to end registration session")?;
        if let Some(session) = elevation.as_mut() {
            check(session.session_end(action, rolled_back)?, "elevated session end")?;
        }

        Ok(ApplyResult {
            status: failure.unwrap_or(S_OK),
            restart,
            rolled_back,
        })
    }

    /// A run interrupted by a suspend or a reboot picks up its session
    /// instead of registering again.
    fn resumes_session(&self) -> bool {
        matches!(self.resume_type, ResumeType::Suspend | ResumeType::Reboot)
    }

    /// Opens the worker's session, saves state, caches and executes. Returns
    /// the failure status and restart state; `executed` collects every entry
    /// that ran so an error can still roll it back.
    fn run_phases<S: Read + Write>(
        &self,
        resuming: bool,
        elevation: &mut Option<ElevationSession<S>>,
        observer: &mut dyn EngineObserver,
        executed: &mut Vec<ExecutePlanEntry>,
    ) -> Result<(Option<u32>, RestartState)> {
        let action = self.plan.action();
        if let Some(session) = elevation.as_mut() {
            if resuming {
                check(session.session_resume(action)?, "elevated session resume")?;
            } else {
                check(
                    session.session_begin(action, self.plan.estimated_size())?,
                    "elevated session begin",
                )?;
            }
        }
        self.save_state(elevation)?;

        let mut skipped = HashSet::new();
        let mut failure = self.cache_payloads(elevation, observer, &mut skipped)?;

        let mut restart = RestartState::None;
        if failure.is_some() {
            return Ok((failure, restart));
        }
        for entry in self.plan.execute_entries() {
            if skipped.contains(&entry.package) {
                warn!(package = %entry.package, "skipping package whose payloads failed to cache");
                continue;
            }
            let package = self.packages.get(entry.package)?;
            observer.on_execute_package_begin(package, entry.action, false);
            let (outcome, answered) =
                self.execute_entry(entry, entry.action, false, elevation, observer)?;
            observer.on_execute_package_complete(package, outcome, false);
            executed.push(*entry);

            match outcome {
                PackageOutcome::Success => {}
                PackageOutcome::ScheduleReboot => {
                    restart = restart.max(RestartState::Required);
                }
                PackageOutcome::ForceReboot => {
                    restart = RestartState::Initiated;
                    break;
                }
                PackageOutcome::Failed(code) => {
                    let response = answered.unwrap_or_else(|| {
                        observer.on_error(
                            package,
                            code,
                            &format!("package '{}' failed: {}", package.id, status::describe(code)),
                        )
                    });
                    failure = failure_status(package, code, response);
                    if failure.is_some() {
                        break;
                    }
                }
            }
        }
        Ok((failure, restart))
    }

    /// Cleanup after an error left the run half applied: roll back what ran
    /// and close the registration as rolled back. Errors here are logged so
    /// the original error is the one reported.
    fn abandon_session<S: Read + Write>(
        &self,
        executed: &[ExecutePlanEntry],
        elevation: &mut Option<ElevationSession<S>>,
        observer: &mut dyn EngineObserver,
    ) {
        let action = self.plan.action();
        self.rollback(executed, elevation, observer);
        if let Some(session) = elevation.as_mut() {
            match session.session_end(action, true) {
                Ok(code) if status::failed(code) => {
                    warn!(status = %status::describe(code), "elevated session end failed");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed ending elevated session");
                }
            }
        }
        if let Err(err) = self.resume.session_end(action, true) {
            warn!(error = %format!("{err:#}"), "failed ending registration session");
        }
    }

    /// Per-machine state lives where only the worker can write.
    fn save_state<S: Read + Write>(&self, elevation: &mut Option<ElevationSession<S>>) -> Result<()> {
        let state = self.variables.to_bytes();
        if !self.registration.per_machine || self.privileged {
            return self.resume.save_state(&state);
        }
        match elevation.as_mut() {
            Some(session) => check(session.save_state(&state)?, "elevated save state"),
            None => {
                debug!("no elevated worker; per-machine resume state not saved");
                Ok(())
            }
        }
    }

    fn cache_payloads<S: Read + Write>(
        &self,
        elevation: &mut Option<ElevationSession<S>>,
        observer: &mut dyn EngineObserver,
        skipped: &mut HashSet<PackageIndex>,
    ) -> Result<Option<u32>> {
        for entry in self.plan.cache_entries() {
            if skipped.contains(&entry.package) {
                continue;
            }
            let package = self.packages.get(entry.package)?;
            let payload = package.payload(entry.payload)?;
            observer.on_cache_payload_begin(package, payload);

            let code = if package.per_machine && !self.privileged {
                let session = elevation.as_mut().ok_or_else(|| {
                    anyhow!("package '{}' must be cached by the elevated worker", package.id)
                })?;
                match session.cache_payload(entry.package, entry.payload) {
                    Ok(code) => code,
                    Err(err) => {
                        return Err(worker_lost(elevation, observer, package, err))
                            .with_context(|| format!("failed to cache payload '{}'", payload.id));
                    }
                }
            } else {
                match self.cache.cache_payload(package, payload, |done, total| {
                    observer.on_cache_progress(package, payload, done, total)
                }) {
                    Ok(outcome) => {
                        debug!(payload = %payload.id, outcome = outcome.as_str(), "payload ready");
                        S_OK
                    }
                    Err(err) => {
                        warn!(payload = %payload.id, error = %format!("{err:#}"), "caching failed");
                        E_FAIL
                    }
                }
            };
            observer.on_cache_payload_complete(package, payload, code);

            if status::failed(code) {
                let response = observer.on_error(
                    package,
                    code,
                    &format!("failed to cache payload '{}' of package '{}'", payload.id, package.id),
                );
                if let Some(failure) = failure_status(package, code, response) {
                    return Ok(Some(failure));
                }
                skipped.insert(entry.package);
            }
        }
        Ok(None)
    }

    /// Runs one execute entry locally or through the worker. The second value
    /// is the observer's answer when it was already asked about a failure.
    fn execute_entry<S: Read + Write>(
        &self,
        entry: &ExecutePlanEntry,
        action: ActionState,
        rollback: bool,
        elevation: &mut Option<ElevationSession<S>>,
        observer: &mut dyn EngineObserver,
    ) -> Result<(PackageOutcome, Option<ErrorResponse>)> {
        let package = self.packages.get(entry.package)?;
        if entry.owned {
            let engine = self.engines.get(package.kind)?;
            return Ok(match engine.execute(package, action, &self.variables, rollback) {
                Ok(outcome) => (outcome, None),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(package = %package.id, error = %message, "package engine failed");
                    let response = observer.on_error(package, E_FAIL, &message);
                    (PackageOutcome::Failed(E_FAIL), Some(response))
                }
            });
        }

        let session = elevation.as_mut().ok_or_else(|| {
            anyhow!(
                "package '{}' must be executed by the elevated worker",
                package.id
            )
        })?;
        let mut answered = None;
        let sent = session.execute_package(entry.package, action, rollback, |notice| match notice {
            ExecuteNotice::Progress { percent, .. } => {
                observer.on_execute_progress(package, percent);
                S_OK
            }
            ExecuteNotice::Error { code, message } => {
                let response = observer.on_error(package, code, &message);
                answered = Some(response);
                match response {
                    ErrorResponse::Continue => S_OK,
                    ErrorResponse::Cancel => E_ABORT,
                }
            }
        });
        match sent {
            Ok(code) => Ok((PackageOutcome::from_status_code(code), answered)),
            Err(err) => Err(worker_lost(elevation, observer, package, err))
                .with_context(|| format!("failed to execute package '{}'", package.id)),
        }
    }

    fn rollback<S: Read + Write>(
        &self,
        executed: &[ExecutePlanEntry],
        elevation: &mut Option<ElevationSession<S>>,
        observer: &mut dyn EngineObserver,
    ) {
        warn!(packages = executed.len(), "rolling back");
        for entry in executed.iter().rev() {
            if entry.rollback_action == ActionState::None {
                continue;
            }
            if !entry.owned && elevation.is_none() {
                warn!(
                    package = %entry.package,
                    "elevated worker is gone; per-machine package not rolled back"
                );
                continue;
            }
            if let Err(err) = self.rollback_entry(entry, elevation, observer) {
                warn!(
                    package = %entry.package,
                    error = %format!("{err:#}"),
                    "rollback of package failed"
                );
            }
        }
    }

    fn rollback_entry<S: Read + Write>(
        &self,
        entry: &ExecutePlanEntry,
        elevation: &mut Option<ElevationSession<S>>,
        observer: &mut dyn EngineObserver,
    ) -> Result<()> {
        let package = self.packages.get(entry.package)?;
        observer.on_execute_package_begin(package, entry.rollback_action, true);
        let (outcome, _) =
            self.execute_entry(entry, entry.rollback_action, true, elevation, observer)?;
        if outcome.is_failure() {
            warn!(
                package = %package.id,
                status = %status::describe(outcome.status_code()),
                "rollback of package failed"
            );
        }
        observer.on_execute_package_complete(package, outcome, true);
        Ok(())
    }
}

/// A request to the worker failed below the message level, so the channel
/// can no longer be trusted. Reports the failure against `package`, stops
/// the worker and hands the error back.
fn worker_lost<S: Read + Write>(
    elevation: &mut Option<ElevationSession<S>>,
    observer: &mut dyn EngineObserver,
    package: &Package,
    err: anyhow::Error,
) -> anyhow::Error {
    let message = format!("elevated worker failed: {err:#}");
    warn!(package = %package.id, error = %message, "lost elevated worker");
    observer.on_error(package, E_FAIL, &message);
    if let Some(mut session) = elevation.take() {
        if let Err(stop) = session.terminate() {
            warn!(error = %format!("{stop:#}"), "failed stopping elevated worker");
        }
    }
    err
}

/// The run's failure status, or `None` when a non-vital failure may be
/// skipped.
fn failure_status(package: &Package, code: u32, response: ErrorResponse) -> Option<u32> {
    match response {
        ErrorResponse::Cancel => Some(E_INSTALLUSEREXIT),
        ErrorResponse::Continue if package.vital => Some(code),
        ErrorResponse::Continue => {
            warn!(package = %package.id, "continuing past failure of non-vital package");
            None
        }
    }
}

fn check(code: u32, operation: &str) -> Result<()> {
    if status::failed(code) {
        Err(anyhow!("{operation} failed: {}", status::describe(code)))
    } else {
        Ok(())
    }
}
