use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Result};
use chainer_core::{
    ActionState, CurrentState, ExitCodeBehavior, ExitCodeRule, Package, PackageKind, Variables,
};
use chainer_plan::{Detection, PackageEngine, PackageOutcome};
use tracing::{info, warn};

use crate::cache::PayloadCache;
use crate::receipts::{ProductReceipt, ProductStore};
use crate::runner::{split_arguments, ProcessRunner};

/// Native installer reboot codes: success with a reboot scheduled, and a
/// reboot the installer already started.
pub const EXIT_SUCCESS_REBOOT_REQUIRED: u32 = 3010;
pub const EXIT_SUCCESS_REBOOT_INITIATED: u32 = 1641;

/// Locations of the system tools native packages are handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTools {
    pub msiexec: PathBuf,
    pub wusa: PathBuf,
}

impl Default for NativeTools {
    fn default() -> Self {
        Self {
            msiexec: PathBuf::from("msiexec"),
            wusa: PathBuf::from("wusa"),
        }
    }
}

/// Receipt-keyed detection plus the run-classify-record step shared by both
/// native kinds.
struct NativeInstaller {
    kind: PackageKind,
    cache: PayloadCache,
    runner: Rc<dyn ProcessRunner>,
    products: Rc<dyn ProductStore>,
}

impl NativeInstaller {
    fn product_code<'a>(&self, package: &'a Package) -> Result<&'a str> {
        package
            .product_code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "{} package '{}' declares no product code",
                    self.kind.as_str(),
                    package.id
                )
            })
    }

    fn detect(&self, package: &Package) -> Result<Detection> {
        let code = self.product_code(package)?;
        Ok(match self.products.read(package.per_machine, code)? {
            Some(receipt) => Detection {
                state: CurrentState::Present,
                installed_version: receipt.version,
            },
            None => Detection::absent(),
        })
    }

    fn cached_payload(&self, package: &Package) -> Result<PathBuf> {
        let path = self.cache.primary_payload_path(package)?;
        if !path.is_file() {
            return Err(anyhow!(
                "payload for package '{}' is not cached at {}",
                package.id,
                path.display()
            ));
        }
        Ok(path)
    }

    fn run(
        &self,
        package: &Package,
        action: ActionState,
        rollback: bool,
        program: &Path,
        arguments: &[String],
    ) -> Result<PackageOutcome> {
        let code = self.product_code(package)?;
        info!(
            package = %package.id,
            kind = self.kind.as_str(),
            action = action.as_str(),
            rollback,
            "executing package"
        );
        let exit_code = self.runner.run(program, arguments)?;
        let outcome = PackageOutcome::from_exit_code(&exit_code_rules(package), exit_code);
        if outcome.is_failure() {
            warn!(package = %package.id, exit_code, "package execution failed");
            return Ok(outcome);
        }

        if action == ActionState::Uninstall {
            self.products.remove(package.per_machine, code)?;
        } else if action.is_install_class() {
            self.products.write(
                package.per_machine,
                &ProductReceipt::new(code, package.id.clone(), self.kind, package.version.clone()),
            )?;
        }
        Ok(outcome)
    }
}

/// Declared rules first, then the well-known reboot codes.
fn exit_code_rules(package: &Package) -> Vec<ExitCodeRule> {
    let mut rules = package.commands.exit_codes.clone();
    rules.push(ExitCodeRule::exact(
        EXIT_SUCCESS_REBOOT_REQUIRED,
        ExitCodeBehavior::ScheduleReboot,
    ));
    rules.push(ExitCodeRule::exact(
        EXIT_SUCCESS_REBOOT_INITIATED,
        ExitCodeBehavior::ForceReboot,
    ));
    rules
}

fn extra_arguments(raw: Option<&str>) -> Result<Vec<String>> {
    raw.map(split_arguments)
        .transpose()
        .map(Option::unwrap_or_default)
}

pub struct MsiEngine {
    inner: NativeInstaller,
    msiexec: PathBuf,
}

impl MsiEngine {
    pub fn new(
        cache: PayloadCache,
        runner: Rc<dyn ProcessRunner>,
        products: Rc<dyn ProductStore>,
        tools: &NativeTools,
    ) -> Self {
        Self {
            inner: NativeInstaller {
                kind: PackageKind::Msi,
                cache,
                runner,
                products,
            },
            msiexec: tools.msiexec.clone(),
        }
    }

    fn arguments_for(&self, package: &Package, action: ActionState) -> Result<Vec<String>> {
        let commands = &package.commands;
        let mut arguments = Vec::new();
        match action {
            ActionState::Uninstall => {
                arguments.push("/x".to_string());
                arguments.push(self.inner.product_code(package)?.to_string());
                arguments.extend(extra_arguments(commands.uninstall_arguments.as_deref())?);
            }
            ActionState::AdminInstall => {
                arguments.push("/a".to_string());
                arguments.push(path_argument(&self.inner.cached_payload(package)?));
                arguments.extend(extra_arguments(commands.install_arguments.as_deref())?);
            }
            ActionState::Maintenance | ActionState::Recache | ActionState::MinorUpgrade => {
                arguments.push("/i".to_string());
                arguments.push(path_argument(&self.inner.cached_payload(package)?));
                arguments.push("REINSTALL=ALL".to_string());
                if action == ActionState::MinorUpgrade {
                    arguments.push("REINSTALLMODE=vomus".to_string());
                }
                let extra = commands
                    .repair_arguments
                    .as_deref()
                    .or(commands.install_arguments.as_deref());
                arguments.extend(extra_arguments(extra)?);
            }
            ActionState::Install | ActionState::MajorUpgrade => {
                arguments.push("/i".to_string());
                arguments.push(path_argument(&self.inner.cached_payload(package)?));
                arguments.extend(extra_arguments(commands.install_arguments.as_deref())?);
            }
            ActionState::None => {}
        }
        arguments.push("/qn".to_string());
        arguments.push("/norestart".to_string());
        Ok(arguments)
    }
}

impl PackageEngine for MsiEngine {
    fn kind(&self) -> PackageKind {
        PackageKind::Msi
    }

    fn detect(&self, package: &Package, _variables: &Variables) -> Result<Detection> {
        self.inner.detect(package)
    }

    fn execute(
        &self,
        package: &Package,
        action: ActionState,
        _variables: &Variables,
        rollback: bool,
    ) -> Result<PackageOutcome> {
        if action == ActionState::None {
            return Ok(PackageOutcome::Success);
        }
        let arguments = self.arguments_for(package, action)?;
        self.inner
            .run(package, action, rollback, &self.msiexec, &arguments)
    }
}

pub struct MsuEngine {
    inner: NativeInstaller,
    wusa: PathBuf,
}

impl MsuEngine {
    pub fn new(
        cache: PayloadCache,
        runner: Rc<dyn ProcessRunner>,
        products: Rc<dyn ProductStore>,
        tools: &NativeTools,
    ) -> Self {
        Self {
            inner: NativeInstaller {
                kind: PackageKind::Msu,
                cache,
                runner,
                products,
            },
            wusa: tools.wusa.clone(),
        }
    }

    fn arguments_for(&self, package: &Package, action: ActionState) -> Result<Vec<String>> {
        let mut arguments = Vec::new();
        if action == ActionState::Uninstall {
            arguments.push("/uninstall".to_string());
            arguments.push(format!("/kb:{}", kb_number(self.inner.product_code(package)?)));
        } else {
            arguments.push(path_argument(&self.inner.cached_payload(package)?));
        }
        arguments.push("/quiet".to_string());
        arguments.push("/norestart".to_string());
        Ok(arguments)
    }
}

impl PackageEngine for MsuEngine {
    fn kind(&self) -> PackageKind {
        PackageKind::Msu
    }

    fn detect(&self, package: &Package, _variables: &Variables) -> Result<Detection> {
        self.inner.detect(package)
    }

    fn execute(
        &self,
        package: &Package,
        action: ActionState,
        _variables: &Variables,
        rollback: bool,
    ) -> Result<PackageOutcome> {
        if action == ActionState::None {
            return Ok(PackageOutcome::Success);
        }
        let arguments = self.arguments_for(package, action)?;
        self.inner
            .run(package, action, rollback, &self.wusa, &arguments)
    }
}

/// `KB1234567` and `1234567` both name update 1234567.
pub(crate) fn kb_number(code: &str) -> &str {
    let code = code.trim();
    match code.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("kb") => &code[2..],
        _ => code,
    }
}

fn path_argument(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
