use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use chainer_core::{evaluate_condition, ActionState, Package, PackageKind, Variables};
use chainer_plan::{Detection, PackageEngine, PackageOutcome};
use tracing::{info, warn};

use crate::cache::PayloadCache;
use crate::receipts::{ProductReceipt, ProductStore};
use crate::runner::{split_arguments, ProcessRunner};

/// Executable packages: detected by condition (or receipt when no condition
/// is declared), run with the declared arguments, outcome classified by the
/// package's exit code rules.
pub struct ExeEngine {
    cache: PayloadCache,
    runner: Rc<dyn ProcessRunner>,
    products: Rc<dyn ProductStore>,
}

impl ExeEngine {
    pub fn new(
        cache: PayloadCache,
        runner: Rc<dyn ProcessRunner>,
        products: Rc<dyn ProductStore>,
    ) -> Self {
        Self {
            cache,
            runner,
            products,
        }
    }

    fn arguments_for(package: &Package, action: ActionState) -> Result<Vec<String>> {
        let commands = &package.commands;
        let raw = match action {
            ActionState::Install
            | ActionState::AdminInstall
            | ActionState::MinorUpgrade
            | ActionState::MajorUpgrade => commands.install_arguments.as_deref(),
            ActionState::Maintenance | ActionState::Recache => commands
                .repair_arguments
                .as_deref()
                .or(commands.install_arguments.as_deref()),
            ActionState::Uninstall => Some(commands.uninstall_arguments.as_deref().ok_or_else(
                || anyhow!("package '{}' declares no uninstall arguments", package.id),
            )?),
            ActionState::None => None,
        };
        raw.map(split_arguments).transpose().map(Option::unwrap_or_default)
    }
}

impl PackageEngine for ExeEngine {
    fn kind(&self) -> PackageKind {
        PackageKind::Exe
    }

    fn detect(&self, package: &Package, variables: &Variables) -> Result<Detection> {
        if let Some(condition) = package
            .detect_condition
            .as_deref()
            .filter(|condition| !condition.trim().is_empty())
        {
            let present = evaluate_condition(Some(condition), variables).with_context(|| {
                format!("failed evaluating detect condition of '{}'", package.id)
            })?;
            return Ok(if present {
                Detection::present()
            } else {
                Detection::absent()
            });
        }

        Ok(match self.products.read(package.per_machine, &package.id)? {
            Some(receipt) => Detection {
                state: chainer_core::CurrentState::Present,
                installed_version: receipt.version,
            },
            None => Detection::absent(),
        })
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
        let arguments = Self::arguments_for(package, action)?;
        let program = self.cache.primary_payload_path(package)?;
        if !program.is_file() {
            return Err(anyhow!(
                "payload for package '{}' is not cached at {}",
                package.id,
                program.display()
            ));
        }

        info!(package = %package.id, action = action.as_str(), rollback, "executing package");
        let exit_code = self.runner.run(&program, &arguments)?;
        let outcome = PackageOutcome::from_exit_code(&package.commands.exit_codes, exit_code);
        if outcome.is_failure() {
            warn!(package = %package.id, exit_code, "package execution failed");
            return Ok(outcome);
        }

        if action == ActionState::Uninstall {
            self.products.remove(package.per_machine, &package.id)?;
        } else if action.is_install_class() {
            self.products.write(
                package.per_machine,
                &ProductReceipt::new(
                    package.id.clone(),
                    package.id.clone(),
                    PackageKind::Exe,
                    package.version.clone(),
                ),
            )?;
        }
        Ok(outcome)
    }
}
