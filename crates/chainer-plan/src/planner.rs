use anyhow::{Context, Result};
use chainer_core::{ActionState, BufferWriter, BundleAction, Package, Packages, Registration, Variables};
use tracing::{debug, info};

use crate::engine::PackageEngines;
use crate::plan::{ExecutePlanEntry, Plan};
use crate::request::{default_request_state, expected_state};

pub struct PlanContext<'a> {
    pub action: BundleAction,
    pub variables: &'a Variables,
    pub registration: Option<&'a Registration>,
    pub engines: &'a PackageEngines,
    /// The driving process already runs privileged and executes per-machine
    /// packages itself.
    pub privileged: bool,
}

/// Runs one planning pass over every package in declaration order and
/// freezes the plan.
pub fn plan_packages(packages: &mut Packages, context: &PlanContext<'_>, plan: &mut Plan) -> Result<()> {
    plan.begin(context.action, packages.len(), context.registration.is_some());
    info!(
        action = context.action.as_str(),
        packages = packages.len(),
        "planning bundle"
    );

    for package in packages.iter_mut() {
        plan_package(package, context, plan)
            .with_context(|| format!("failed to plan package '{}'", package.id))?;
    }

    plan.finalize(context.variables)?;
    info!(
        cache = plan.cache_count(),
        execute = plan.execute_count(),
        elevated = plan.elevated_package_count(),
        "plan ready"
    );
    Ok(())
}

fn plan_package(package: &mut Package, context: &PlanContext<'_>, plan: &mut Plan) -> Result<()> {
    let engine = context.engines.get(package.kind)?;

    package.requested = default_request_state(context.action, package, context.variables)?;
    package.expected = expected_state(package, context.variables)?;
    let (execute_action, rollback_action) = engine.plan(package, context.variables)?;
    package.execute_action = execute_action;
    package.rollback_action = rollback_action;

    debug!(
        package = %package.id,
        current = ?package.current_state,
        requested = ?package.requested,
        expected = ?package.expected,
        execute = execute_action.as_str(),
        rollback = rollback_action.as_str(),
        "planned package"
    );

    if execute_action == ActionState::None {
        return Ok(());
    }

    if !package.cached || execute_action == ActionState::Recache {
        for payload in &package.payloads {
            plan.add_cache_entry(package.index, payload.index, payload.size)?;
        }
    }

    plan.add_execute_entry(ExecutePlanEntry {
        package: package.index,
        owned: !package.per_machine || context.privileged,
        action: execute_action,
        rollback_action,
    })?;

    if package.per_machine {
        if !context.privileged {
            let mut writer = BufferWriter::new();
            engine.serialize_elevated_state(package, &mut writer)?;
            plan.add_elevated_package(package.index, writer.into_bytes())?;
        }
        if execute_action.is_install_class() {
            plan.mark_per_machine_registration()?;
        }
    }

    Ok(())
}
