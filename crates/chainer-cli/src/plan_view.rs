use anyhow::{Context, Result};
use chainer_core::{ActionState, BundleAction, CurrentState, PackageKind, Packages, RequestState};
use chainer_plan::Plan;
use serde::Serialize;

/// JSON shape printed by `plan --json`.
#[derive(Debug, Serialize)]
pub(crate) struct PlanView {
    pub(crate) action: BundleAction,
    pub(crate) requires_elevation: bool,
    pub(crate) estimated_size: u64,
    pub(crate) packages: Vec<PackageView>,
    pub(crate) cache: Vec<CacheView>,
    pub(crate) execute: Vec<ExecuteView>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PackageView {
    pub(crate) id: String,
    pub(crate) kind: PackageKind,
    pub(crate) per_machine: bool,
    pub(crate) vital: bool,
    pub(crate) current_state: CurrentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) installed_version: Option<String>,
    pub(crate) cached: bool,
    pub(crate) requested: RequestState,
    pub(crate) expected: CurrentState,
    pub(crate) execute_action: ActionState,
    pub(crate) rollback_action: ActionState,
}

#[derive(Debug, Serialize)]
pub(crate) struct CacheView {
    pub(crate) package: String,
    pub(crate) payload: String,
    pub(crate) size: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExecuteView {
    pub(crate) package: String,
    pub(crate) action: ActionState,
    pub(crate) rollback_action: ActionState,
    pub(crate) elevated: bool,
}

impl PlanView {
    pub(crate) fn build(plan: &Plan, packages: &Packages) -> Result<Self> {
        let mut cache = Vec::with_capacity(plan.cache_count());
        for entry in plan.cache_entries() {
            let package = packages.get(entry.package)?;
            let payload = package.payload(entry.payload)?;
            cache.push(CacheView {
                package: package.id.clone(),
                payload: payload.id.clone(),
                size: entry.size,
            });
        }

        let mut execute = Vec::with_capacity(plan.execute_count());
        for entry in plan.execute_entries() {
            execute.push(ExecuteView {
                package: packages.get(entry.package)?.id.clone(),
                action: entry.action,
                rollback_action: entry.rollback_action,
                elevated: !entry.owned,
            });
        }

        let packages = packages
            .iter()
            .map(|package| PackageView {
                id: package.id.clone(),
                kind: package.kind,
                per_machine: package.per_machine,
                vital: package.vital,
                current_state: package.current_state,
                installed_version: package
                    .installed_version
                    .as_ref()
                    .map(ToString::to_string),
                cached: package.cached,
                requested: package.requested,
                expected: package.expected,
                execute_action: package.execute_action,
                rollback_action: package.rollback_action,
            })
            .collect();

        Ok(Self {
            action: plan.action(),
            requires_elevation: plan.requires_elevation(),
            estimated_size: plan.estimated_size(),
            packages,
            cache,
            execute,
        })
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed serializing plan")
    }
}
