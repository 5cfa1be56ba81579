//! Package transition tables.

use std::cmp::Ordering;

use anyhow::{anyhow, Result};
use chainer_core::{ActionState, CurrentState, Package, PackageKind, RequestState};

/// Computes `(execute, rollback)` for a package whose `current_state`,
/// `requested` and `expected` fields are already set.
pub fn plan_package_actions(package: &Package) -> Result<(ActionState, ActionState)> {
    Ok((execute_action(package)?, rollback_action(package)?))
}

pub fn execute_action(package: &Package) -> Result<ActionState> {
    let action = match (package.current_state, package.requested) {
        (CurrentState::Unknown, requested) => {
            return Err(anyhow!(
                "invalid package state for '{}': cannot plan {requested:?} from an undetected state",
                package.id
            ));
        }
        (CurrentState::Present, RequestState::Present) => match package.kind {
            PackageKind::Msi => versioned_present_action(package, false)?,
            PackageKind::Exe | PackageKind::Msu => ActionState::None,
        },
        (CurrentState::Present, RequestState::Repair) => match package.kind {
            PackageKind::Msi => versioned_present_action(package, true)?,
            PackageKind::Exe if package.repairable => ActionState::Recache,
            PackageKind::Exe | PackageKind::Msu => ActionState::None,
        },
        (CurrentState::Present, RequestState::Absent) => {
            if package.uninstallable {
                ActionState::Uninstall
            } else {
                ActionState::None
            }
        }
        (CurrentState::Present, RequestState::None) => ActionState::None,
        (CurrentState::Absent, RequestState::Present | RequestState::Repair) => {
            ActionState::Install
        }
        (CurrentState::Absent, RequestState::Absent | RequestState::None) => ActionState::None,
    };
    Ok(action)
}

/// Mirrors the execute table against the expected state so a failed forward
/// transition is undone relative to what should exist.
pub fn rollback_action(package: &Package) -> Result<ActionState> {
    let action = match (package.expected, package.requested) {
        (CurrentState::Unknown, requested) => {
            return Err(anyhow!(
                "invalid expected state for '{}': cannot plan rollback of {requested:?}",
                package.id
            ));
        }
        (CurrentState::Present, RequestState::Absent) => {
            if package.uninstallable {
                ActionState::Install
            } else {
                ActionState::None
            }
        }
        (
            CurrentState::Present,
            RequestState::Present | RequestState::Repair | RequestState::None,
        ) => ActionState::None,
        (CurrentState::Absent, RequestState::Present | RequestState::Repair) => {
            if package.uninstallable {
                ActionState::Uninstall
            } else {
                ActionState::None
            }
        }
        (CurrentState::Absent, RequestState::Absent | RequestState::None) => ActionState::None,
    };
    Ok(action)
}

fn versioned_present_action(package: &Package, repair: bool) -> Result<ActionState> {
    let declared = package.version.as_ref().ok_or_else(|| {
        anyhow!(
            "package '{}' is version-bearing but declares no version",
            package.id
        )
    })?;
    let Some(installed) = package.installed_version.as_ref() else {
        return Ok(if repair {
            ActionState::Maintenance
        } else {
            ActionState::None
        });
    };

    let action = match declared.cmp(installed) {
        Ordering::Less => ActionState::None,
        Ordering::Equal if repair => ActionState::Maintenance,
        Ordering::Equal => ActionState::None,
        Ordering::Greater if declared.major == installed.major => ActionState::MinorUpgrade,
        Ordering::Greater => ActionState::MajorUpgrade,
    };
    Ok(action)
}
