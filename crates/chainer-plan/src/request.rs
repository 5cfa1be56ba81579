use anyhow::{Context, Result};
use chainer_core::{evaluate_condition, BundleAction, CurrentState, Package, RequestState, Variables};

/// What the bundle action asks of one package, after its install condition.
pub fn default_request_state(
    action: BundleAction,
    package: &Package,
    variables: &Variables,
) -> Result<RequestState> {
    match action {
        BundleAction::Uninstall => Ok(RequestState::Absent),
        BundleAction::Unknown | BundleAction::Help | BundleAction::Layout => Ok(RequestState::None),
        BundleAction::Install | BundleAction::Modify | BundleAction::Repair => {
            let wanted = evaluate_condition(package.install_condition.as_deref(), variables)
                .with_context(|| {
                    format!("failed evaluating install condition of '{}'", package.id)
                })?;
            Ok(match (wanted, action) {
                (false, _) => RequestState::Absent,
                (true, BundleAction::Repair) => RequestState::Repair,
                (true, _) => RequestState::Present,
            })
        }
    }
}

/// Projected pre-run state used for rollback. Without a rollback-install
/// condition this is the detected current state.
pub fn expected_state(package: &Package, variables: &Variables) -> Result<CurrentState> {
    match package
        .rollback_install_condition
        .as_deref()
        .filter(|condition| !condition.trim().is_empty())
    {
        Some(condition) => {
            let present = evaluate_condition(Some(condition), variables).with_context(|| {
                format!(
                    "failed evaluating rollback install condition of '{}'",
                    package.id
                )
            })?;
            Ok(if present {
                CurrentState::Present
            } else {
                CurrentState::Absent
            })
        }
        None => Ok(package.current_state),
    }
}
