mod actions;
mod engine;
mod exit_code;
mod plan;
mod planner;
mod request;

pub use actions::{execute_action, plan_package_actions, rollback_action};
pub use engine::{read_package_state, write_package_state, Detection, PackageEngine, PackageEngines};
pub use exit_code::{classify_exit_code, PackageOutcome};
pub use plan::{CachePlanEntry, ElevatedPackageState, ElevatedPlan, ExecutePlanEntry, Plan};
pub use planner::{plan_packages, PlanContext};
pub use request::{default_request_state, expected_state};
