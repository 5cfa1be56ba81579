use chainer_core::{status, ActionState, BundleAction, Package, Payload};
use chainer_plan::{PackageOutcome, Plan};
use chainer_resume::ResumeType;

/// Answer to a failure notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorResponse {
    /// Keep going when the failing package is not vital.
    Continue,
    /// Stop and roll back what already ran.
    Cancel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestartState {
    #[default]
    None,
    Required,
    Initiated,
}

impl RestartState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Required => "required",
            Self::Initiated => "initiated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyResult {
    pub status: u32,
    pub restart: RestartState,
    pub rolled_back: bool,
}

impl ApplyResult {
    pub fn succeeded(&self) -> bool {
        status::succeeded(self.status)
    }
}

/// Lifecycle callbacks raised while the engine detects, plans and applies.
/// Every callback defaults to doing nothing.
pub trait EngineObserver {
    fn on_detect_begin(&mut self, _package_count: usize) {}

    fn on_detect_package_complete(&mut self, _package: &Package) {}

    fn on_detect_complete(&mut self, _resume: ResumeType) {}

    fn on_plan_begin(&mut self, _action: BundleAction) {}

    fn on_plan_complete(&mut self, _plan: &Plan) {}

    fn on_apply_begin(&mut self, _plan: &Plan) {}

    fn on_cache_payload_begin(&mut self, _package: &Package, _payload: &Payload) {}

    fn on_cache_progress(
        &mut self,
        _package: &Package,
        _payload: &Payload,
        _done: u64,
        _total: Option<u64>,
    ) {
    }

    fn on_cache_payload_complete(&mut self, _package: &Package, _payload: &Payload, _status: u32) {}

    fn on_execute_package_begin(&mut self, _package: &Package, _action: ActionState, _rollback: bool) {
    }

    fn on_execute_progress(&mut self, _package: &Package, _percent: u32) {}

    fn on_execute_package_complete(
        &mut self,
        _package: &Package,
        _outcome: PackageOutcome,
        _rollback: bool,
    ) {
    }

    /// Called once per failure. Vital packages roll back regardless of the
    /// answer.
    fn on_error(&mut self, _package: &Package, _code: u32, _message: &str) -> ErrorResponse {
        ErrorResponse::Continue
    }

    fn on_apply_complete(&mut self, _result: &ApplyResult) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl EngineObserver for NullObserver {}
