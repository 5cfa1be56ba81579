use chainer_core::status::{self, S_OK, S_REBOOT_INITIATED, S_REBOOT_REQUIRED};
use chainer_core::{ExitCodeBehavior, ExitCodeMatch, ExitCodeRule};

/// First exact match wins, then the last wildcard rule, then zero means
/// success and anything else an error.
pub fn classify_exit_code(rules: &[ExitCodeRule], exit_code: u32) -> ExitCodeBehavior {
    let mut wildcard = None;
    for rule in rules {
        match rule.code {
            ExitCodeMatch::Exact(code) if code == exit_code => return rule.behavior,
            ExitCodeMatch::Exact(_) => {}
            ExitCodeMatch::Wildcard => wildcard = Some(rule.behavior),
        }
    }

    wildcard.unwrap_or(if exit_code == 0 {
        ExitCodeBehavior::Success
    } else {
        ExitCodeBehavior::Error
    })
}

/// Result of executing one package action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOutcome {
    Success,
    ScheduleReboot,
    ForceReboot,
    /// Failure carrying the HRESULT-style status.
    Failed(u32),
}

impl PackageOutcome {
    pub fn from_exit_code(rules: &[ExitCodeRule], exit_code: u32) -> Self {
        match classify_exit_code(rules, exit_code) {
            ExitCodeBehavior::Success => Self::Success,
            ExitCodeBehavior::ScheduleReboot => Self::ScheduleReboot,
            ExitCodeBehavior::ForceReboot => Self::ForceReboot,
            ExitCodeBehavior::Error => {
                let code = status::from_exit_code(exit_code);
                Self::Failed(if code == S_OK { status::E_FAIL } else { code })
            }
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn status_code(self) -> u32 {
        match self {
            Self::Success => S_OK,
            Self::ScheduleReboot => S_REBOOT_REQUIRED,
            Self::ForceReboot => S_REBOOT_INITIATED,
            Self::Failed(code) => code,
        }
    }

    pub fn from_status_code(code: u32) -> Self {
        match code {
            S_REBOOT_REQUIRED => Self::ScheduleReboot,
            S_REBOOT_INITIATED => Self::ForceReboot,
            _ if status::failed(code) => Self::Failed(code),
            _ => Self::Success,
        }
    }
}
