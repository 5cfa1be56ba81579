use std::fmt;
use std::num::NonZeroU32;

use anyhow::{anyhow, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// 1-based package ordinal. Stable across processes, used as the handle for
/// packages in plans and elevation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageIndex(NonZeroU32);

impl PackageIndex {
    pub fn new(ordinal: u32) -> Option<Self> {
        NonZeroU32::new(ordinal).map(Self)
    }

    pub fn from_slot(slot: usize) -> Self {
        let ordinal = u32::try_from(slot + 1).unwrap_or(u32::MAX);
        Self(NonZeroU32::new(ordinal).unwrap_or(NonZeroU32::MAX))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    fn slot(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl fmt::Display for PackageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 1-based payload ordinal within its package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadIndex(NonZeroU32);

impl PayloadIndex {
    pub fn new(ordinal: u32) -> Option<Self> {
        NonZeroU32::new(ordinal).map(Self)
    }

    pub fn from_slot(slot: usize) -> Self {
        let ordinal = u32::try_from(slot + 1).unwrap_or(u32::MAX);
        Self(NonZeroU32::new(ordinal).unwrap_or(NonZeroU32::MAX))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Exe,
    Msi,
    Msu,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exe => "exe",
            Self::Msi => "msi",
            Self::Msu => "msu",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentState {
    #[default]
    Unknown,
    Absent,
    Present,
}

impl CurrentState {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Absent => 1,
            Self::Present => 2,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Absent),
            2 => Ok(Self::Present),
            _ => Err(anyhow!("invalid package current state: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    None,
    Absent,
    Present,
    Repair,
}

/// Forward or compensating operation chosen for a package. The declaration
/// order is significant: everything strictly between `None` and `Uninstall`
/// is an install-class action.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    #[default]
    None,
    Install,
    AdminInstall,
    MinorUpgrade,
    MajorUpgrade,
    Maintenance,
    Recache,
    Uninstall,
}

impl ActionState {
    pub fn is_install_class(self) -> bool {
        self > Self::None && self < Self::Uninstall
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Install => "install",
            Self::AdminInstall => "admin_install",
            Self::MinorUpgrade => "minor_upgrade",
            Self::MajorUpgrade => "major_upgrade",
            Self::Maintenance => "maintenance",
            Self::Recache => "recache",
            Self::Uninstall => "uninstall",
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Install => 1,
            Self::AdminInstall => 2,
            Self::MinorUpgrade => 3,
            Self::MajorUpgrade => 4,
            Self::Maintenance => 5,
            Self::Recache => 6,
            Self::Uninstall => 7,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Install),
            2 => Ok(Self::AdminInstall),
            3 => Ok(Self::MinorUpgrade),
            4 => Ok(Self::MajorUpgrade),
            5 => Ok(Self::Maintenance),
            6 => Ok(Self::Recache),
            7 => Ok(Self::Uninstall),
            _ => Err(anyhow!("invalid package action state: {value}")),
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCodeBehavior {
    Success,
    Error,
    ScheduleReboot,
    ForceReboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCodeMatch {
    Exact(u32),
    Wildcard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitCodeRule {
    pub code: ExitCodeMatch,
    pub behavior: ExitCodeBehavior,
}

impl ExitCodeRule {
    pub fn exact(code: u32, behavior: ExitCodeBehavior) -> Self {
        Self {
            code: ExitCodeMatch::Exact(code),
            behavior,
        }
    }

    pub fn wildcard(behavior: ExitCodeBehavior) -> Self {
        Self {
            code: ExitCodeMatch::Wildcard,
            behavior,
        }
    }
}

/// Location of a payload stored in one of the bundle image's attached
/// containers. `offset` is relative to the start of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedPayload {
    pub container: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub id: String,
    pub index: PayloadIndex,
    pub file_name: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub source_path: Option<String>,
    pub download_url: Option<String>,
    pub embedded: Option<EmbeddedPayload>,
}

/// Kind-specific arguments. Exe packages carry command lines and exit code
/// rules; native-installer and OS-update packages carry the identity their
/// receipts are keyed on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageCommands {
    pub install_arguments: Option<String>,
    pub repair_arguments: Option<String>,
    pub uninstall_arguments: Option<String>,
    pub exit_codes: Vec<ExitCodeRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: String,
    pub index: PackageIndex,
    pub kind: PackageKind,
    pub per_machine: bool,
    pub uninstallable: bool,
    pub vital: bool,
    pub repairable: bool,
    pub version: Option<Version>,
    pub product_code: Option<String>,
    pub detect_condition: Option<String>,
    pub install_condition: Option<String>,
    pub rollback_install_condition: Option<String>,
    pub commands: PackageCommands,
    pub payloads: Vec<Payload>,

    pub current_state: CurrentState,
    pub installed_version: Option<Version>,
    pub cached: bool,
    pub requested: RequestState,
    pub expected: CurrentState,
    pub execute_action: ActionState,
    pub rollback_action: ActionState,
}

impl Package {
    pub fn new(id: impl Into<String>, index: PackageIndex, kind: PackageKind) -> Self {
        Self {
            id: id.into(),
            index,
            kind,
            per_machine: false,
            uninstallable: true,
            vital: true,
            repairable: false,
            version: None,
            product_code: None,
            detect_condition: None,
            install_condition: None,
            rollback_install_condition: None,
            commands: PackageCommands::default(),
            payloads: Vec::new(),
            current_state: CurrentState::Unknown,
            installed_version: None,
            cached: false,
            requested: RequestState::None,
            expected: CurrentState::Unknown,
            execute_action: ActionState::None,
            rollback_action: ActionState::None,
        }
    }

    pub fn total_payload_size(&self) -> u64 {
        self.payloads.iter().map(|payload| payload.size).sum()
    }

    pub fn payload(&self, index: PayloadIndex) -> Result<&Payload> {
        self.payloads
            .iter()
            .find(|payload| payload.index == index)
            .ok_or_else(|| {
                anyhow!(
                    "payload ordinal {} is out of range for package '{}'",
                    index.get(),
                    self.id
                )
            })
    }

    /// Clears everything a previous detect/plan pass set.
    pub fn reset_run_state(&mut self) {
        self.current_state = CurrentState::Unknown;
        self.installed_version = None;
        self.cached = false;
        self.requested = RequestState::None;
        self.expected = CurrentState::Unknown;
        self.execute_action = ActionState::None;
        self.rollback_action = ActionState::None;
    }
}

/// Bundle-wide ordered package list with bounds-checked ordinal lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packages {
    items: Vec<Package>,
}

impl Packages {
    pub fn new(items: Vec<Package>) -> Result<Self> {
        for (slot, package) in items.iter().enumerate() {
            if package.index != PackageIndex::from_slot(slot) {
                return Err(anyhow!(
                    "package '{}' has ordinal {} but is declared at position {}",
                    package.id,
                    package.index.get(),
                    slot + 1
                ));
            }
        }
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, index: PackageIndex) -> bool {
        index.slot() < self.items.len()
    }

    pub fn get(&self, index: PackageIndex) -> Result<&Package> {
        self.items
            .get(index.slot())
            .ok_or_else(|| anyhow!("package ordinal {} is out of range", index.get()))
    }

    pub fn get_mut(&mut self, index: PackageIndex) -> Result<&mut Package> {
        self.items
            .get_mut(index.slot())
            .ok_or_else(|| anyhow!("package ordinal {} is out of range", index.get()))
    }

    pub fn find(&self, id: &str) -> Option<&Package> {
        self.items.iter().find(|package| package.id == id)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Package> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut Package> {
        self.items.iter_mut()
    }
}
