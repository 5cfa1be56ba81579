use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// What the user asked the bundle to do. Order matters: anything after
/// `Uninstall` leaves the bundle installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleAction {
    #[default]
    Unknown,
    Help,
    Layout,
    Uninstall,
    Install,
    Modify,
    Repair,
}

impl BundleAction {
    pub fn is_install_class(self) -> bool {
        self > Self::Uninstall
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Help => "help",
            Self::Layout => "layout",
            Self::Uninstall => "uninstall",
            Self::Install => "install",
            Self::Modify => "modify",
            Self::Repair => "repair",
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Help => 1,
            Self::Layout => 2,
            Self::Uninstall => 3,
            Self::Install => 4,
            Self::Modify => 5,
            Self::Repair => 6,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Help),
            2 => Ok(Self::Layout),
            3 => Ok(Self::Uninstall),
            4 => Ok(Self::Install),
            5 => Ok(Self::Modify),
            6 => Ok(Self::Repair),
            _ => Err(anyhow!("invalid bundle action: {value}")),
        }
    }
}

/// Programs and Features metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpRegistration {
    pub display_name: String,
    pub display_version: String,
    pub publisher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub bundle_id: String,
    pub per_machine: bool,
    pub executable_name: String,
    pub arp: Option<ArpRegistration>,
    /// UX payloads that live beside the executable and must be cached with it.
    pub ux_payloads: Vec<String>,
}

impl Registration {
    pub fn new(bundle_id: impl Into<String>, executable_name: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            per_machine: false,
            executable_name: executable_name.into(),
            arp: None,
            ux_payloads: Vec::new(),
        }
    }

    pub fn has_arp(&self) -> bool {
        self.arp.is_some()
    }
}
