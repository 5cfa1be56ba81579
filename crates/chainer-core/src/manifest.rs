use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::Deserialize;

use crate::package::{
    EmbeddedPayload, ExitCodeBehavior, ExitCodeRule, Package, PackageCommands, PackageIndex, PackageKind, Packages,
    Payload, PayloadIndex,
};
use crate::registration::{ArpRegistration, Registration};

/// Parsed bundle definition: registration plus the ordered package list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleManifest {
    pub registration: Registration,
    pub packages: Packages,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    registration: RawRegistration,
    #[serde(default)]
    packages: Vec<RawPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegistration {
    id: String,
    #[serde(default)]
    per_machine: bool,
    executable_name: String,
    arp: Option<ArpRegistration>,
    #[serde(default)]
    ux_payloads: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPackage {
    id: String,
    kind: PackageKind,
    #[serde(default)]
    per_machine: bool,
    #[serde(default = "default_true")]
    uninstallable: bool,
    #[serde(default = "default_true")]
    vital: bool,
    #[serde(default)]
    repairable: bool,
    version: Option<Version>,
    product_code: Option<String>,
    detect_condition: Option<String>,
    install_condition: Option<String>,
    rollback_install_condition: Option<String>,
    install_arguments: Option<String>,
    repair_arguments: Option<String>,
    uninstall_arguments: Option<String>,
    #[serde(default)]
    exit_codes: Vec<RawExitCode>,
    #[serde(default)]
    payloads: Vec<RawPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExitCode {
    /// Exit code, or `"*"` for every code not matched exactly.
    code: RawExitCodeValue,
    behavior: ExitCodeBehavior,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawExitCodeValue {
    Code(u32),
    Pattern(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPayload {
    id: String,
    file_name: String,
    #[serde(default)]
    size: u64,
    sha256: Option<String>,
    source_path: Option<String>,
    download_url: Option<String>,
    /// Attached container holding the payload; 0 is the UX container.
    container: Option<u32>,
    #[serde(default)]
    container_offset: u64,
}

fn default_true() -> bool {
    true
}

impl BundleManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read bundle manifest: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to load bundle manifest: {}", path.display()))
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let raw: RawManifest = toml::from_str(input).context("failed to parse bundle manifest")?;

        if raw.registration.id.trim().is_empty() {
            return Err(anyhow!("bundle id must not be empty"));
        }
        let registration = Registration {
            bundle_id: raw.registration.id,
            per_machine: raw.registration.per_machine,
            executable_name: raw.registration.executable_name,
            arp: raw.registration.arp,
            ux_payloads: raw.registration.ux_payloads,
        };

        let mut seen_ids = HashSet::new();
        let mut packages = Vec::with_capacity(raw.packages.len());
        for (slot, raw_package) in raw.packages.into_iter().enumerate() {
            if !seen_ids.insert(raw_package.id.clone()) {
                return Err(anyhow!("duplicate package id '{}'", raw_package.id));
            }
            packages.push(build_package(raw_package, PackageIndex::from_slot(slot))?);
        }

        Ok(Self {
            registration,
            packages: Packages::new(packages)?,
        })
    }
}

fn build_package(raw: RawPackage, index: PackageIndex) -> Result<Package> {
    match raw.kind {
        PackageKind::Msi if raw.product_code.is_none() => {
            return Err(anyhow!("msi package '{}' must declare product_code", raw.id));
        }
        PackageKind::Msi if raw.version.is_none() => {
            return Err(anyhow!("msi package '{}' must declare version", raw.id));
        }
        PackageKind::Msu if raw.product_code.is_none() => {
            return Err(anyhow!(
                "msu package '{}' must declare product_code (the update KB)",
                raw.id
            ));
        }
        _ => {}
    }
    if raw.kind != PackageKind::Exe && !raw.exit_codes.is_empty() {
        return Err(anyhow!(
            "package '{}' declares exit codes but only exe packages classify exit codes",
            raw.id
        ));
    }

    let mut exit_codes = Vec::with_capacity(raw.exit_codes.len());
    for rule in raw.exit_codes {
        exit_codes.push(match rule.code {
            RawExitCodeValue::Code(code) => ExitCodeRule::exact(code, rule.behavior),
            RawExitCodeValue::Pattern(pattern) if pattern.trim() == "*" => {
                ExitCodeRule::wildcard(rule.behavior)
            }
            RawExitCodeValue::Pattern(pattern) => {
                return Err(anyhow!(
                    "invalid exit code '{pattern}' for package '{}'",
                    raw.id
                ));
            }
        });
    }

    let mut payloads = Vec::with_capacity(raw.payloads.len());
    for (slot, payload) in raw.payloads.into_iter().enumerate() {
        if payload.source_path.is_none()
            && payload.download_url.is_none()
            && payload.container.is_none()
        {
            return Err(anyhow!(
                "payload '{}' of package '{}' has no source_path, download_url or container",
                payload.id,
                raw.id
            ));
        }
        let embedded = match payload.container {
            Some(container) if payload.size == 0 => {
                return Err(anyhow!(
                    "payload '{}' of package '{}' is in container {container} but declares no size",
                    payload.id,
                    raw.id
                ));
            }
            Some(container) => Some(EmbeddedPayload {
                container,
                offset: payload.container_offset,
            }),
            None if payload.container_offset != 0 => {
                return Err(anyhow!(
                    "payload '{}' of package '{}' sets container_offset without a container",
                    payload.id,
                    raw.id
                ));
            }
            None => None,
        };
        payloads.push(Payload {
            id: payload.id,
            index: PayloadIndex::from_slot(slot),
            file_name: payload.file_name,
            size: payload.size,
            sha256: payload.sha256,
            source_path: payload.source_path,
            download_url: payload.download_url,
            embedded,
        });
    }

    let mut package = Package::new(raw.id, index, raw.kind);
    package.per_machine = raw.per_machine;
    package.uninstallable = raw.uninstallable;
    package.vital = raw.vital;
    package.repairable = raw.repairable;
    package.version = raw.version;
    package.product_code = raw.product_code;
    package.detect_condition = raw.detect_condition;
    package.install_condition = raw.install_condition;
    package.rollback_install_condition = raw.rollback_install_condition;
    package.commands = PackageCommands {
        install_arguments: raw.install_arguments,
        repair_arguments: raw.repair_arguments,
        uninstall_arguments: raw.uninstall_arguments,
        exit_codes,
    };
    package.payloads = payloads;
    Ok(package)
}
