use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chainer_core::{CacheLayout, PackageKind};
use semver::Version;

/// Record that a product was installed by this bundle, keyed on its product
/// code (native installers, OS updates) or package id (executables).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductReceipt {
    pub key: String,
    pub package_id: String,
    pub kind: PackageKind,
    pub version: Option<Version>,
    pub installed_at_unix: u64,
}

impl ProductReceipt {
    pub fn new(
        key: impl Into<String>,
        package_id: impl Into<String>,
        kind: PackageKind,
        version: Option<Version>,
    ) -> Self {
        Self {
            key: key.into(),
            package_id: package_id.into(),
            kind,
            version,
            installed_at_unix: current_unix_timestamp(),
        }
    }
}

/// Where detection looks for installed products.
pub trait ProductStore {
    fn read(&self, per_machine: bool, key: &str) -> Result<Option<ProductReceipt>>;

    fn write(&self, per_machine: bool, receipt: &ProductReceipt) -> Result<PathBuf>;

    /// Returns whether a receipt was removed.
    fn remove(&self, per_machine: bool, key: &str) -> Result<bool>;
}

/// Receipts as `key=value` files under the cache's receipts directory.
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    layout: CacheLayout,
}

impl ReceiptStore {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    fn path(&self, per_machine: bool, key: &str) -> PathBuf {
        self.layout.receipt_path(per_machine, &receipt_file_stem(key))
    }
}

impl ProductStore for ReceiptStore {
    fn read(&self, per_machine: bool, key: &str) -> Result<Option<ProductReceipt>> {
        let path = self.path(per_machine, key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read receipt: {}", path.display()));
            }
        };
        let receipt = parse_receipt(&raw)
            .with_context(|| format!("failed to parse receipt: {}", path.display()))?;
        Ok(Some(receipt))
    }

    fn write(&self, per_machine: bool, receipt: &ProductReceipt) -> Result<PathBuf> {
        let mut payload = String::new();
        payload.push_str(&format!("key={}\n", receipt.key));
        payload.push_str(&format!("package_id={}\n", receipt.package_id));
        payload.push_str(&format!("kind={}\n", receipt.kind.as_str()));
        if let Some(version) = &receipt.version {
            payload.push_str(&format!("version={version}\n"));
        }
        payload.push_str(&format!(
            "installed_at_unix={}\n",
            receipt.installed_at_unix
        ));

        let path = self.path(per_machine, &receipt.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, payload.as_bytes())
            .with_context(|| format!("failed to write receipt: {}", path.display()))?;
        Ok(path)
    }

    fn remove(&self, per_machine: bool, key: &str) -> Result<bool> {
        let path = self.path(per_machine, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove receipt: {}", path.display())),
        }
    }
}

pub(crate) fn parse_receipt(raw: &str) -> Result<ProductReceipt> {
    let mut key = None;
    let mut package_id = None;
    let mut kind = None;
    let mut version = None;
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "key" => key = Some(v.to_string()),
            "package_id" => package_id = Some(v.to_string()),
            "kind" => kind = Some(parse_kind(v)?),
            "version" => {
                version = Some(
                    Version::parse(v).with_context(|| format!("invalid receipt version '{v}'"))?,
                )
            }
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(ProductReceipt {
        key: key.context("missing key")?,
        package_id: package_id.context("missing package_id")?,
        kind: kind.context("missing kind")?,
        version,
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
    })
}

fn parse_kind(value: &str) -> Result<PackageKind> {
    match value {
        "exe" => Ok(PackageKind::Exe),
        "msi" => Ok(PackageKind::Msi),
        "msu" => Ok(PackageKind::Msu),
        _ => Err(anyhow!("invalid receipt kind: {value}")),
    }
}

/// Product codes carry braces and the like; keep file names portable.
fn receipt_file_stem(key: &str) -> String {
    key.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
