use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_FILE_NAME: &str = "state.rsm";

/// Filesystem layout for the per-user and per-machine package caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    user_root: PathBuf,
    machine_root: PathBuf,
}

impl CacheLayout {
    pub fn new(user_root: impl Into<PathBuf>, machine_root: impl Into<PathBuf>) -> Self {
        Self {
            user_root: user_root.into(),
            machine_root: machine_root.into(),
        }
    }

    /// Single root holding both caches, used by tests and portable installs.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::new(root.join("user"), root.join("machine"))
    }

    pub fn root(&self, per_machine: bool) -> &Path {
        if per_machine {
            &self.machine_root
        } else {
            &self.user_root
        }
    }

    pub fn bundles_dir(&self, per_machine: bool) -> PathBuf {
        self.root(per_machine).join("bundles")
    }

    pub fn packages_dir(&self, per_machine: bool) -> PathBuf {
        self.root(per_machine).join("packages")
    }

    pub fn receipts_dir(&self, per_machine: bool) -> PathBuf {
        self.root(per_machine).join("receipts")
    }

    pub fn pending_delete_dir(&self, per_machine: bool) -> PathBuf {
        self.root(per_machine).join(".pending-delete")
    }

    pub fn bundle_cache_dir(&self, per_machine: bool, bundle_id: &str) -> PathBuf {
        self.bundles_dir(per_machine).join(bundle_id)
    }

    pub fn state_file_path(&self, per_machine: bool, bundle_id: &str) -> PathBuf {
        self.bundle_cache_dir(per_machine, bundle_id)
            .join(STATE_FILE_NAME)
    }

    pub fn cached_executable_path(
        &self,
        per_machine: bool,
        bundle_id: &str,
        executable_name: &str,
    ) -> PathBuf {
        self.bundle_cache_dir(per_machine, bundle_id)
            .join(executable_name)
    }

    pub fn package_cache_dir(&self, per_machine: bool, package_id: &str) -> PathBuf {
        self.packages_dir(per_machine).join(package_id)
    }

    pub fn payload_cache_path(&self, per_machine: bool, package_id: &str, file_name: &str) -> PathBuf {
        self.package_cache_dir(per_machine, package_id)
            .join(file_name)
    }

    pub fn receipt_path(&self, per_machine: bool, key: &str) -> PathBuf {
        self.receipts_dir(per_machine)
            .join(format!("{key}.receipt"))
    }

    pub fn ensure_base_dirs(&self, per_machine: bool) -> Result<()> {
        for dir in [
            self.bundles_dir(per_machine),
            self.packages_dir(per_machine),
            self.receipts_dir(per_machine),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_cache_layout() -> Result<CacheLayout> {
    if let Ok(root) = std::env::var("CHAINER_CACHE_ROOT") {
        return Ok(CacheLayout::under(root));
    }

    if cfg!(windows) {
        let local_app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows user cache")?;
        let program_data = std::env::var("ProgramData")
            .context("ProgramData is not set; cannot resolve Windows machine cache")?;
        return Ok(CacheLayout::new(
            PathBuf::from(local_app_data).join("Package Cache"),
            PathBuf::from(program_data).join("Package Cache"),
        ));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user cache")?;
    Ok(CacheLayout::new(
        PathBuf::from(home).join(".cache").join("chainer"),
        PathBuf::from("/var/cache/chainer"),
    ))
}
