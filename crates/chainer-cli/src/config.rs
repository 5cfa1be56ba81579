use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chainer_core::{default_cache_layout, BundleManifest, CacheLayout, Registration};
use chainer_installer::{InstallerContext, PayloadCache};
use chainer_resume::{FileRegistry, ProcessPrivilege, ResumeRegistry};

const REGISTRY_DIR_NAME: &str = "registry";

/// Where a run reads its bundle from and keeps its durable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EngineConfig {
    pub(crate) manifest_path: PathBuf,
    pub(crate) source_dir: PathBuf,
    /// Explicit cache root; `None` means the platform default layout.
    pub(crate) cache_root: Option<PathBuf>,
    pub(crate) cache_layout: CacheLayout,
    pub(crate) registry_root: PathBuf,
    pub(crate) log_level: Option<String>,
}

impl EngineConfig {
    pub(crate) fn resolve(
        manifest: &Path,
        source_dir: Option<&Path>,
        cache_root: Option<&Path>,
        registry_root: Option<&Path>,
        log_level: Option<&str>,
    ) -> Result<Self> {
        let cache_layout = match cache_root {
            Some(root) => CacheLayout::under(root),
            None => default_cache_layout()?,
        };
        let source_dir = match source_dir {
            Some(dir) => dir.to_path_buf(),
            None => manifest
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let registry_root = registry_root
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cache_layout.root(false).join(REGISTRY_DIR_NAME));

        Ok(Self {
            manifest_path: manifest.to_path_buf(),
            source_dir,
            cache_root: cache_root.map(Path::to_path_buf),
            cache_layout,
            registry_root,
            log_level: log_level.map(str::to_string),
        })
    }

    pub(crate) fn load_manifest(&self) -> Result<BundleManifest> {
        BundleManifest::load(&self.manifest_path).with_context(|| {
            format!(
                "failed loading bundle manifest {}",
                self.manifest_path.display()
            )
        })
    }

    /// Attached payloads are read from the bundle executable in the source
    /// directory.
    pub(crate) fn installer_context(&self, registration: &Registration) -> InstallerContext {
        InstallerContext::system(
            PayloadCache::new(self.cache_layout.clone(), self.source_dir.clone())
                .with_bundle_image(self.bundle_image(registration)),
        )
    }

    pub(crate) fn bundle_image(&self, registration: &Registration) -> PathBuf {
        self.source_dir.join(&registration.executable_name)
    }

    /// Registry store whose volatile keys are scoped to the running boot.
    pub(crate) fn registry_store(&self) -> Result<FileRegistry> {
        FileRegistry::for_current_boot(&self.registry_root).with_context(|| {
            format!(
                "failed opening registry under {}",
                self.registry_root.display()
            )
        })
    }

    pub(crate) fn resume_registry(
        &self,
        registration: Registration,
        privilege: ProcessPrivilege,
    ) -> Result<ResumeRegistry> {
        Ok(ResumeRegistry::new(
            Box::new(self.registry_store()?),
            self.cache_layout.clone(),
            registration,
            privilege,
        ))
    }

    /// Arguments that make a re-launched worker resolve the same locations.
    pub(crate) fn worker_arguments(&self, pipe_name: &str, token: &str) -> Vec<String> {
        let mut args = vec![
            "--manifest".to_string(),
            self.manifest_path.display().to_string(),
            "--source-dir".to_string(),
            self.source_dir.display().to_string(),
            "--registry-root".to_string(),
            self.registry_root.display().to_string(),
        ];
        if let Some(root) = &self.cache_root {
            args.push("--cache-root".to_string());
            args.push(root.display().to_string());
        }
        if let Some(level) = &self.log_level {
            args.push("--log-level".to_string());
            args.push(level.clone());
        }
        args.extend([
            "elevated".to_string(),
            "--pipe".to_string(),
            pipe_name.to_string(),
            "--token".to_string(),
            token.to_string(),
        ]);
        args
    }
}
