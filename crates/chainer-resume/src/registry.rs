use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chainer_core::{BundleAction, CacheLayout, Registration};
use tracing::{debug, info, warn};

use crate::store::{Hive, RegistryError, RegistryStore};

pub const UNINSTALL_KEY_ROOT: &str = r"Software\Microsoft\Windows\CurrentVersion\Uninstall";
pub const RUN_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";
pub const RESUME_VALUE: &str = "Resume";
pub const REBOOT_REQUIRED_SUBKEY: &str = "RebootRequired";

const DISPLAY_NAME_VALUE: &str = "DisplayName";
const DISPLAY_VERSION_VALUE: &str = "DisplayVersion";
const PUBLISHER_VALUE: &str = "Publisher";
const BUNDLE_CACHE_PATH_VALUE: &str = "BundleCachePath";
const UNINSTALL_STRING_VALUE: &str = "UninstallString";

/// Persisted phase of a bundle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumeMode {
    None = 0,
    Active = 1,
    Suspend = 2,
    ArpPending = 3,
    RebootPending = 4,
}

impl ResumeMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Active),
            2 => Some(Self::Suspend),
            3 => Some(Self::ArpPending),
            4 => Some(Self::RebootPending),
            _ => None,
        }
    }
}

/// What a starting process should make of the previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResumeType {
    #[default]
    None,
    Invalid,
    /// A previous run neither suspended nor ended cleanly.
    Unexpected,
    RebootPending,
    /// A reboot was requested and has since happened.
    Reboot,
    Suspend,
    Arp,
}

impl ResumeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Invalid => "invalid",
            Self::Unexpected => "unexpected",
            Self::RebootPending => "reboot-pending",
            Self::Reboot => "reboot",
            Self::Suspend => "suspend",
            Self::Arp => "arp",
        }
    }

    /// Whether a previous run left variables worth reloading.
    pub fn has_saved_state(self) -> bool {
        matches!(
            self,
            Self::Unexpected | Self::RebootPending | Self::Reboot | Self::Suspend
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessPrivilege {
    User,
    Elevated,
}

/// Durable per-bundle record of a run: the `Resume` value under the bundle's
/// uninstall key, the per-user Run entry, the bundle cache directory and the
/// state file inside it.
///
/// Registry and cache mutation happens only in the process whose privilege
/// matches the bundle's per-machine flag. The Run entry is always maintained
/// by the unprivileged process.
pub struct ResumeRegistry {
    store: Box<dyn RegistryStore>,
    layout: CacheLayout,
    registration: Registration,
    privilege: ProcessPrivilege,
    source_executable: Option<PathBuf>,
    source_dir: Option<PathBuf>,
}

impl ResumeRegistry {
    pub fn new(
        store: Box<dyn RegistryStore>,
        layout: CacheLayout,
        registration: Registration,
        privilege: ProcessPrivilege,
    ) -> Self {
        Self {
            store,
            layout,
            registration,
            privilege,
            source_executable: None,
            source_dir: None,
        }
    }

    /// Where the running executable and external UX payloads are copied from
    /// when an install session begins.
    pub fn with_source(
        mut self,
        executable: Option<PathBuf>,
        source_dir: Option<PathBuf>,
    ) -> Self {
        self.source_executable = executable;
        self.source_dir = source_dir;
        self
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn privilege(&self) -> ProcessPrivilege {
        self.privilege
    }

    pub fn hive(&self) -> Hive {
        if self.registration.per_machine {
            Hive::LocalMachine
        } else {
            Hive::CurrentUser
        }
    }

    pub fn registration_key(&self) -> String {
        format!("{UNINSTALL_KEY_ROOT}\\{}", self.registration.bundle_id)
    }

    fn reboot_marker_key(&self) -> String {
        format!("{}\\{REBOOT_REQUIRED_SUBKEY}", self.registration_key())
    }

    /// True when this process performs registry and cache mutation.
    pub fn owns_registration(&self) -> bool {
        self.registration.per_machine == (self.privilege == ProcessPrivilege::Elevated)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.layout
            .bundle_cache_dir(self.registration.per_machine, &self.registration.bundle_id)
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.layout
            .state_file_path(self.registration.per_machine, &self.registration.bundle_id)
    }

    pub fn cached_executable_path(&self) -> PathBuf {
        self.layout.cached_executable_path(
            self.registration.per_machine,
            &self.registration.bundle_id,
            &self.registration.executable_name,
        )
    }

    pub fn detect_resume_type(&self) -> Result<ResumeType> {
        let key = self.registration_key();
        let raw = match self.store.read_u32(self.hive(), &key, RESUME_VALUE) {
            Ok(raw) => raw,
            Err(err) if err.is_not_found() || err.is_access_denied() => {
                debug!(bundle = %self.registration.bundle_id, error = %err, "no resume record");
                return Ok(ResumeType::None);
            }
            Err(RegistryError::InvalidData { path, reason }) => {
                warn!(path = %path, reason = %reason, "unreadable resume mode");
                return Ok(ResumeType::Invalid);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed reading resume mode for bundle '{}'",
                        self.registration.bundle_id
                    )
                });
            }
        };

        let resume_type = match ResumeMode::from_u32(raw) {
            Some(ResumeMode::None) => ResumeType::None,
            Some(ResumeMode::Active) => ResumeType::Unexpected,
            Some(ResumeMode::Suspend) => ResumeType::Suspend,
            Some(ResumeMode::ArpPending) => ResumeType::Arp,
            Some(ResumeMode::RebootPending) => {
                match self.store.key_exists(self.hive(), &self.reboot_marker_key()) {
                    Ok(true) => ResumeType::RebootPending,
                    Ok(false) => ResumeType::Reboot,
                    Err(err) if err.is_not_found() || err.is_access_denied() => {
                        ResumeType::Reboot
                    }
                    Err(err) => {
                        return Err(err).context("failed checking reboot-required marker");
                    }
                }
            }
            None => ResumeType::Invalid,
        };
        debug!(
            bundle = %self.registration.bundle_id,
            resume = resume_type.as_str(),
            "detected resume type"
        );
        Ok(resume_type)
    }

    pub fn session_begin(&self, action: BundleAction) -> Result<()> {
        if self.owns_registration() {
            if action.is_install_class() {
                self.cache_bundle_files()?;
            }
            self.write_resume_mode(ResumeMode::Active)?;
            self.write_registration_values()?;
            info!(
                bundle = %self.registration.bundle_id,
                action = action.as_str(),
                "registration session started"
            );
        }
        self.write_run_entry()
    }

    pub fn session_suspend(&self, reboot: bool) -> Result<()> {
        if self.owns_registration() {
            if reboot {
                self.write_resume_mode(ResumeMode::RebootPending)?;
                self.store
                    .create_volatile_key(self.hive(), &self.reboot_marker_key())
                    .context("failed creating reboot-required marker")?;
            } else {
                self.write_resume_mode(ResumeMode::Suspend)?;
            }
            info!(bundle = %self.registration.bundle_id, reboot, "registration session suspended");
        }
        self.remove_run_entry()
    }

    pub fn session_resume(&self) -> Result<()> {
        if self.owns_registration() {
            self.write_resume_mode(ResumeMode::Active)?;
            self.store
                .delete_key(self.hive(), &self.reboot_marker_key())
                .context("failed clearing reboot-required marker")?;
            info!(bundle = %self.registration.bundle_id, "registration session resumed");
        }
        self.write_run_entry()
    }

    pub fn session_end(&self, action: BundleAction, rollback: bool) -> Result<()> {
        let still_installed = if action == BundleAction::Uninstall {
            rollback
        } else {
            !rollback
        };
        let keep = self.registration.has_arp() && still_installed;

        if self.owns_registration() {
            if keep {
                self.write_resume_mode(ResumeMode::ArpPending)?;
                self.store
                    .delete_key(self.hive(), &self.reboot_marker_key())
                    .context("failed clearing reboot-required marker")?;
                info!(bundle = %self.registration.bundle_id, "bundle registration kept");
            } else {
                self.store
                    .delete_key(self.hive(), &self.registration_key())
                    .with_context(|| {
                        format!(
                            "failed deleting registration of bundle '{}'",
                            self.registration.bundle_id
                        )
                    })?;
                self.remove_cache_dir();
                info!(bundle = %self.registration.bundle_id, "bundle registration removed");
            }
        }
        self.remove_run_entry()
    }

    /// Writes the opaque engine snapshot to the bundle's state file.
    pub fn save_state(&self, bytes: &[u8]) -> Result<()> {
        let path = self.state_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        fs::write(&path, bytes)
            .with_context(|| format!("failed writing resume state {}", path.display()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved resume state");
        Ok(())
    }

    /// Reads the engine snapshot; `None` when no state was ever saved.
    pub fn load_state(&self) -> Result<Option<Vec<u8>>> {
        let path = self.state_file_path();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed reading resume state {}", path.display())),
        }
    }

    /// The command line registered for relaunch on logon, if any.
    pub fn run_entry(&self) -> Result<Option<String>> {
        match self
            .store
            .read_string(Hive::CurrentUser, RUN_KEY, &self.registration.bundle_id)
        {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() || err.is_access_denied() => Ok(None),
            Err(err) => Err(err).context("failed reading run entry"),
        }
    }

    fn write_resume_mode(&self, mode: ResumeMode) -> Result<()> {
        self.store
            .write_u32(
                self.hive(),
                &self.registration_key(),
                RESUME_VALUE,
                mode.as_u32(),
            )
            .with_context(|| {
                format!(
                    "failed writing resume mode {mode:?} for bundle '{}'",
                    self.registration.bundle_id
                )
            })
    }

    fn write_registration_values(&self) -> Result<()> {
        let hive = self.hive();
        let key = self.registration_key();
        let cache_dir = self.cache_dir();
        self.store
            .write_string(
                hive,
                &key,
                BUNDLE_CACHE_PATH_VALUE,
                &cache_dir.display().to_string(),
            )
            .context("failed writing bundle cache path")?;

        let Some(arp) = &self.registration.arp else {
            return Ok(());
        };
        self.store
            .write_string(hive, &key, DISPLAY_NAME_VALUE, &arp.display_name)
            .and_then(|()| {
                self.store
                    .write_string(hive, &key, DISPLAY_VERSION_VALUE, &arp.display_version)
            })
            .and_then(|()| match &arp.publisher {
                Some(publisher) => {
                    self.store
                        .write_string(hive, &key, PUBLISHER_VALUE, publisher)
                }
                None => self.store.delete_value(hive, &key, PUBLISHER_VALUE),
            })
            .and_then(|()| {
                self.store.write_string(
                    hive,
                    &key,
                    UNINSTALL_STRING_VALUE,
                    &format!("{} uninstall", quoted(&self.cached_executable_path())),
                )
            })
            .with_context(|| {
                format!(
                    "failed writing programs and features entry for '{}'",
                    self.registration.bundle_id
                )
            })
    }

    fn write_run_entry(&self) -> Result<()> {
        if self.privilege != ProcessPrivilege::User {
            return Ok(());
        }
        self.store
            .write_string(
                Hive::CurrentUser,
                RUN_KEY,
                &self.registration.bundle_id,
                &quoted(&self.cached_executable_path()),
            )
            .context("failed writing run entry")
    }

    fn remove_run_entry(&self) -> Result<()> {
        if self.privilege != ProcessPrivilege::User {
            return Ok(());
        }
        self.store
            .delete_value(Hive::CurrentUser, RUN_KEY, &self.registration.bundle_id)
            .context("failed removing run entry")
    }

    fn cache_bundle_files(&self) -> Result<()> {
        let cache_dir = self.cache_dir();
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed creating bundle cache {}", cache_dir.display()))?;

        if let Some(executable) = &self.source_executable {
            let target = self.cached_executable_path();
            if executable != &target {
                copy_file(executable, &target)?;
            }
        }

        if self.registration.ux_payloads.is_empty() {
            return Ok(());
        }
        let source_dir = self.source_dir.as_deref().ok_or_else(|| {
            anyhow!(
                "bundle '{}' declares UX payloads but no source directory is known",
                self.registration.bundle_id
            )
        })?;
        for name in &self.registration.ux_payloads {
            copy_file(&source_dir.join(name), &cache_dir.join(name))?;
        }
        debug!(path = %cache_dir.display(), "cached bundle files");
        Ok(())
    }

    /// Best effort: files that cannot be deleted are moved under the
    /// pending-delete directory instead of failing the run.
    fn remove_cache_dir(&self) {
        let cache_dir = self.cache_dir();
        match fs::remove_dir_all(&cache_dir) {
            Ok(()) => return,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = %cache_dir.display(), error = %err, "bundle cache not fully removed");
            }
        }

        let pending = self
            .layout
            .pending_delete_dir(self.registration.per_machine)
            .join(format!(
                "{}-{}",
                self.registration.bundle_id,
                unique_suffix()
            ));
        if let Err(err) = move_aside(&cache_dir, &pending) {
            warn!(
                path = %cache_dir.display(),
                pending = %pending.display(),
                error = %err,
                "failed moving bundle cache aside"
            );
        }
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::copy(from, to).with_context(|| {
        format!(
            "failed copying {} to {}",
            from.display(),
            to.display()
        )
    })?;
    Ok(())
}

fn move_aside(dir: &Path, pending: &Path) -> Result<()> {
    fs::create_dir_all(pending)
        .with_context(|| format!("failed creating {}", pending.display()))?;
    for entry in fs::read_dir(dir).with_context(|| format!("failed reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if result.is_err() {
            fs::rename(&path, pending.join(entry.file_name())).with_context(|| {
                format!("failed moving {} to {}", path.display(), pending.display())
            })?;
        }
    }
    fs::remove_dir(dir).with_context(|| format!("failed removing {}", dir.display()))?;
    let _ = fs::remove_dir(pending);
    Ok(())
}

fn quoted(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or_default()
}
