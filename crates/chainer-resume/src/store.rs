use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hive {
    CurrentUser,
    LocalMachine,
}

impl Hive {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CurrentUser => "HKCU",
            Self::LocalMachine => "HKLM",
        }
    }
}

/// Registry failures callers need to branch on.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry path not found: {0}")]
    NotFound(String),

    #[error("access denied to registry path: {0}")]
    AccessDenied(String),

    #[error("invalid registry data at {path}: {reason}")]
    InvalidData { path: String, reason: String },

    #[error("registry I/O failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}

/// Hierarchical key/value store with the semantics of the Windows registry.
/// Keys are backslash-separated paths below a hive.
pub trait RegistryStore {
    fn read_u32(&self, hive: Hive, key: &str, name: &str) -> Result<u32, RegistryError>;

    fn read_string(&self, hive: Hive, key: &str, name: &str) -> Result<String, RegistryError>;

    fn write_u32(&self, hive: Hive, key: &str, name: &str, value: u32)
        -> Result<(), RegistryError>;

    fn write_string(
        &self,
        hive: Hive,
        key: &str,
        name: &str,
        value: &str,
    ) -> Result<(), RegistryError>;

    fn key_exists(&self, hive: Hive, key: &str) -> Result<bool, RegistryError>;

    /// Creates a key that does not survive a reboot.
    fn create_volatile_key(&self, hive: Hive, key: &str) -> Result<(), RegistryError>;

    /// Deletes a key and everything below it. Missing keys are not an error.
    fn delete_key(&self, hive: Hive, key: &str) -> Result<(), RegistryError>;

    /// Missing values are not an error.
    fn delete_value(&self, hive: Hive, key: &str, name: &str) -> Result<(), RegistryError>;
}

const DWORD_SUFFIX: &str = "dword";
const STRING_SUFFIX: &str = "sz";
const PERSISTENT_DIR: &str = "persistent";
const VOLATILE_DIR: &str = "volatile";

#[cfg(target_os = "linux")]
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// File-backed registry: keys are directories and values are files named
/// `<value>.dword` or `<value>.sz`. Volatile keys live under a directory
/// named after the boot they were written in, so a restart leaves them
/// behind.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    root: PathBuf,
    volatile_root: PathBuf,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>, volatile_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            volatile_root: volatile_root.into(),
        }
    }

    /// Persistent keys under `root/persistent`, volatile ones under
    /// `root/volatile/<boot_id>`.
    pub fn for_boot(root: impl AsRef<Path>, boot_id: &str) -> Result<Self, RegistryError> {
        let root = root.as_ref();
        let volatile_dir = root.join(VOLATILE_DIR);
        if !is_boot_id(boot_id) {
            return Err(RegistryError::InvalidData {
                path: volatile_dir.display().to_string(),
                reason: format!("invalid boot id '{boot_id}'"),
            });
        }
        Ok(Self::new(root.join(PERSISTENT_DIR), volatile_dir.join(boot_id)))
    }

    /// Registry whose volatile keys belong to the running boot. Directories
    /// left by earlier boots are removed.
    pub fn for_current_boot(root: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let root = root.as_ref();
        let boot_id = current_boot_id()?;
        let registry = Self::for_boot(root, &boot_id)?;
        prune_other_boots(&root.join(VOLATILE_DIR), &boot_id);
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volatile_root(&self) -> &Path {
        &self.volatile_root
    }

    /// Drops every volatile key, as a machine restart would.
    pub fn simulate_reboot(&self) -> Result<(), RegistryError> {
        match fs::remove_dir_all(&self.volatile_root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io(&self.volatile_root, err)),
        }
    }

    fn key_dir(&self, base: &Path, hive: Hive, key: &str) -> Result<PathBuf, RegistryError> {
        let mut path = base.join(hive.as_str());
        for segment in key.split('\\').filter(|segment| !segment.is_empty()) {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => path.push(segment),
                _ => {
                    return Err(RegistryError::InvalidData {
                        path: display_key(hive, key),
                        reason: format!("invalid key segment '{segment}'"),
                    });
                }
            }
        }
        Ok(path)
    }

    fn value_path(
        &self,
        hive: Hive,
        key: &str,
        name: &str,
        suffix: &str,
    ) -> Result<PathBuf, RegistryError> {
        if name.is_empty() || name.contains(['\\', '/']) || name == "." || name == ".." {
            return Err(RegistryError::InvalidData {
                path: display_key(hive, key),
                reason: format!("invalid value name '{name}'"),
            });
        }
        Ok(self
            .key_dir(&self.root, hive, key)?
            .join(format!("{name}.{suffix}")))
    }

    fn read_value(
        &self,
        hive: Hive,
        key: &str,
        name: &str,
        suffix: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let path = self.value_path(hive, key, name, suffix)?;
        fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => {
                RegistryError::NotFound(format!("{}\\{name}", display_key(hive, key)))
            }
            _ => map_io(&path, err),
        })
    }

    fn write_value(
        &self,
        hive: Hive,
        key: &str,
        name: &str,
        suffix: &str,
        bytes: &[u8],
    ) -> Result<(), RegistryError> {
        let path = self.value_path(hive, key, name, suffix)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| map_io(parent, err))?;
        }
        fs::write(&path, bytes).map_err(|err| map_io(&path, err))
    }
}

impl RegistryStore for FileRegistry {
    fn read_u32(&self, hive: Hive, key: &str, name: &str) -> Result<u32, RegistryError> {
        let bytes = self.read_value(hive, key, name, DWORD_SUFFIX)?;
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| RegistryError::InvalidData {
                path: format!("{}\\{name}", display_key(hive, key)),
                reason: format!("expected 4 bytes, found {}", bytes.len()),
            })?;
        Ok(u32::from_le_bytes(raw))
    }

    fn read_string(&self, hive: Hive, key: &str, name: &str) -> Result<String, RegistryError> {
        let bytes = self.read_value(hive, key, name, STRING_SUFFIX)?;
        String::from_utf8(bytes).map_err(|err| RegistryError::InvalidData {
            path: format!("{}\\{name}", display_key(hive, key)),
            reason: err.to_string(),
        })
    }

    fn write_u32(
        &self,
        hive: Hive,
        key: &str,
        name: &str,
        value: u32,
    ) -> Result<(), RegistryError> {
        self.write_value(hive, key, name, DWORD_SUFFIX, &value.to_le_bytes())
    }

    fn write_string(
        &self,
        hive: Hive,
        key: &str,
        name: &str,
        value: &str,
    ) -> Result<(), RegistryError> {
        self.write_value(hive, key, name, STRING_SUFFIX, value.as_bytes())
    }

    fn key_exists(&self, hive: Hive, key: &str) -> Result<bool, RegistryError> {
        for base in [&self.root, &self.volatile_root] {
            let dir = self.key_dir(base, hive, key)?;
            match fs::metadata(&dir) {
                Ok(metadata) if metadata.is_dir() => return Ok(true),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(map_io(&dir, err)),
            }
        }
        Ok(false)
    }

    fn create_volatile_key(&self, hive: Hive, key: &str) -> Result<(), RegistryError> {
        let dir = self.key_dir(&self.volatile_root, hive, key)?;
        fs::create_dir_all(&dir).map_err(|err| map_io(&dir, err))
    }

    fn delete_key(&self, hive: Hive, key: &str) -> Result<(), RegistryError> {
        for base in [&self.root, &self.volatile_root] {
            let dir = self.key_dir(base, hive, key)?;
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(map_io(&dir, err)),
            }
        }
        Ok(())
    }

    fn delete_value(&self, hive: Hive, key: &str, name: &str) -> Result<(), RegistryError> {
        for suffix in [DWORD_SUFFIX, STRING_SUFFIX] {
            let path = self.value_path(hive, key, name, suffix)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(map_io(&path, err)),
            }
        }
        Ok(())
    }
}

fn prune_other_boots(volatile_dir: &Path, boot_id: &str) {
    let Ok(entries) = fs::read_dir(volatile_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name() == boot_id {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "removed volatile keys of an earlier boot"),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "stale volatile keys not removed")
            }
        }
    }
}

fn is_boot_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(target_os = "linux")]
fn current_boot_id() -> Result<String, RegistryError> {
    let raw = fs::read_to_string(BOOT_ID_PATH).map_err(|err| map_io(Path::new(BOOT_ID_PATH), err))?;
    Ok(raw.trim().to_string())
}

/// BSD kernels report the boot time instead of a boot id.
#[cfg(all(unix, not(target_os = "linux")))]
fn current_boot_id() -> Result<String, RegistryError> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", "kern.boottime"])
        .output()
        .map_err(|err| map_io(Path::new("sysctl"), err))?;
    let text = String::from_utf8_lossy(&output.stdout);
    parse_boot_time(&text)
        .map(|seconds| format!("boot-{seconds}"))
        .ok_or_else(|| RegistryError::InvalidData {
            path: "kern.boottime".to_string(),
            reason: format!("unrecognised boot time '{}'", text.trim()),
        })
}

#[cfg(not(unix))]
fn current_boot_id() -> Result<String, RegistryError> {
    Err(RegistryError::NotFound(
        "boot identity is not available on this platform".to_string(),
    ))
}

/// Seconds from `{ sec = 1700000000, usec = 0 } ...`.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub(crate) fn parse_boot_time(text: &str) -> Option<u64> {
    let rest = &text[text.find("sec =")? + "sec =".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn display_key(hive: Hive, key: &str) -> String {
    format!("{}\\{key}", hive.as_str())
}

fn map_io(path: &Path, err: io::Error) -> RegistryError {
    let display = path.display().to_string();
    match err.kind() {
        io::ErrorKind::NotFound => RegistryError::NotFound(display),
        io::ErrorKind::PermissionDenied => RegistryError::AccessDenied(display),
        _ => RegistryError::Io {
            path: display,
            source: err,
        },
    }
}
