//! Resume registry: the durable record of where a bundle run stands.

mod registry;
mod store;

pub use registry::{
    ProcessPrivilege, ResumeMode, ResumeRegistry, ResumeType, REBOOT_REQUIRED_SUBKEY,
    RESUME_VALUE, RUN_KEY, UNINSTALL_KEY_ROOT,
};
pub use store::{FileRegistry, Hive, RegistryError, RegistryStore};
