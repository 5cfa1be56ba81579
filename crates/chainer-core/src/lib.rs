pub mod buffer;
pub mod condition;
mod layout;
mod manifest;
mod package;
mod registration;
pub mod section;
pub mod status;
pub mod variables;

pub use buffer::{BufferReader, BufferWriter};
pub use condition::evaluate_condition;
pub use layout::{default_cache_layout, CacheLayout, STATE_FILE_NAME};
pub use manifest::BundleManifest;
pub use package::{
    ActionState, CurrentState, EmbeddedPayload, ExitCodeBehavior, ExitCodeMatch, ExitCodeRule,
    Package, PackageCommands, PackageIndex, PackageKind, Packages, Payload, PayloadIndex,
    RequestState,
};
pub use section::{read_bundle_section, BundleSection};
pub use registration::{ArpRegistration, BundleAction, Registration};
pub use variables::{VariableValue, Variables};
