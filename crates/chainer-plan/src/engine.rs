use anyhow::{anyhow, Context, Result};
use chainer_core::{
    ActionState, BufferReader, BufferWriter, CurrentState, Package, PackageKind, Variables,
};
use semver::Version;

use crate::actions::plan_package_actions;
use crate::exit_code::PackageOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub state: CurrentState,
    pub installed_version: Option<Version>,
}

impl Detection {
    pub fn present() -> Self {
        Self {
            state: CurrentState::Present,
            installed_version: None,
        }
    }

    pub fn absent() -> Self {
        Self {
            state: CurrentState::Absent,
            installed_version: None,
        }
    }
}

/// Per-kind detection and execution. Implementations live beside the
/// concrete installer technology.
pub trait PackageEngine {
    fn kind(&self) -> PackageKind;

    fn detect(&self, package: &Package, variables: &Variables) -> Result<Detection>;

    fn plan(&self, package: &Package, _variables: &Variables) -> Result<(ActionState, ActionState)> {
        plan_package_actions(package)
    }

    fn execute(
        &self,
        package: &Package,
        action: ActionState,
        variables: &Variables,
        rollback: bool,
    ) -> Result<PackageOutcome>;

    fn serialize_elevated_state(&self, package: &Package, writer: &mut BufferWriter) -> Result<()> {
        write_package_state(package, writer);
        Ok(())
    }

    fn deserialize_elevated_state(
        &self,
        package: &mut Package,
        reader: &mut BufferReader<'_>,
    ) -> Result<()> {
        read_package_state(package, reader)
    }
}

pub fn write_package_state(package: &Package, writer: &mut BufferWriter) {
    writer
        .write_u32(package.index.get())
        .write_u32(package.current_state.as_u32())
        .write_u32(package.execute_action.as_u32())
        .write_u32(package.rollback_action.as_u32())
        .write_bool(package.cached)
        .write_string(
            &package
                .installed_version
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        );
}

pub fn read_package_state(package: &mut Package, reader: &mut BufferReader<'_>) -> Result<()> {
    let ordinal = reader.read_u32()?;
    if ordinal != package.index.get() {
        return Err(anyhow!(
            "elevated state for package ordinal {ordinal} was applied to '{}' ({})",
            package.id,
            package.index
        ));
    }
    package.current_state = CurrentState::from_u32(reader.read_u32()?)?;
    package.execute_action = ActionState::from_u32(reader.read_u32()?)?;
    package.rollback_action = ActionState::from_u32(reader.read_u32()?)?;
    package.cached = reader.read_bool()?;
    let version = reader.read_string()?;
    package.installed_version = if version.is_empty() {
        None
    } else {
        Some(
            Version::parse(&version)
                .with_context(|| format!("invalid installed version '{version}'"))?,
        )
    };
    Ok(())
}

/// One engine per package kind.
#[derive(Default)]
pub struct PackageEngines {
    engines: Vec<Box<dyn PackageEngine>>,
}

impl PackageEngines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Box<dyn PackageEngine>) -> &mut Self {
        self.engines.retain(|existing| existing.kind() != engine.kind());
        self.engines.push(engine);
        self
    }

    pub fn with(mut self, engine: Box<dyn PackageEngine>) -> Self {
        self.register(engine);
        self
    }

    pub fn get(&self, kind: PackageKind) -> Result<&dyn PackageEngine> {
        self.engines
            .iter()
            .find(|engine| engine.kind() == kind)
            .map(|engine| &**engine)
            .ok_or_else(|| anyhow!("no package engine registered for {} packages", kind.as_str()))
    }
}
