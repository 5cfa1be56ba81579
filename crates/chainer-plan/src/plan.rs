use anyhow::{anyhow, Context, Result};
use chainer_core::{
    ActionState, BufferReader, BufferWriter, BundleAction, PackageIndex, PayloadIndex, Variables,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePlanEntry {
    pub package: PackageIndex,
    pub payload: PayloadIndex,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutePlanEntry {
    pub package: PackageIndex,
    /// True when the driving process executes the entry itself, false when it
    /// is forwarded to the elevated worker.
    pub owned: bool,
    pub action: ActionState,
    pub rollback_action: ActionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevatedPackageState {
    pub package: PackageIndex,
    pub state: Vec<u8>,
}

/// The part of a plan the elevated worker needs, in transport form:
/// serialized properties, per-machine package count, then each package's
/// ordinal and opaque state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElevatedPlan {
    pub variables: Vec<u8>,
    pub packages: Vec<ElevatedPackageState>,
}

impl ElevatedPlan {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BufferWriter::new();
        writer.write_bytes(&self.variables);
        writer.write_u32(self.packages.len() as u32);
        for package in &self.packages {
            writer.write_u32(package.package.get());
            writer.write_bytes(&package.state);
        }
        writer.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = BufferReader::new(bytes);
        let variables = reader
            .read_bytes()
            .context("failed reading elevated plan properties")?;
        let count = reader.read_u32().context("failed reading elevated package count")?;
        let mut packages = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let ordinal = reader.read_u32()?;
            let package = PackageIndex::new(ordinal)
                .ok_or_else(|| anyhow!("elevated plan contains package ordinal 0"))?;
            let state = reader.read_bytes()?;
            packages.push(ElevatedPackageState { package, state });
        }
        if !reader.is_empty() {
            return Err(anyhow!(
                "elevated plan has {} trailing bytes",
                reader.remaining()
            ));
        }
        Ok(Self {
            variables,
            packages,
        })
    }
}

/// Cache and execute operations for one run. Mutable between `begin` and
/// `finalize`; frozen once ready until the next `reset`.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    action: BundleAction,
    package_count: usize,
    registration_declared: bool,
    cache_entries: Vec<CachePlanEntry>,
    execute_entries: Vec<ExecutePlanEntry>,
    elevated_packages: Vec<ElevatedPackageState>,
    elevated_plan: Vec<u8>,
    per_machine_registration: bool,
    ready: bool,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn begin(&mut self, action: BundleAction, package_count: usize, registration_declared: bool) {
        self.reset();
        self.action = action;
        self.package_count = package_count;
        self.registration_declared = registration_declared;
    }

    fn ensure_mutable(&self, index: PackageIndex) -> Result<()> {
        if self.ready {
            return Err(anyhow!("plan is ready and can no longer be modified"));
        }
        if index.get() as usize > self.package_count {
            return Err(anyhow!(
                "package ordinal {} is out of range for a plan of {} packages",
                index.get(),
                self.package_count
            ));
        }
        Ok(())
    }

    pub fn add_cache_entry(
        &mut self,
        package: PackageIndex,
        payload: PayloadIndex,
        size: u64,
    ) -> Result<()> {
        self.ensure_mutable(package)?;
        if self
            .cache_entries
            .iter()
            .any(|entry| entry.package == package && entry.payload == payload)
        {
            return Ok(());
        }
        self.cache_entries.push(CachePlanEntry {
            package,
            payload,
            size,
        });
        Ok(())
    }

    pub fn add_execute_entry(&mut self, entry: ExecutePlanEntry) -> Result<()> {
        self.ensure_mutable(entry.package)?;
        self.execute_entries.push(entry);
        Ok(())
    }

    pub fn add_elevated_package(&mut self, package: PackageIndex, state: Vec<u8>) -> Result<()> {
        self.ensure_mutable(package)?;
        if self.elevated_packages.len() >= self.package_count {
            return Err(anyhow!("elevated plan cannot hold more packages than the bundle"));
        }
        self.elevated_packages.push(ElevatedPackageState { package, state });
        Ok(())
    }

    pub fn mark_per_machine_registration(&mut self) -> Result<()> {
        if self.ready {
            return Err(anyhow!("plan is ready and can no longer be modified"));
        }
        self.per_machine_registration = true;
        Ok(())
    }

    /// Serializes the elevated plan and freezes the plan.
    pub fn finalize(&mut self, variables: &Variables) -> Result<()> {
        if self.ready {
            return Err(anyhow!("plan is already ready"));
        }
        let elevated = ElevatedPlan {
            variables: variables.to_bytes(),
            packages: self.elevated_packages.clone(),
        };
        self.elevated_plan = elevated.encode();
        self.ready = true;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn action(&self) -> BundleAction {
        self.action
    }

    pub fn cache_count(&self) -> usize {
        self.cache_entries.len()
    }

    pub fn execute_count(&self) -> usize {
        self.execute_entries.len()
    }

    pub fn cache_entries(&self) -> &[CachePlanEntry] {
        &self.cache_entries
    }

    pub fn execute_entries(&self) -> &[ExecutePlanEntry] {
        &self.execute_entries
    }

    pub fn elevated_package_count(&self) -> usize {
        self.elevated_packages.len()
    }

    pub fn elevated_plan(&self) -> &[u8] {
        &self.elevated_plan
    }

    pub fn estimated_size(&self) -> u64 {
        self.cache_entries.iter().map(|entry| entry.size).sum()
    }

    pub fn plan_requires_registration(&self) -> bool {
        self.registration_declared && !self.cache_entries.is_empty()
    }

    pub fn requires_per_machine_registration(&self) -> bool {
        self.per_machine_registration
    }

    pub fn requires_elevation(&self) -> bool {
        !self.elevated_packages.is_empty()
            || self.execute_entries.iter().any(|entry| !entry.owned)
    }
}
