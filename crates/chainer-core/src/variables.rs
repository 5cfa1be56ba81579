use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};

use crate::buffer::{BufferReader, BufferWriter};

pub const VARIABLE_BUNDLE_ID: &str = "BundleId";
pub const VARIABLE_BUNDLE_ACTION: &str = "BundleAction";
pub const VARIABLE_PRIVILEGED: &str = "Privileged";

const TYPE_NONE: u32 = 0;
const TYPE_NUMERIC: u32 = 1;
const TYPE_STRING: u32 = 2;
const TYPE_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableValue {
    None,
    Numeric(i64),
    String(String),
    /// Four 16-bit fields packed major-first into a u64.
    Version(u64),
}

impl VariableValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Numeric(value) => *value != 0,
            Self::String(value) => !value.is_empty(),
            Self::Version(value) => *value != 0,
        }
    }

    fn type_tag(&self) -> u32 {
        match self {
            Self::None => TYPE_NONE,
            Self::Numeric(_) => TYPE_NUMERIC,
            Self::String(_) => TYPE_STRING,
            Self::Version(_) => TYPE_VERSION,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Numeric(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
            Self::Version(value) => f.write_str(&format_version(*value)),
        }
    }
}

pub fn pack_version(major: u16, minor: u16, build: u16, revision: u16) -> u64 {
    (u64::from(major) << 48) | (u64::from(minor) << 32) | (u64::from(build) << 16) | u64::from(revision)
}

pub fn parse_version(raw: &str) -> Result<u64> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let mut fields = [0_u16; 4];
    let parts = trimmed.split('.').collect::<Vec<_>>();
    if parts.is_empty() || parts.len() > 4 {
        return Err(anyhow!("invalid version: {raw}"));
    }
    for (slot, part) in parts.iter().enumerate() {
        fields[slot] = part
            .parse::<u16>()
            .with_context(|| format!("invalid version field '{part}' in '{raw}'"))?;
    }
    Ok(pack_version(fields[0], fields[1], fields[2], fields[3]))
}

pub fn format_version(packed: u64) -> String {
    format!(
        "{}.{}.{}.{}",
        (packed >> 48) & 0xFFFF,
        (packed >> 32) & 0xFFFF,
        (packed >> 16) & 0xFFFF,
        packed & 0xFFFF
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Variable {
    value: VariableValue,
    built_in: bool,
}

/// Bundle variable store. Built-in variables are owned by the engine and are
/// never written to the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: BTreeMap<String, Variable>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_built_in(&mut self, name: &str, value: VariableValue) {
        self.entries.insert(
            name.to_string(),
            Variable {
                value,
                built_in: true,
            },
        );
    }

    pub fn set(&mut self, name: &str, value: VariableValue) -> Result<()> {
        if self.is_built_in(name) {
            return Err(anyhow!("built-in variable '{name}' cannot be overwritten"));
        }
        self.entries.insert(
            name.to_string(),
            Variable {
                value,
                built_in: false,
            },
        );
        Ok(())
    }

    pub fn set_numeric(&mut self, name: &str, value: i64) -> Result<()> {
        self.set(name, VariableValue::Numeric(value))
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.set(name, VariableValue::String(value.into()))
    }

    pub fn set_version(&mut self, name: &str, packed: u64) -> Result<()> {
        self.set(name, VariableValue::Version(packed))
    }

    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.entries.get(name).map(|variable| &variable.value)
    }

    pub fn get_numeric(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            VariableValue::Numeric(value) => Some(*value),
            VariableValue::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(ToString::to_string)
    }

    pub fn is_built_in(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|variable| variable.built_in)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariableValue)> {
        self.entries
            .iter()
            .map(|(name, variable)| (name.as_str(), &variable.value))
    }

    /// State-file layout: total count, then per variable an included flag and,
    /// for persisted variables only, name, type tag and tagged value.
    pub fn serialize(&self, writer: &mut BufferWriter) {
        writer.write_u32(self.entries.len() as u32);
        for (name, variable) in &self.entries {
            let included = !variable.built_in;
            writer.write_bool(included);
            if !included {
                continue;
            }
            writer.write_string(name);
            writer.write_u32(variable.value.type_tag());
            match &variable.value {
                VariableValue::None => {}
                VariableValue::Numeric(value) => {
                    writer.write_u64(*value as u64);
                }
                VariableValue::Version(value) => {
                    writer.write_u64(*value);
                }
                VariableValue::String(value) => {
                    writer.write_string(value);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BufferWriter::new();
        self.serialize(&mut writer);
        writer.into_bytes()
    }

    /// Loads persisted variables over the current set. Built-ins already
    /// present are kept.
    pub fn deserialize(&mut self, reader: &mut BufferReader<'_>) -> Result<()> {
        let count = reader.read_u32().context("failed reading variable count")?;
        for _ in 0..count {
            if !reader.read_bool().context("failed reading variable flag")? {
                continue;
            }
            let name = reader.read_string().context("failed reading variable name")?;
            let value = match reader.read_u32()? {
                TYPE_NONE => VariableValue::None,
                TYPE_NUMERIC => VariableValue::Numeric(reader.read_u64()? as i64),
                TYPE_STRING => VariableValue::String(reader.read_string()?),
                TYPE_VERSION => VariableValue::Version(reader.read_u64()?),
                other => return Err(anyhow!("invalid type tag {other} for variable '{name}'")),
            };
            if self.is_built_in(&name) {
                continue;
            }
            self.entries.insert(
                name,
                Variable {
                    value,
                    built_in: false,
                },
            );
        }
        Ok(())
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let mut reader = BufferReader::new(bytes);
        self.deserialize(&mut reader)
    }
}
