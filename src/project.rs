// src/project.rs - Project, tag and action descriptors
//
// These are the plain structures handed over by the persistence side. They
// carry no behavior beyond parsing and light structural checks.

use crate::{
    error::{PlcError, Result},
    tag::TagId,
    value::DataType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

// ============================================================================
// PROJECT
// ============================================================================

/// Complete test project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tags: Vec<TagConfig>,
    #[serde(default)]
    pub action_sets: Vec<ActionSetConfig>,
}

impl ProjectConfig {
    /// Load a project from a `.yaml`/`.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let project: Self = serde_yaml::from_str(text)?;
        project.validate()?;
        Ok(project)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let project: Self = serde_json::from_str(text)?;
        project.validate()?;
        Ok(project)
    }

    /// Structural checks: unique tag ids
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for tag in &self.tags {
            if !seen.insert(tag.id) {
                return Err(PlcError::Config(format!(
                    "Project '{}' defines tag id {} twice",
                    self.name, tag.id
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TAGS
// ============================================================================

/// Tag descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub id: TagId,
    pub name: String,
    #[serde(default)]
    pub program: Option<String>,
    pub data_type: DataType,
    #[serde(default)]
    pub description: Option<String>,
}

impl TagConfig {
    pub fn new(id: TagId, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id,
            name: name.into(),
            program: None,
            data_type,
            description: None,
        }
    }

    pub fn in_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }
}

// ============================================================================
// ACTIONS
// ============================================================================

/// Ordered group of units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSetConfig {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub units: Vec<ActionUnitConfig>,
}

impl ActionSetConfig {
    pub fn new(id: u32, name: impl Into<String>, units: Vec<ActionUnitConfig>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            units,
        }
    }
}

/// What a unit failure does to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Record the failure and go on
    #[default]
    None,
    /// Skip the remaining units of the set
    Set,
    /// Stop the whole run
    Project,
}

/// Single typed test step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionUnitConfig {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub criticality: Criticality,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl ActionUnitConfig {
    pub fn new(id: u32, name: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            criticality: Criticality::None,
            kind,
        }
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Type-specific parameters of a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Log {
        message: String,
    },
    SetValues {
        values: Vec<TagAction>,
    },
    CheckValues {
        values: Vec<TagAction>,
    },
    Heartbeat {
        toggles: Vec<TagAction>,
        /// Total run time; pulses until the run ends when absent
        #[serde(default)]
        duration_s: Option<f64>,
    },
    ResetValue {
        toggles: Vec<TagAction>,
    },
    Sleep {
        seconds: f64,
    },
    UnitTest {
        #[serde(default)]
        inputs: Vec<TagAction>,
        #[serde(default)]
        expected: Vec<TagAction>,
        /// Tags that must keep their value; `after_s` is the watch window
        #[serde(default)]
        unchanged: Vec<TagAction>,
        /// Writes performed after inputs have been restored
        #[serde(default)]
        post: Vec<TagAction>,
    },
}

impl ActionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionKind::Log { .. } => "log",
            ActionKind::SetValues { .. } => "set_values",
            ActionKind::CheckValues { .. } => "check_values",
            ActionKind::Heartbeat { .. } => "heartbeat",
            ActionKind::ResetValue { .. } => "reset_value",
            ActionKind::Sleep { .. } => "sleep",
            ActionKind::UnitTest { .. } => "unit_test",
        }
    }
}

/// Per-tag parameters shared by every unit type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagAction {
    pub tag_id: TagId,
    /// Bit to address, `-1` for the whole value
    #[serde(default = "default_bit")]
    pub bit_no: i32,
    #[serde(default)]
    pub to_value: f64,
    #[serde(default)]
    pub from_value: f64,
    #[serde(default)]
    pub after_s: f64,
}

impl TagAction {
    pub fn new(tag_id: TagId, to_value: f64) -> Self {
        Self {
            tag_id,
            bit_no: -1,
            to_value,
            from_value: 0.0,
            after_s: 0.0,
        }
    }

    pub fn with_bit(mut self, bit: i32) -> Self {
        self.bit_no = bit;
        self
    }

    pub fn with_from(mut self, from_value: f64) -> Self {
        self.from_value = from_value;
        self
    }

    pub fn after(mut self, seconds: f64) -> Self {
        self.after_s = seconds;
        self
    }

    /// Bit position, `None` for the whole value
    pub fn bit(&self) -> Result<Option<u8>> {
        match self.bit_no {
            b if b < 0 => Ok(None),
            b => u8::try_from(b)
                .map(Some)
                .map_err(|_| PlcError::Validation(format!("Invalid bit number {}", b))),
        }
    }
}

fn default_true() -> bool { true }
fn default_bit() -> i32 { -1 }
