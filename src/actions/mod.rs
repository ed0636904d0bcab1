//! Action units executed by the engine
//!
//! Every unit type implements [`Action`]. Units are built from their project
//! descriptor by [`create_action`], which also rejects invalid parameters
//! before anything touches the controller:
//! - `log`: record a message
//! - `set_values` / `check_values`: write or verify a list of tags
//! - `heartbeat`: keep toggling tags at a fixed period
//! - `reset_value`: set tags and restore them after a delay
//! - `sleep`: wait
//! - `unit_test`: set inputs and time the reaction of other tags

use crate::{
    client::PlcClient,
    error::{PlcError, Result},
    project::{ActionKind, ActionUnitConfig, TagAction},
    tag::{Tag, TagId, TagTable},
    timer::TimerRegistry,
    value::Value,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod heartbeat;
pub mod log;
pub mod reset;
pub mod sleep;
pub mod values;

// ============================================================================
// CORE ACTION TRAIT
// ============================================================================

/// How a unit left [`Action::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Nothing of the unit is left running
    Done,
    /// The unit keeps working in the background until the run ends
    Background,
}

/// A typed test step
#[async_trait]
pub trait Action: Send {
    /// Run the unit
    ///
    /// Validation and comparison failures come back as
    /// [`PlcError::Validation`] / [`PlcError::Mismatch`]; the engine turns them
    /// into result text.
    async fn execute(&mut self, ctx: &ActionContext) -> Result<Completion>;

    fn name(&self) -> &str;

    fn action_type(&self) -> &str;

    /// Human readable statement of what passing means
    fn pass_condition(&self, _tags: &TagTable) -> Option<String> {
        None
    }

    /// Stop anything left running in the background and wait for it
    async fn shutdown(&mut self) {}
}

/// Build a unit from its descriptor
pub fn create_action(config: &ActionUnitConfig) -> Result<Box<dyn Action>> {
    if config.name.is_empty() {
        return Err(PlcError::Validation(format!("Unit {} has no name", config.id)));
    }
    debug!("Creating {} unit '{}'", config.kind.type_name(), config.name);

    match &config.kind {
        ActionKind::Log { message } => log::create_log_action(&config.name, message),
        ActionKind::SetValues { values } => values::create_set_values_action(&config.name, values),
        ActionKind::CheckValues { values } => {
            values::create_check_values_action(&config.name, values)
        }
        ActionKind::Heartbeat {
            toggles,
            duration_s,
        } => heartbeat::create_heartbeat_action(&config.name, toggles, *duration_s),
        ActionKind::ResetValue { toggles } => reset::create_reset_value_action(&config.name, toggles),
        ActionKind::Sleep { seconds } => sleep::create_sleep_action(&config.name, *seconds),
        ActionKind::UnitTest {
            inputs,
            expected,
            unchanged,
            post,
        } => unit_test::create_unit_test_action(&config.name, inputs, expected, unchanged, post),
    }
}

// ============================================================================
// EXECUTION CONTEXT
// ============================================================================

/// What a running unit may use
///
/// Each unit gets its own timers and cancellation token; aborting the context
/// resolves every pending timer of the unit at once.
#[derive(Clone)]
pub struct ActionContext {
    pub client: PlcClient,
    pub timers: TimerRegistry,
    pub cancel: CancellationToken,
    /// Slack allowed around expected change times
    pub tolerance: Duration,
    /// Cadence of scans started by the unit
    pub scan_rate: Duration,
}

impl ActionContext {
    pub fn new(client: PlcClient, tolerance: Duration, scan_rate: Duration) -> Self {
        Self {
            client,
            timers: TimerRegistry::new(),
            cancel: CancellationToken::new(),
            tolerance,
            scan_rate,
        }
    }

    pub fn tags(&self) -> &TagTable {
        self.client.tags()
    }

    /// Cancel the unit's token and every timer it has or will start
    pub fn abort(&self) {
        self.cancel.cancel();
        self.timers.close();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellable wait
    pub async fn delay(&self, duration: Duration) -> Result<()> {
        if self.timers.sleep(duration).await {
            Ok(())
        } else {
            Err(PlcError::Aborted)
        }
    }
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// A tag addressed by one [`TagAction`], with its bit validated
#[derive(Debug, Clone)]
pub struct Target {
    pub tag: Tag,
    pub bit: Option<u8>,
}

impl Target {
    pub fn resolve(tags: &TagTable, action: &TagAction) -> Result<Self> {
        let tag = tags.get(action.tag_id)?;
        let bit = action.bit()?;
        if let Some(bit) = bit {
            tag.data_type.check_bit(bit)?;
        }
        Ok(Self { tag, bit })
    }

    pub fn resolve_all(tags: &TagTable, actions: &[TagAction]) -> Result<Vec<Self>> {
        actions.iter().map(|a| Self::resolve(tags, a)).collect()
    }

    pub fn id(&self) -> TagId {
        self.tag.id
    }

    fn is_single_bit(&self) -> bool {
        self.bit.is_some() || self.tag.bit_index().is_some()
    }

    /// Value to write for a configured number
    pub fn value(&self, raw: f64) -> Value {
        if self.is_single_bit() {
            Value::Int(i64::from(raw != 0.0))
        } else {
            self.tag.data_type.coerce(raw)
        }
    }

    /// Configured number as it will be compared against reads
    pub fn expected(&self, raw: f64) -> f64 {
        if self.is_single_bit() {
            f64::from(u8::from(raw != 0.0))
        } else {
            raw
        }
    }

    /// View of a fresh snapshot of the same tag
    pub fn read(&self, tag: &Tag) -> Value {
        tag.value_at(self.bit)
    }

    pub fn label(&self) -> String {
        match self.bit {
            Some(bit) if self.tag.bit_index().is_none() => format!("{} bit {}", self.tag.name, bit),
            _ => self.tag.name.clone(),
        }
    }
}

/// Label used in pass conditions, tolerating unknown tags
pub(crate) fn label(tags: &TagTable, action: &TagAction) -> String {
    let name = tags
        .get(action.tag_id)
        .map(|t| t.name)
        .unwrap_or_else(|_| format!("tag #{}", action.tag_id));
    if action.bit_no >= 0 {
        format!("{} bit {}", name, action.bit_no)
    } else {
        name
    }
}

/// Seconds from a descriptor as a duration; negative and invalid become zero
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Deduplicated tag ids, first occurrence order
pub(crate) fn unique_ids<'a>(targets: impl IntoIterator<Item = &'a Target>) -> Vec<TagId> {
    let mut ids = Vec::new();
    for target in targets {
        if !ids.contains(&target.id()) {
            ids.push(target.id());
        }
    }
    ids
}

/// Find a snapshot by id in a batch read result
pub(crate) fn find(tags: &[Tag], id: TagId) -> Result<&Tag> {
    tags.iter()
        .find(|t| t.id == id)
        .ok_or(PlcError::TagNotFound(id))
}
