// src/tag.rs - Tag model and shared tag table
use crate::{
    address::TagAddress,
    error::{PlcError, Result},
    project::TagConfig,
    value::{DataType, Value},
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

/// Identifier of a tag inside a project
pub type TagId = u32;

/// Write staged on a tag until the controller confirms it
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PendingWrite {
    pub value: Value,
    /// Bit to modify; `None` writes the whole value
    pub bit: Option<u8>,
}

/// A controller memory location under test
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub data_type: DataType,
    pub description: Option<String>,
    /// Last value read or written
    pub value: Value,
    /// Value before the last mutation
    pub previous: Value,
    /// Target of an in-flight write
    pub pending: Option<PendingWrite>,
    address: TagAddress,
}

impl Tag {
    /// Build a tag from its descriptor, resolving its address
    pub fn new(config: &TagConfig) -> Result<Self> {
        let address = TagAddress::parse(&config.name, config.program.as_deref())?;
        if let Some(bit) = address.bit_index() {
            config.data_type.check_bit(bit)?;
        }
        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            data_type: config.data_type,
            description: config.description.clone(),
            value: Value::default(),
            previous: Value::default(),
            pending: None,
            address,
        })
    }

    pub fn address(&self) -> &TagAddress {
        &self.address
    }

    /// Bit addressed by the tag name itself
    pub fn bit_index(&self) -> Option<u8> {
        self.address.bit_index()
    }

    /// Current value seen through an optional bit
    pub fn value_at(&self, bit: Option<u8>) -> Value {
        match bit {
            Some(b) if self.bit_index().is_none() => self.value.bit(b),
            _ => self.value,
        }
    }

    /// Store a freshly decoded whole value, reducing it to the tag's own bit
    pub fn accept_read(&mut self, whole: Value) {
        let value = match self.bit_index() {
            Some(bit) => whole.bit(bit),
            None => whole,
        };
        trace!("Tag {} read {}", self.name, value);
        self.previous = self.value;
        self.value = value;
    }

    /// Stage a write; an explicit bit overrides the one in the tag name
    pub fn stage_write(&mut self, value: Value, bit: Option<u8>) {
        self.pending = Some(PendingWrite {
            value,
            bit: bit.or(self.bit_index()),
        });
    }

    /// Commit the staged write after the controller acknowledged it
    pub fn accept_write(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let value = match (pending.bit, self.bit_index()) {
            (Some(_), Some(_)) => Value::Int(i64::from(pending.value.as_int() != 0)),
            (Some(bit), None) => {
                self.data_type
                    .apply_bit(&self.value, bit, pending.value.as_int() != 0)
            }
            (None, _) => pending.value,
        };
        trace!("Tag {} wrote {}", self.name, value);
        self.previous = self.value;
        self.value = value;
    }
}

/// Thread-safe table of the project's tags
///
/// Cloning is cheap; all clones share the same tags. Mutation happens only
/// from inside scheduler jobs, so a tag never has two writers at once.
///
/// # Examples
///
/// ```rust
/// use vesta::{TagTable, Value};
/// use vesta::project::TagConfig;
/// use vesta::value::DataType;
///
/// let table = TagTable::new();
/// table.insert_config(&TagConfig::new(1, "Counter", DataType::Dint))?;
///
/// let mut tag = table.get(1)?;
/// tag.accept_read(Value::Int(42));
/// table.store(tag);
/// assert_eq!(table.get(1)?.value, Value::Int(42));
/// # Ok::<(), vesta::PlcError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct TagTable {
    tags: Arc<DashMap<TagId, Tag>>,
}

impl TagTable {
    pub fn new() -> Self {
        Self {
            tags: Arc::new(DashMap::new()),
        }
    }

    /// Build the table for a whole project
    pub fn from_configs(configs: &[TagConfig]) -> Result<Self> {
        let table = Self::new();
        for config in configs {
            table.insert_config(config)?;
        }
        Ok(table)
    }

    pub fn insert_config(&self, config: &TagConfig) -> Result<()> {
        let tag = Tag::new(config)?;
        if self.tags.contains_key(&tag.id) {
            return Err(PlcError::Config(format!("Duplicate tag id {}", tag.id)));
        }
        self.tags.insert(tag.id, tag);
        Ok(())
    }

    /// Snapshot of a tag
    pub fn get(&self, id: TagId) -> Result<Tag> {
        self.tags
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(PlcError::TagNotFound(id))
    }

    /// Snapshot of several tags, in the requested order
    pub fn get_many(&self, ids: &[TagId]) -> Result<Vec<Tag>> {
        ids.iter().map(|id| self.get(*id)).collect()
    }

    /// Write a tag snapshot back
    pub fn store(&self, tag: Tag) {
        self.tags.insert(tag.id, tag);
    }

    pub fn store_many(&self, tags: Vec<Tag>) {
        for tag in tags {
            self.store(tag);
        }
    }

    pub fn contains(&self, id: TagId) -> bool {
        self.tags.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<TagId> {
        let mut ids: Vec<TagId> = self.tags.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dint(id: TagId, name: &str) -> TagConfig {
        TagConfig::new(id, name, DataType::Dint)
    }

    #[test]
    fn test_table_basic() {
        let table = TagTable::from_configs(&[dint(1, "a"), dint(2, "b")]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.ids(), vec![1, 2]);
        assert!(matches!(table.get(3), Err(PlcError::TagNotFound(3))));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = TagTable::new();
        table.insert_config(&dint(1, "a")).unwrap();
        assert!(table.insert_config(&dint(1, "b")).is_err());
    }

    #[test]
    fn test_name_bit_out_of_range() {
        let err = Tag::new(&TagConfig::new(1, "Flags.20", DataType::Int)).unwrap_err();
        assert_eq!(err.to_string(), "Requested bit 20 is out of range for INT type");
    }

    #[test]
    fn test_read_reduces_to_name_bit() {
        let mut tag = Tag::new(&dint(1, "Status.3")).unwrap();
        tag.accept_read(Value::Int(0b1000));
        assert_eq!(tag.value, Value::Int(1));
        tag.accept_read(Value::Int(0b0111));
        assert_eq!(tag.value, Value::Int(0));
        assert_eq!(tag.previous, Value::Int(1));
    }

    #[test]
    fn test_masked_write_updates_whole_value() {
        let mut tag = Tag::new(&dint(1, "dint0")).unwrap();
        tag.accept_read(Value::Int(3333));
        tag.stage_write(Value::Int(1), Some(3));
        tag.accept_write();
        assert_eq!(tag.value, Value::Int(3341));
        assert_eq!(tag.previous, Value::Int(3333));
        assert!(tag.pending.is_none());
    }

    #[test]
    fn test_value_at_bit() {
        let mut tag = Tag::new(&dint(1, "dint0")).unwrap();
        tag.accept_read(Value::Int(3341));
        assert_eq!(tag.value_at(Some(3)), Value::Int(1));
        assert_eq!(tag.value_at(Some(4)), Value::Int(0));
        assert_eq!(tag.value_at(None), Value::Int(3341));
    }
}
