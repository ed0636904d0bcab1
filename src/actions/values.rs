// src/actions/values.rs - Set and check tag values
use super::{find, label, unique_ids, Action, ActionContext, Completion, Target};
use crate::{
    error::{PlcError, Result},
    project::TagAction,
    tag::TagTable,
};
use async_trait::async_trait;
use tracing::{debug, warn};

// ============================================================================
// SET VALUES
// ============================================================================

/// Writes every listed value, in order
pub struct SetValuesAction {
    name: String,
    values: Vec<TagAction>,
}

#[async_trait]
impl Action for SetValuesAction {
    async fn execute(&mut self, ctx: &ActionContext) -> Result<Completion> {
        // Validate everything before the first write.
        let targets = Target::resolve_all(ctx.tags(), &self.values)?;

        for (target, action) in targets.iter().zip(&self.values) {
            let value = target.value(action.to_value);
            debug!("[{}] {} <- {}", self.name, target.label(), value);
            ctx.client.write_tag(target.id(), target.bit, value).await?;
        }
        Ok(Completion::Done)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn action_type(&self) -> &str {
        "set_values"
    }

    fn pass_condition(&self, tags: &TagTable) -> Option<String> {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|a| format!("{} set to {}", label(tags, a), a.to_value))
            .collect();
        Some(parts.join(", "))
    }
}

pub fn create_set_values_action(name: &str, values: &[TagAction]) -> Result<Box<dyn Action>> {
    Ok(Box::new(SetValuesAction {
        name: name.to_string(),
        values: values.to_vec(),
    }))
}

// ============================================================================
// CHECK VALUES
// ============================================================================

/// Reads every listed tag in one batch and compares
pub struct CheckValuesAction {
    name: String,
    values: Vec<TagAction>,
}

#[async_trait]
impl Action for CheckValuesAction {
    async fn execute(&mut self, ctx: &ActionContext) -> Result<Completion> {
        let targets = Target::resolve_all(ctx.tags(), &self.values)?;
        let tags = ctx.client.read_tags(&unique_ids(&targets)).await?;

        let mut mismatches = Vec::new();
        for (target, action) in targets.iter().zip(&self.values) {
            let actual = target.read(find(&tags, target.id())?);
            let expected = target.expected(action.to_value);
            if !actual.matches(expected) {
                mismatches.push(format!(
                    "{} is {} when expected {}",
                    target.label(),
                    actual,
                    expected
                ));
            }
        }

        if mismatches.is_empty() {
            Ok(Completion::Done)
        } else {
            warn!("[{}] {} value(s) mismatched", self.name, mismatches.len());
            Err(PlcError::Mismatch(mismatches.join("; ")))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn action_type(&self) -> &str {
        "check_values"
    }

    fn pass_condition(&self, tags: &TagTable) -> Option<String> {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|a| format!("{} is {}", label(tags, a), a.to_value))
            .collect();
        Some(parts.join(", "))
    }
}

pub fn create_check_values_action(name: &str, values: &[TagAction]) -> Result<Box<dyn Action>> {
    Ok(Box::new(CheckValuesAction {
        name: name.to_string(),
        values: values.to_vec(),
    }))
}
