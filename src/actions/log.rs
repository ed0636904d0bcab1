// src/actions/log.rs - Message-only unit
use super::{Action, ActionContext, Completion};
use crate::{error::Result, tag::TagTable};
use async_trait::async_trait;
use tracing::info;

pub struct LogAction {
    name: String,
    message: String,
}

#[async_trait]
impl Action for LogAction {
    async fn execute(&mut self, _ctx: &ActionContext) -> Result<Completion> {
        info!("[{}] {}", self.name, self.message);
        Ok(Completion::Done)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn action_type(&self) -> &str {
        "log"
    }

    fn pass_condition(&self, _tags: &TagTable) -> Option<String> {
        Some(self.message.clone())
    }
}

pub fn create_log_action(name: &str, message: &str) -> Result<Box<dyn Action>> {
    Ok(Box::new(LogAction {
        name: name.to_string(),
        message: message.to_string(),
    }))
}
