// src/actions/sleep.rs - Cancellable wait
use super::{seconds, Action, ActionContext, Completion};
use crate::{
    error::{PlcError, Result},
    tag::TagTable,
};
use async_trait::async_trait;
use std::time::Duration;

pub struct SleepAction {
    name: String,
    duration: Duration,
    seconds: f64,
}

#[async_trait]
impl Action for SleepAction {
    async fn execute(&mut self, ctx: &ActionContext) -> Result<Completion> {
        ctx.delay(self.duration).await?;
        Ok(Completion::Done)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn action_type(&self) -> &str {
        "sleep"
    }

    fn pass_condition(&self, _tags: &TagTable) -> Option<String> {
        Some(format!("Wait {}s", self.seconds))
    }
}

pub fn create_sleep_action(name: &str, secs: f64) -> Result<Box<dyn Action>> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(PlcError::Validation(format!(
            "Sleep time must be a non-negative number of seconds, but got {}s",
            secs
        )));
    }
    Ok(Box::new(SleepAction {
        name: name.to_string(),
        duration: seconds(secs),
        seconds: secs,
    }))
}
