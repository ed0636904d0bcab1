// src/actions/reset.rs - Set tags and restore them after a delay
use super::{find, label, seconds, unique_ids, Action, ActionContext, Completion, Target};
use crate::{
    error::{PlcError, Result},
    project::TagAction,
    tag::TagTable,
    value::Value,
};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct ResetValueAction {
    name: String,
    toggles: Vec<TagAction>,
}

#[async_trait]
impl Action for ResetValueAction {
    async fn execute(&mut self, ctx: &ActionContext) -> Result<Completion> {
        let targets = Target::resolve_all(ctx.tags(), &self.toggles)?;
        let current = ctx.client.read_tags(&unique_ids(&targets)).await?;

        let mut restores: Vec<(&Target, Value, f64)> = Vec::with_capacity(targets.len());
        for (target, toggle) in targets.iter().zip(&self.toggles) {
            let remembered = target.read(find(&current, target.id())?);
            restores.push((target, remembered, toggle.after_s));
        }

        let start = Instant::now();
        for (target, toggle) in targets.iter().zip(&self.toggles) {
            ctx.client
                .write_tag(target.id(), target.bit, target.value(toggle.to_value))
                .await?;
        }

        // Restore in deadline order; the unit ends with the longest delay.
        restores.sort_by(|a, b| a.2.total_cmp(&b.2));
        let mut aborted = false;
        for (target, remembered, after_s) in restores {
            if !aborted {
                let deadline = start + seconds(after_s);
                let wait = deadline.saturating_duration_since(Instant::now());
                aborted = !ctx.timers.sleep(wait).await;
                if aborted {
                    warn!("[{}] aborted, restoring remaining tags now", self.name);
                }
            }
            debug!("[{}] restoring {} to {}", self.name, target.label(), remembered);
            ctx.client
                .write_tag(target.id(), target.bit, remembered)
                .await?;
        }

        if aborted {
            Err(PlcError::Aborted)
        } else {
            Ok(Completion::Done)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn action_type(&self) -> &str {
        "reset_value"
    }

    fn pass_condition(&self, tags: &TagTable) -> Option<String> {
        let parts: Vec<String> = self
            .toggles
            .iter()
            .map(|t| {
                format!(
                    "{} set to {} and restored after {}s",
                    label(tags, t),
                    t.to_value,
                    t.after_s
                )
            })
            .collect();
        Some(parts.join(", "))
    }
}

pub fn create_reset_value_action(name: &str, toggles: &[TagAction]) -> Result<Box<dyn Action>> {
    if let Some(bad) = toggles.iter().find(|t| !t.after_s.is_finite() || t.after_s < 0.0) {
        return Err(PlcError::Validation(format!(
            "Reset delay must be a non-negative number of seconds, but got {}s",
            bad.after_s
        )));
    }
    Ok(Box::new(ResetValueAction {
        name: name.to_string(),
        toggles: toggles.to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PlcClient;
    use crate::config::SchedulerConfig;
    use crate::project::TagConfig;
    use crate::protocols::{Controller, Simulator};
    use crate::scheduler::Scheduler;
    use crate::value::DataType;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_restores_each_tag_after_its_delay() {
        let tags = TagTable::from_configs(&[
            TagConfig::new(1, "a", DataType::Int),
            TagConfig::new(2, "b", DataType::Int),
        ])
        .unwrap();
        let sim = Simulator::new();
        sim.open("127.0.0.1", 0, Duration::from_secs(1)).await.unwrap();
        sim.set("a", Value::Int(10));
        sim.set("b", Value::Int(20));
        let client = PlcClient::new(
            Arc::new(sim.clone()),
            Scheduler::new(&SchedulerConfig::default()),
            tags,
        );
        let ctx = ActionContext::new(client, Duration::from_millis(100), Duration::from_millis(100));

        let mut reset = create_reset_value_action(
            "pulse",
            &[TagAction::new(1, 1.0).after(2.0), TagAction::new(2, 2.0).after(1.0)],
        )
        .unwrap();

        let start = Instant::now();
        reset.execute(&ctx).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(sim.get("a"), Some(Value::Int(10)));
        assert_eq!(sim.get("b"), Some(Value::Int(20)));

        let b_writes = sim.writes_to("b");
        assert_eq!(b_writes.len(), 2);
        assert_eq!(b_writes[1].at - b_writes[0].at, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_restores_remaining_tags_at_once() {
        let tags = TagTable::from_configs(&[
            TagConfig::new(1, "a", DataType::Int),
            TagConfig::new(2, "b", DataType::Int),
        ])
        .unwrap();
        let sim = Simulator::new();
        sim.open("127.0.0.1", 0, Duration::from_secs(1)).await.unwrap();
        sim.set("a", Value::Int(10));
        sim.set("b", Value::Int(20));
        let client = PlcClient::new(
            Arc::new(sim.clone()),
            Scheduler::new(&SchedulerConfig::default()),
            tags,
        );
        let ctx = ActionContext::new(client, Duration::from_millis(100), Duration::from_millis(100));

        let mut reset = create_reset_value_action(
            "pulse",
            &[TagAction::new(1, 1.0).after(1.0), TagAction::new(2, 2.0).after(10.0)],
        )
        .unwrap();
        let aborter = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            aborter.abort();
        });

        let start = Instant::now();
        let err = reset.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, PlcError::Aborted));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(sim.get("a"), Some(Value::Int(10)));
        assert_eq!(sim.get("b"), Some(Value::Int(20)));

        let a_writes = sim.writes_to("a");
        assert_eq!(a_writes[1].at - start, Duration::from_secs(1));
        let b_writes = sim.writes_to("b");
        assert_eq!(b_writes.len(), 2);
        assert_eq!(b_writes[1].at - start, Duration::from_secs(3));
    }

    #[test]
    fn test_negative_delay_rejected() {
        assert!(create_reset_value_action("r", &[TagAction::new(1, 1.0).after(-1.0)]).is_err());
    }
}
