// src/actions/heartbeat.rs - Periodic tag toggling
use super::{label, seconds, Action, ActionContext, Completion, Target};
use crate::{
    client::PlcClient,
    error::{PlcError, Result},
    project::TagAction,
    tag::{TagId, TagTable},
    timer::TimerRegistry,
    value::Value,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest accepted toggle period in seconds
pub const MIN_PULSE_S: f64 = 0.5;

/// Keeps one pulsar per toggled tag alive
///
/// With a duration the unit completes when it elapses; without one it stays
/// in the background until the engine shuts it down.
pub struct HeartbeatAction {
    name: String,
    toggles: Vec<TagAction>,
    duration: Option<Duration>,
    pulsars: JoinSet<()>,
    stop: CancellationToken,
}

impl HeartbeatAction {
    async fn stop_pulsars(&mut self) {
        self.stop.cancel();
        while let Some(joined) = self.pulsars.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    warn!("[{}] pulsar ended abnormally: {}", self.name, e);
                }
            }
        }
    }
}

#[async_trait]
impl Action for HeartbeatAction {
    async fn execute(&mut self, ctx: &ActionContext) -> Result<Completion> {
        let targets = Target::resolve_all(ctx.tags(), &self.toggles)?;
        self.stop = ctx.cancel.child_token();

        for (target, toggle) in targets.iter().zip(&self.toggles) {
            let pulsar = Pulsar {
                client: ctx.client.clone(),
                timers: ctx.timers.clone(),
                stop: self.stop.clone(),
                tag_id: target.id(),
                label: target.label(),
                bit: target.bit,
                high: target.value(toggle.to_value),
                low: target.value(toggle.from_value),
                period: seconds(toggle.after_s),
            };
            self.pulsars.spawn(pulsar.run());
        }
        info!("[{}] pulsing {} tag(s)", self.name, self.toggles.len());

        match self.duration {
            Some(duration) => {
                let elapsed = ctx.timers.sleep(duration).await;
                self.stop_pulsars().await;
                if elapsed {
                    Ok(Completion::Done)
                } else {
                    Err(PlcError::Aborted)
                }
            }
            None => Ok(Completion::Background),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn action_type(&self) -> &str {
        "heartbeat"
    }

    fn pass_condition(&self, tags: &TagTable) -> Option<String> {
        let parts: Vec<String> = self
            .toggles
            .iter()
            .map(|t| {
                format!(
                    "{} toggles between {} and {} every {}s",
                    label(tags, t),
                    t.to_value,
                    t.from_value,
                    t.after_s
                )
            })
            .collect();
        Some(parts.join(", "))
    }

    async fn shutdown(&mut self) {
        if !self.pulsars.is_empty() {
            debug!("[{}] stopping {} pulsar(s)", self.name, self.pulsars.len());
        }
        self.stop_pulsars().await;
    }
}

/// One periodic writer
struct Pulsar {
    client: PlcClient,
    timers: TimerRegistry,
    stop: CancellationToken,
    tag_id: TagId,
    label: String,
    bit: Option<u8>,
    high: Value,
    low: Value,
    period: Duration,
}

impl Pulsar {
    async fn run(self) {
        let mut next = self.high;
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            // Failures stay here; the next period tries again.
            if let Err(e) = self.client.write_tag(self.tag_id, self.bit, next).await {
                warn!("Heartbeat write to {} failed: {}", self.label, e);
            }
            next = if next == self.high { self.low } else { self.high };

            let elapsed = tokio::select! {
                _ = self.stop.cancelled() => false,
                elapsed = self.timers.sleep(self.period) => elapsed,
            };
            if !elapsed {
                break;
            }
        }
        debug!("Pulsar for {} stopped", self.label);
    }
}

pub fn create_heartbeat_action(
    name: &str,
    toggles: &[TagAction],
    duration_s: Option<f64>,
) -> Result<Box<dyn Action>> {
    for toggle in toggles {
        if !toggle.after_s.is_finite() || toggle.after_s < MIN_PULSE_S {
            return Err(PlcError::Validation(format!(
                "Heartbeat pulse must be greater or equal than {}s, but got {}s",
                MIN_PULSE_S, toggle.after_s
            )));
        }
    }
    if let Some(duration) = duration_s.filter(|d| !d.is_finite() || *d < 0.0) {
        return Err(PlcError::Validation(format!(
            "Heartbeat duration must be a non-negative number of seconds, but got {}s",
            duration
        )));
    }
    Ok(Box::new(HeartbeatAction {
        name: name.to_string(),
        toggles: toggles.to_vec(),
        duration: duration_s.map(seconds),
        pulsars: JoinSet::new(),
        stop: CancellationToken::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::project::TagConfig;
    use crate::protocols::{Controller, Simulator};
    use crate::scheduler::Scheduler;
    use crate::value::DataType;
    use std::sync::Arc;
    use tokio::time::Instant;

    async fn context(sim: &Simulator) -> ActionContext {
        let tags = TagTable::from_configs(&[
            TagConfig::new(1, "a", DataType::Bool),
            TagConfig::new(2, "b", DataType::Bool),
        ])
        .unwrap();
        sim.open("127.0.0.1", 0, Duration::from_secs(1)).await.unwrap();
        sim.set("a", Value::Int(0));
        sim.set("b", Value::Int(0));
        let client = PlcClient::new(
            Arc::new(sim.clone()),
            Scheduler::new(&SchedulerConfig::default()),
            tags,
        );
        ActionContext::new(client, Duration::from_millis(100), Duration::from_millis(100))
    }

    #[test]
    fn test_short_pulse_rejected() {
        let err = create_heartbeat_action("hb", &[TagAction::new(1, 1.0).after(0.2)], None)
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Heartbeat pulse must be greater or equal than 0.5s, but got 0.2s"
        );
    }

    #[test]
    fn test_minimum_pulse_accepted() {
        assert!(create_heartbeat_action("hb", &[TagAction::new(1, 1.0).after(0.5)], Some(1.0)).is_ok());
    }

    #[test]
    fn test_non_finite_pulse_rejected() {
        for after in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let res = create_heartbeat_action("hb", &[TagAction::new(1, 1.0).after(after)], None);
            assert!(matches!(res, Err(PlcError::Validation(_))), "after_s = {}", after);
        }
    }

    #[test]
    fn test_bad_duration_rejected() {
        let pulse = [TagAction::new(1, 1.0).after(0.5)];
        for duration in [f64::INFINITY, f64::NAN, -1.0] {
            let res = create_heartbeat_action("hb", &pulse, Some(duration));
            assert!(matches!(res, Err(PlcError::Validation(_))), "duration_s = {}", duration);
        }
        assert!(create_heartbeat_action("hb", &pulse, Some(0.0)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_duration_completes() {
        let sim = Simulator::new();
        let ctx = context(&sim).await;
        let mut heartbeat =
            create_heartbeat_action("hb", &[TagAction::new(1, 1.0).after(0.5)], Some(2.0)).unwrap();

        let start = Instant::now();
        assert_eq!(heartbeat.execute(&ctx).await.unwrap(), Completion::Done);
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        let pulses = sim.writes_to("a");
        assert!(pulses.len() >= 4, "{} pulses", pulses.len());
        assert_eq!(pulses[0].value, Value::Int(1));
        assert_eq!(pulses[1].value, Value::Int(0));
        assert_eq!(pulses[1].at - pulses[0].at, Duration::from_millis(500));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sim.writes_to("a").len(), pulses.len());
        assert_eq!(ctx.timers.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_every_pulsar() {
        let sim = Simulator::new();
        let ctx = context(&sim).await;
        let mut heartbeat = create_heartbeat_action(
            "hb",
            &[TagAction::new(1, 1.0).after(0.5), TagAction::new(2, 1.0).after(0.7)],
            Some(30.0),
        )
        .unwrap();

        let aborter = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            aborter.abort();
        });

        let start = Instant::now();
        let err = heartbeat.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, PlcError::Aborted));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(ctx.timers.active(), 0);

        let aborted_at = start + Duration::from_millis(1200);
        let before = sim.writes().len();
        assert!(sim.writes_to("a").len() >= 3);
        assert!(sim.writes_to("b").len() >= 2);
        assert!(sim.writes().iter().all(|w| w.at <= aborted_at));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sim.writes().len(), before);
    }
}
