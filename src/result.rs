// src/result.rs - Run results and final report
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// What a result describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultLevel {
    Project,
    Set,
    Unit,
}

/// Outcome of one project, set or unit
///
/// Opened when the step begins and closed when it ends. A closed result only
/// accepts additional error text.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub id: u32,
    pub level: ResultLevel,
    pub name: String,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub pass_condition: Option<String>,
    pub disabled: bool,
}

impl ActionResult {
    pub fn begin(level: ResultLevel, id: u32, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            level,
            name: name.into(),
            message: message.into(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            pass_condition: None,
            disabled: false,
        }
    }

    /// Already closed result for a skipped set or unit
    pub fn skipped(level: ResultLevel, id: u32, name: impl Into<String>) -> Self {
        let name = name.into();
        let mut result = Self::begin(level, id, name.clone(), format!("{} is disabled", name));
        result.disabled = true;
        result.close();
        result
    }

    pub fn set_pass_condition(&mut self, condition: impl Into<String>) {
        if !self.is_closed() {
            self.pass_condition = Some(condition.into());
        }
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        if !self.is_closed() {
            self.message = message.into();
        }
    }

    /// Record a failure; text is appended to any earlier error
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.error = Some(match self.error.take() {
            Some(previous) => format!("{}; {}", previous, error),
            None => error,
        });
    }

    pub fn close(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn passed(&self) -> bool {
        !self.disabled && self.error.is_none()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every enabled unit passed
    Passed,
    /// At least one unit failed
    Failed,
    /// Stopped by [`Engine::abort`](crate::engine::Engine::abort)
    Aborted,
    /// Ended by an error that escaped a unit
    Terminated,
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub project: String,
    pub status: RunStatus,
    pub results: Vec<ActionResult>,
    pub passed: usize,
    pub failed: usize,
    pub disabled: usize,
}

impl RunReport {
    pub fn new(run_id: Uuid, project: impl Into<String>, status: RunStatus, results: Vec<ActionResult>) -> Self {
        let units = results.iter().filter(|r| r.level == ResultLevel::Unit);
        let (mut passed, mut failed, mut disabled) = (0, 0, 0);
        for result in units {
            if result.disabled {
                disabled += 1;
            } else if result.error.is_some() {
                failed += 1;
            } else {
                passed += 1;
            }
        }
        Self {
            run_id,
            project: project.into(),
            status,
            results,
            passed,
            failed,
            disabled,
        }
    }

    /// Unit-level results, in execution order
    pub fn units(&self) -> impl Iterator<Item = &ActionResult> {
        self.results.iter().filter(|r| r.level == ResultLevel::Unit)
    }

    /// Result of a unit by id
    pub fn unit(&self, id: u32) -> Option<&ActionResult> {
        self.units().find(|r| r.id == id)
    }
}
