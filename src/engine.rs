// src/engine.rs - Sequential interpreter over action sets and units
use crate::{
    actions::{create_action, Action, ActionContext, Completion},
    client::PlcClient,
    config::EngineConfig,
    error::{PlcError, Result},
    project::{ActionSetConfig, ActionUnitConfig, Criticality, ProjectConfig},
    result::{ActionResult, ResultLevel, RunReport, RunStatus},
    timer::TimerRegistry,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stops a running [`Engine`] from any task
#[derive(Clone)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    current: Arc<Mutex<Option<ActionContext>>>,
    background: Arc<Mutex<Vec<ActionContext>>>,
    timers: TimerRegistry,
    client: PlcClient,
}

impl AbortHandle {
    /// Cancel the running unit, every background unit and any pending delay
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Abort requested");
        self.timers.close();
        if let Some(ctx) = lock(&self.current).as_ref() {
            ctx.abort();
        }
        for ctx in lock(&self.background).iter() {
            ctx.abort();
        }
        self.client.stop_scan();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Executes a project against a controller
///
/// Sets run in order, units inside a set run in order, and every step yields
/// an [`ActionResult`]. Unit failures are recorded and handled according to
/// the unit's [`Criticality`]; transport errors end the run.
///
/// An engine runs its project once. An abort closes its timers for good and
/// results accumulate, so a new run needs a new engine.
pub struct Engine {
    project: ProjectConfig,
    client: PlcClient,
    config: EngineConfig,
    running: AtomicBool,
    finished: AtomicBool,
    handle: AbortHandle,
    results: Mutex<Vec<ActionResult>>,
}

/// Where closed results go
struct Sink<'a> {
    tx: Option<UnboundedSender<ActionResult>>,
    results: &'a Mutex<Vec<ActionResult>>,
}

impl Sink<'_> {
    fn emit(&mut self, mut result: ActionResult) {
        result.close();
        if let Some(tx) = &self.tx {
            if tx.send(result.clone()).is_err() {
                debug!("Result receiver dropped");
                self.tx = None;
            }
        }
        lock(self.results).push(result);
    }
}

/// Outcome of one set or unit that did not end the run
enum Step {
    Passed,
    Failed,
}

impl Engine {
    pub fn new(project: ProjectConfig, client: PlcClient, config: EngineConfig) -> Self {
        let handle = AbortHandle {
            aborted: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
            background: Arc::new(Mutex::new(Vec::new())),
            timers: TimerRegistry::new(),
            client: client.clone(),
        };
        Self {
            project,
            client,
            config,
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            handle,
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Results produced so far
    pub fn results(&self) -> Vec<ActionResult> {
        lock(&self.results).clone()
    }

    /// Run every enabled set.
    ///
    /// Results are sent to `tx` as they close. Errors other than unit failures
    /// end the run: the scan is stopped, timers are cancelled, the session is
    /// closed and the error is returned after a final result is recorded.
    pub async fn run(&self, tx: Option<UnboundedSender<ActionResult>>) -> Result<RunReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(PlcError::Validation("Engine is already running".into()));
        }
        if self.finished.swap(true, Ordering::AcqRel) {
            self.running.store(false, Ordering::Release);
            return Err(PlcError::Validation("Engine has already run".into()));
        }
        let run_id = Uuid::new_v4();
        info!(
            "Run {} of project '{}' started ({} sets)",
            run_id,
            self.project.name,
            self.project.action_sets.len()
        );

        let mut sink = Sink {
            tx,
            results: &self.results,
        };
        let mut project_result = ActionResult::begin(
            ResultLevel::Project,
            self.project.id,
            self.project.name.clone(),
            format!("Project '{}'", self.project.name),
        );
        let mut background: Vec<Box<dyn Action>> = Vec::new();

        let outcome = self.run_sets(&mut sink, &mut background).await;
        self.stop_background(&mut background).await;

        let (status, error) = match outcome {
            Ok(Step::Passed) if !self.handle.is_aborted() => (RunStatus::Passed, None),
            Ok(Step::Failed) if !self.handle.is_aborted() => {
                project_result.fail("One or more units failed");
                (RunStatus::Failed, None)
            }
            Ok(_) | Err(PlcError::Aborted) => (RunStatus::Aborted, None),
            Err(PlcError::CriticalAbort(unit)) => {
                project_result.fail(format!("Run stopped by critical unit '{}'", unit));
                (RunStatus::Failed, None)
            }
            Err(e) => (RunStatus::Terminated, Some(e)),
        };

        match (&status, &error) {
            (RunStatus::Aborted, _) => {
                self.shutdown_session().await;
                project_result.fail("Run aborted by user");
            }
            (RunStatus::Terminated, Some(e)) => {
                error!("Run {} terminated: {}", run_id, e);
                self.shutdown_session().await;
                project_result.fail(format!("Run terminated: {}", e));
            }
            _ => {}
        }
        sink.emit(project_result);
        self.running.store(false, Ordering::Release);

        if let Some(e) = error {
            return Err(e);
        }
        let report = RunReport::new(run_id, self.project.name.clone(), status, self.results());
        info!(
            "Run {} finished: {:?} ({} passed, {} failed, {} disabled)",
            run_id, report.status, report.passed, report.failed, report.disabled
        );
        Ok(report)
    }

    async fn run_sets(&self, sink: &mut Sink<'_>, background: &mut Vec<Box<dyn Action>>) -> Result<Step> {
        let mut step = Step::Passed;
        for (index, set) in self.project.action_sets.iter().enumerate() {
            if index > 0 && set.enabled {
                self.pause(self.config.set_delay()).await?;
            }
            if let Step::Failed = self.run_set(set, sink, background).await? {
                step = Step::Failed;
            }
        }
        Ok(step)
    }

    async fn run_set(
        &self,
        set: &ActionSetConfig,
        sink: &mut Sink<'_>,
        background: &mut Vec<Box<dyn Action>>,
    ) -> Result<Step> {
        if !set.enabled {
            debug!("Set '{}' is disabled", set.name);
            sink.emit(ActionResult::skipped(ResultLevel::Set, set.id, set.name.clone()));
            return Ok(Step::Passed);
        }
        self.check_abort()?;

        let mut set_result = ActionResult::begin(
            ResultLevel::Set,
            set.id,
            set.name.clone(),
            format!("Set '{}'", set.name),
        );
        let mut failed = 0;
        let mut outcome = Ok(());
        let mut ran_any = false;

        for unit in &set.units {
            if ran_any && unit.enabled {
                if let Err(e) = self.pause(self.config.unit_delay()).await {
                    outcome = Err(e);
                    break;
                }
            }
            ran_any |= unit.enabled;

            match self.run_unit(unit, sink, background).await {
                Ok(Step::Passed) => {}
                Ok(Step::Failed) => {
                    failed += 1;
                    match unit.criticality {
                        Criticality::None => {}
                        Criticality::Set => {
                            warn!("Unit '{}' is critical for set '{}'; skipping the rest", unit.name, set.name);
                            set_result.fail(format!("Set stopped by critical unit '{}'", unit.name));
                            break;
                        }
                        Criticality::Project => {
                            outcome = Err(PlcError::CriticalAbort(unit.name.clone()));
                            break;
                        }
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if failed > 0 {
            set_result.fail(format!("{} unit(s) failed", failed));
        }
        if let Err(e) = &outcome {
            set_result.fail(e.to_string());
        }
        sink.emit(set_result);

        outcome.map(|_| if failed > 0 { Step::Failed } else { Step::Passed })
    }

    async fn run_unit(
        &self,
        unit: &ActionUnitConfig,
        sink: &mut Sink<'_>,
        background: &mut Vec<Box<dyn Action>>,
    ) -> Result<Step> {
        if !unit.enabled {
            debug!("Unit '{}' is disabled", unit.name);
            sink.emit(ActionResult::skipped(ResultLevel::Unit, unit.id, unit.name.clone()));
            return Ok(Step::Passed);
        }
        self.check_abort()?;

        let mut result = ActionResult::begin(
            ResultLevel::Unit,
            unit.id,
            unit.name.clone(),
            format!("{} '{}'", unit.kind.type_name(), unit.name),
        );

        let mut action = match create_action(unit) {
            Ok(action) => action,
            Err(e) if e.is_unit_failure() => {
                warn!("Unit '{}' rejected: {}", unit.name, e);
                result.fail(e.to_string());
                sink.emit(result);
                return Ok(Step::Failed);
            }
            Err(e) => return Err(e),
        };
        if let Some(condition) = action.pass_condition(self.client.tags()) {
            result.set_pass_condition(condition);
        }

        let ctx = ActionContext::new(
            self.client.clone(),
            Duration::from_millis(self.config.tolerance_ms),
            self.config.scan_rate(),
        );
        *lock(&self.handle.current) = Some(ctx.clone());
        if self.handle.is_aborted() {
            ctx.abort();
        }

        info!("Running {} unit '{}'", action.action_type(), unit.name);
        let outcome = action.execute(&ctx).await;
        *lock(&self.handle.current) = None;

        match outcome {
            Ok(Completion::Done) => {
                sink.emit(result);
                Ok(Step::Passed)
            }
            Ok(Completion::Background) => {
                result.set_message(format!("{} '{}' running in background", unit.kind.type_name(), unit.name));
                sink.emit(result);
                lock(&self.handle.background).push(ctx);
                background.push(action);
                Ok(Step::Passed)
            }
            Err(e) if e.is_unit_failure() => {
                warn!("Unit '{}' failed: {}", unit.name, e);
                result.fail(e.to_string());
                sink.emit(result);
                Ok(Step::Failed)
            }
            Err(e) => {
                result.fail(e.to_string());
                sink.emit(result);
                Err(e)
            }
        }
    }

    /// Cancellable pause between steps
    async fn pause(&self, duration: Duration) -> Result<()> {
        self.check_abort()?;
        if duration.is_zero() || self.handle.timers.sleep(duration).await {
            Ok(())
        } else {
            Err(PlcError::Aborted)
        }
    }

    fn check_abort(&self) -> Result<()> {
        if self.handle.is_aborted() {
            Err(PlcError::Aborted)
        } else {
            Ok(())
        }
    }

    async fn stop_background(&self, background: &mut Vec<Box<dyn Action>>) {
        let contexts: Vec<ActionContext> = lock(&self.handle.background).drain(..).collect();
        for ctx in &contexts {
            ctx.abort();
        }
        for mut action in background.drain(..) {
            action.shutdown().await;
            debug!("Background unit '{}' stopped", action.name());
        }
    }

    /// Best-effort teardown after an abort or a fatal error
    async fn shutdown_session(&self) {
        self.client.stop_scan();
        self.handle.timers.cancel_all();
        if let Err(e) = self.client.close().await {
            warn!("Closing the session failed: {}", e);
        }
    }
}
