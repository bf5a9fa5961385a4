//! [`TaskManager`] – the plan execution loop.
//!
//! Plans enter a FIFO queue through [`add_task`][TaskManager::add_task],
//! which rejects any plan naming an action the registry does not know.
//! [`drain`][TaskManager::drain] pops plans one at a time and walks their
//! steps in order.  Each step gets a bounded number of attempts with
//! linearly increasing backoff; a step that exhausts its attempts is logged
//! to a bounded recent-failures ring and handed to the
//! [`CorrectionPlanner`].  A non-empty correction replaces the failed step
//! in place, so execution runs the correction steps and then continues with
//! the step after the failed one; a declined correction aborts the whole
//! plan.
//!
//! Persistent steps (flagged on the step, or whose action name is in
//! [`PERSISTENT_ACTIONS`]) block the loop after their first success until
//! the stop flag is raised or the handler's completion poll fires.
//!
//! [`stop_current_task`][TaskManager::stop_current_task] is the cooperative
//! stop: it clears the queue, raises a flag checked between attempts and
//! during persistent waits, and issues best-effort actuator cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use pilot_kernel::CancelFlag;
use pilot_types::{FailureRecord, PilotError, Priority, TaskPlan, TaskStep};
use tracing::{debug, info, warn};

use crate::correction::CorrectionPlanner;
use crate::dispatch::{ActionRegistry, Actuator};
use crate::goal_manager::{GoalProposal, GoalSource};

/// Actions that hold the actuator indefinitely once started.  Steps using
/// these are treated as persistent even without the explicit flag.
pub const PERSISTENT_ACTIONS: &[&str] = &["follow", "guard", "patrol"];

/// Tunables for the execution loop.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Attempts per step before correction is requested.
    pub max_attempts: u32,
    /// Backoff after attempt `n` is `backoff_base * n`.
    pub backoff_base: Duration,
    /// Poll interval for persistent-step completion.
    pub persistent_poll: Duration,
    /// Capacity of the recent-failures ring.
    pub failure_log_cap: usize,
    /// Failures younger than this feed the forbidden-action hint.
    pub forbidden_window: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            persistent_poll: Duration::from_millis(250),
            failure_log_cap: 20,
            forbidden_window: Duration::from_secs(60),
        }
    }
}

/// Queue, retry, and correction machinery for multi-step plans.
pub struct TaskManager {
    registry: Arc<ActionRegistry>,
    actuator: Arc<dyn Actuator>,
    planner: Arc<dyn CorrectionPlanner>,
    config: TaskManagerConfig,
    queue: Mutex<VecDeque<TaskPlan>>,
    processing: AtomicBool,
    stop_flag: CancelFlag,
    failures: Mutex<VecDeque<FailureRecord>>,
}

impl TaskManager {
    pub fn new(
        registry: Arc<ActionRegistry>,
        actuator: Arc<dyn Actuator>,
        planner: Arc<dyn CorrectionPlanner>,
        config: TaskManagerConfig,
    ) -> Self {
        Self {
            registry,
            actuator,
            planner,
            config,
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            stop_flag: CancelFlag::new(),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a plan for execution on behalf of `requester` (the operator or
    /// subsystem that asked for it; recorded for tracing only).
    ///
    /// # Errors
    ///
    /// [`PilotError::UnknownAction`] if any step names an unregistered
    /// action.  The whole plan is rejected; nothing is queued.
    pub fn add_task(&self, plan: TaskPlan, requester: &str) -> Result<(), PilotError> {
        if let Some(step) = plan.steps.iter().find(|s| !self.registry.contains(&s.action)) {
            return Err(PilotError::UnknownAction(step.action.clone()));
        }
        info!(
            plan = %plan.description,
            steps = plan.steps.len(),
            requester,
            "plan queued"
        );
        self.queue.lock().expect("task queue poisoned").push_back(plan);
        Ok(())
    }

    /// Number of plans waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.lock().expect("task queue poisoned").len()
    }

    /// `true` while [`drain`][Self::drain] is running a plan.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// `true` if there is anything to do: a running plan or a queued one.
    pub fn is_busy(&self) -> bool {
        self.is_processing() || self.queued() > 0
    }

    /// Snapshot of the recent-failures ring, oldest first.
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        self.failures
            .lock()
            .expect("failure log poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Execute queued plans until the queue is empty or `external` is
    /// raised.  Re-entrant calls return immediately; only one drain runs at
    /// a time.  Plan failures are logged here, never propagated.
    pub async fn drain(&self, external: &CancelFlag) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        loop {
            if external.is_raised() {
                break;
            }
            let Some(plan) = self.queue.lock().expect("task queue poisoned").pop_front() else {
                break;
            };
            let description = plan.description.clone();
            match self.run_plan(plan, external).await {
                Ok(()) => info!(plan = %description, "plan completed"),
                Err(e) => warn!(plan = %description, error = %e, "plan aborted"),
            }
        }
        self.processing.store(false, Ordering::Release);
    }

    /// Clear the queue, raise the cooperative stop flag, and issue
    /// best-effort actuator cancellation.
    pub async fn stop_current_task(&self) {
        let dropped = {
            let mut queue = self.queue.lock().expect("task queue poisoned");
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.stop_flag.raise();
        info!(dropped, "task stop requested");
        self.actuator.halt().await;
        self.actuator.clear_controls().await;
    }

    fn stopped(&self, external: &CancelFlag) -> bool {
        self.stop_flag.is_raised() || external.is_raised()
    }

    async fn run_plan(&self, plan: TaskPlan, external: &CancelFlag) -> Result<(), PilotError> {
        self.stop_flag.reset();
        info!(plan = %plan.description, "plan started");
        let mut remaining: VecDeque<TaskStep> = plan.steps.iter().cloned().collect();
        while let Some(step) = remaining.pop_front() {
            if self.stopped(external) {
                return Err(PilotError::PlanAborted("stop requested".to_string()));
            }
            match self.run_step(&step, external).await {
                Ok(()) => {}
                Err(e @ PilotError::PlanAborted(_)) => return Err(e),
                Err(e) => {
                    let record = self.record_failure(&step, &e);
                    let correction = self.request_correction(&plan, &record).await?;
                    // Replace the failed step: correction steps run first,
                    // then the step after the failed one.
                    for corrective in correction.steps.into_iter().rev() {
                        remaining.push_front(corrective);
                    }
                }
            }
        }
        Ok(())
    }

    /// One step, up to `max_attempts` tries.  `Ok` after the first success
    /// (including any persistent wait); the final attempt's error otherwise.
    async fn run_step(&self, step: &TaskStep, external: &CancelFlag) -> Result<(), PilotError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.stopped(external) {
                return Err(PilotError::PlanAborted("stop requested".to_string()));
            }
            match self.registry.dispatch(&step.action, &step.params).await {
                Ok(outcome) => {
                    debug!(action = %step.action, attempt, message = %outcome.message, "step ok");
                    if self.is_persistent(step) {
                        self.wait_persistent(step, external).await;
                    }
                    return Ok(());
                }
                Err(e) if attempt < self.config.max_attempts => {
                    warn!(action = %step.action, attempt, error = %e, "step failed; retrying");
                    tokio::time::sleep(self.config.backoff_base * attempt).await;
                }
                Err(e) => {
                    warn!(action = %step.action, attempt, error = %e, "step failed; retries exhausted");
                    return Err(e);
                }
            }
        }
    }

    fn is_persistent(&self, step: &TaskStep) -> bool {
        step.persistent || PERSISTENT_ACTIONS.contains(&step.action.as_str())
    }

    /// Hold the loop until the stop flag fires or the handler reports the
    /// persistent action complete.
    async fn wait_persistent(&self, step: &TaskStep, external: &CancelFlag) {
        info!(action = %step.action, "persistent step holding");
        loop {
            if self.stopped(external) {
                return;
            }
            if self.registry.persistent_done(&step.action, &step.params) {
                debug!(action = %step.action, "persistent step complete");
                return;
            }
            tokio::time::sleep(self.config.persistent_poll).await;
        }
    }

    fn record_failure(&self, step: &TaskStep, error: &PilotError) -> FailureRecord {
        let record = FailureRecord {
            action: step.action.clone(),
            params: step.params.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
        };
        let mut failures = self.failures.lock().expect("failure log poisoned");
        failures.push_back(record.clone());
        while failures.len() > self.config.failure_log_cap {
            failures.pop_front();
        }
        record
    }

    /// Action names that failed within the forbidden window, deduplicated.
    fn forbidden_actions(&self) -> Vec<String> {
        let window = chrono::Duration::from_std(self.config.forbidden_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - window;
        let failures = self.failures.lock().expect("failure log poisoned");
        let mut names: Vec<String> = Vec::new();
        for record in failures.iter().filter(|r| r.timestamp >= cutoff) {
            if !names.contains(&record.action) {
                names.push(record.action.clone());
            }
        }
        names
    }

    /// Ask the planner for a correction; a declined or invalid correction
    /// aborts the plan.
    async fn request_correction(
        &self,
        plan: &TaskPlan,
        record: &FailureRecord,
    ) -> Result<TaskPlan, PilotError> {
        let forbidden = self.forbidden_actions();
        let available: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let Some(correction) = self
            .planner
            .plan(plan, record, &forbidden, &available)
            .await
        else {
            warn!(action = %record.action, "no correction available");
            return Err(PilotError::PlanAborted(format!(
                "no correction for failed action '{}'",
                record.action
            )));
        };
        if let Some(step) = correction
            .steps
            .iter()
            .find(|s| !self.registry.contains(&s.action))
        {
            warn!(action = %step.action, "correction names an unknown action");
            return Err(PilotError::PlanAborted(format!(
                "correction names unknown action '{}'",
                step.action
            )));
        }
        info!(
            action = %record.action,
            steps = correction.steps.len(),
            "correction plan accepted"
        );
        Ok(correction)
    }
}

/// Goal-source adapter: bids [`Priority::Task`] whenever plans are queued
/// or running, so the arbitration loop grants the actuator to task work.
pub struct TaskQueueSource {
    manager: Arc<TaskManager>,
}

impl TaskQueueSource {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

impl GoalSource for TaskQueueSource {
    fn name(&self) -> &str {
        "task_queue"
    }

    fn propose(&mut self) -> Result<Option<GoalProposal>, PilotError> {
        if !self.manager.is_busy() {
            return Ok(None);
        }
        let runner = Arc::clone(&self.manager);
        let stopper = Arc::clone(&self.manager);
        Ok(Some(
            GoalProposal::new(
                "task_queue",
                Priority::Task,
                "execute queued task plans",
                move |cancel| async move {
                    runner.drain(&cancel).await;
                    Ok(())
                },
            )
            .with_stop(move || async move { stopper.stop_current_task().await }),
        ))
    }
}
