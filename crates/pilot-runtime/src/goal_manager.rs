//! [`GoalManager`] – per-tick priority arbitration with hysteresis.
//!
//! Goal sources are polled once per tick; each returns at most one
//! [`GoalProposal`], a bid for control of the actuator at a fixed
//! [`Priority`].  The strict maximum wins, with ties resolved by source
//! registration order.  An installed goal is only preempted when a new bid
//! exceeds its weight by more than the hysteresis margin, which keeps two
//! near-equal sources from trading the actuator back and forth every tick.
//!
//! The tick itself never executes a goal body: the winner's `execute`
//! closure is spawned and forgotten, carrying a [`CancelFlag`] that is
//! raised if the goal is later preempted.  A goal whose execution finishes
//! (or fails) while still installed vacates the active slot so the next
//! tick arbitrates from scratch.
//!
//! [`ReflexStack`][pilot_kernel::ReflexStack] freezes arbitration through
//! the [`ArbitrationGate`] handle returned by [`GoalManager::gate_handle`];
//! while frozen, [`tick`][GoalManager::tick] returns immediately.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pilot_kernel::{ArbitrationGate, CancelFlag};
use pilot_types::{PilotError, Priority};
use tracing::{debug, info, warn};

use crate::dispatch::Actuator;

/// The future type a goal body resolves to.
pub type GoalFuture = Pin<Box<dyn Future<Output = Result<(), PilotError>> + Send>>;

/// The future type a stop callback resolves to.
pub type StopFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type ExecuteFn = Box<dyn FnOnce(CancelFlag) -> GoalFuture + Send>;
type StopFn = Box<dyn FnOnce() -> StopFuture + Send>;

/// A bid for control of the actuator.  Ephemeral: sources build a fresh
/// proposal each tick; only the winning one is ever executed.
pub struct GoalProposal {
    /// Stable identity; a winner matching the active goal's id is a no-op.
    pub id: String,
    pub priority: Priority,
    pub description: String,
    execute: ExecuteFn,
    stop: Option<StopFn>,
}

impl GoalProposal {
    /// Build a proposal from an async closure.
    pub fn new<F, Fut>(
        id: impl Into<String>,
        priority: Priority,
        description: impl Into<String>,
        execute: F,
    ) -> Self
    where
        F: FnOnce(CancelFlag) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PilotError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            priority,
            description: description.into(),
            execute: Box::new(move |cancel| Box::pin(execute(cancel))),
            stop: None,
        }
    }

    /// Attach an async stop callback, awaited when this goal is preempted
    /// or explicitly stopped.
    pub fn with_stop<F, Fut>(mut self, stop: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop = Some(Box::new(move || Box::pin(stop())));
        self
    }
}

/// A polling source of goal proposals.
///
/// Sources are fault-isolated: a source returning `Err` is logged and
/// skipped for that tick, never fatal to arbitration.
pub trait GoalSource: Send {
    /// Stable source name, used in logs and tie-break documentation.
    fn name(&self) -> &str;
    /// Produce this tick's bid, if any.
    fn propose(&mut self) -> Result<Option<GoalProposal>, PilotError>;
}

/// Closure-backed [`GoalSource`] for wiring and tests.
pub struct FnGoalSource<F> {
    name: String,
    propose: F,
}

impl<F> FnGoalSource<F>
where
    F: FnMut() -> Result<Option<GoalProposal>, PilotError> + Send,
{
    pub fn new(name: impl Into<String>, propose: F) -> Self {
        Self {
            name: name.into(),
            propose,
        }
    }
}

impl<F> GoalSource for FnGoalSource<F>
where
    F: FnMut() -> Result<Option<GoalProposal>, PilotError> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }
    fn propose(&mut self) -> Result<Option<GoalProposal>, PilotError> {
        (self.propose)()
    }
}

struct ActiveGoal {
    id: String,
    source: String,
    priority: Priority,
    cancel: CancelFlag,
    stop: Option<StopFn>,
}

/// Handle implementing [`ArbitrationGate`] over the manager's freeze flag.
#[derive(Clone)]
pub struct GateHandle {
    frozen: Arc<AtomicBool>,
}

impl ArbitrationGate for GateHandle {
    fn lock(&self) {
        self.frozen.store(true, Ordering::Release);
    }
    fn unlock(&self) {
        self.frozen.store(false, Ordering::Release);
    }
}

/// Owns the registered sources and the single active goal.
pub struct GoalManager {
    sources: Vec<Box<dyn GoalSource>>,
    active: Arc<Mutex<Option<ActiveGoal>>>,
    frozen: Arc<AtomicBool>,
    hysteresis_margin: u32,
    actuator: Arc<dyn Actuator>,
}

impl GoalManager {
    /// Create a manager driving `actuator`, with the given hysteresis
    /// margin (in [`Priority::weight`] units).
    pub fn new(actuator: Arc<dyn Actuator>, hysteresis_margin: u32) -> Self {
        Self {
            sources: Vec::new(),
            active: Arc::new(Mutex::new(None)),
            frozen: Arc::new(AtomicBool::new(false)),
            hysteresis_margin,
            actuator,
        }
    }

    /// Register a polling source.
    ///
    /// Registration order is meaningful: when two sources bid the same
    /// maximum priority in one tick, the earlier-registered source wins.
    pub fn register_source(&mut self, source: Box<dyn GoalSource>) {
        debug!(source = source.name(), "goal source registered");
        self.sources.push(source);
    }

    /// An [`ArbitrationGate`] handle for the reflex stack.
    pub fn gate_handle(&self) -> GateHandle {
        GateHandle {
            frozen: Arc::clone(&self.frozen),
        }
    }

    /// Suspend arbitration.
    pub fn lock(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Resume arbitration.
    pub fn unlock(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    /// `true` while arbitration is suspended.
    pub fn is_locked(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Identity and priority of the active goal, if one is installed.
    pub fn active_goal(&self) -> Option<(String, Priority)> {
        self.active
            .lock()
            .expect("active goal slot poisoned")
            .as_ref()
            .map(|g| (g.id.clone(), g.priority))
    }

    /// Run one arbitration round.  Never blocks on goal execution.
    pub async fn tick(&mut self) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }

        // Collect one proposal from every source, fault-isolated.
        let mut winner: Option<(usize, GoalProposal)> = None;
        for (index, source) in self.sources.iter_mut().enumerate() {
            match source.propose() {
                Ok(Some(proposal)) => {
                    // Strictly-greater keeps the first-registered source on ties.
                    let beats = winner
                        .as_ref()
                        .is_none_or(|(_, w)| proposal.priority.weight() > w.priority.weight());
                    if beats {
                        winner = Some((index, proposal));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let e = PilotError::SourceFailed {
                        name: source.name().to_string(),
                        message: e.to_string(),
                    };
                    warn!(error = %e, "goal source failed; skipped");
                }
            }
        }
        let Some((source_index, winner)) = winner else {
            return;
        };

        // No-op when the winner is already active; hysteresis otherwise.
        {
            let active = self.active.lock().expect("active goal slot poisoned");
            if let Some(current) = active.as_ref() {
                if current.id == winner.id {
                    return;
                }
                if winner.priority.weight() <= current.priority.weight() + self.hysteresis_margin {
                    debug!(
                        winner = %winner.id,
                        active = %current.id,
                        "hysteresis kept active goal"
                    );
                    return;
                }
            }
        }

        self.preempt_active().await;
        self.install(winner, self.sources[source_index].name().to_string());
    }

    /// Explicitly stop and clear the active goal, awaiting its stop
    /// callback and clearing actuator controls.
    pub async fn stop_active(&self) {
        self.preempt_active().await;
    }

    /// Drop the active goal without awaiting callbacks.  Fatal-reset path:
    /// the cancel flag is still raised so the running body winds down.
    pub fn clear_active(&self) {
        let mut active = self.active.lock().expect("active goal slot poisoned");
        if let Some(goal) = active.take() {
            goal.cancel.raise();
            info!(goal = %goal.id, "active goal cleared");
        }
    }

    async fn preempt_active(&self) {
        let previous = self
            .active
            .lock()
            .expect("active goal slot poisoned")
            .take();
        let Some(goal) = previous else { return };
        info!(goal = %goal.id, source = %goal.source, "stopping active goal");
        goal.cancel.raise();
        if let Some(stop) = goal.stop {
            stop().await;
        }
        self.actuator.clear_controls().await;
    }

    fn install(&self, proposal: GoalProposal, source: String) {
        let cancel = CancelFlag::new();
        let id = proposal.id.clone();
        info!(
            goal = %id,
            source = %source,
            priority = ?proposal.priority,
            "goal adopted"
        );
        *self.active.lock().expect("active goal slot poisoned") = Some(ActiveGoal {
            id: id.clone(),
            source,
            priority: proposal.priority,
            cancel: cancel.clone(),
            stop: proposal.stop,
        });

        // Fire and forget: the tick must never await a goal body.  A body
        // that finishes while still installed vacates the slot so the next
        // tick arbitrates afresh.
        let future = (proposal.execute)(cancel);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let result = future.await;
            if let Err(e) = &result {
                warn!(goal = %id, error = %e, "goal execution failed");
            }
            let mut slot = active.lock().expect("active goal slot poisoned");
            if slot.as_ref().is_some_and(|g| g.id == id) {
                *slot = None;
            }
        });
    }
}
