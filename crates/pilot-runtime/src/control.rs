//! [`ControlCore`] – the top-level assembly of the control loop.
//!
//! Owns one of each subsystem and wires them together: the reflex stack
//! freezes goal arbitration through the manager's gate handle, the task
//! queue bids for the actuator through a registered [`TaskQueueSource`],
//! and a single periodic driver calls [`tick`][ControlCore::tick].
//!
//! [`fatal_reset`][ControlCore::fatal_reset] is the recovery path for
//! unrecoverable state errors (agent death, disconnect): stop the running
//! task, clear every reflex frame, force-release the advisory lock, drop
//! the active goal, and return to idle arbitration.
//!
//! [`TaskQueueSource`]: crate::task_manager::TaskQueueSource

use std::sync::{Arc, Mutex};

use pilot_kernel::{ActionLock, ReflexStack};
use tracing::warn;

use crate::dispatch::Actuator;
use crate::goal_manager::GoalManager;
use crate::task_manager::TaskManager;

pub struct ControlCore {
    goals: GoalManager,
    tasks: Arc<TaskManager>,
    reflexes: Mutex<ReflexStack>,
    lock: Mutex<ActionLock>,
    actuator: Arc<dyn Actuator>,
}

impl ControlCore {
    /// Assemble the core.  The reflex stack is constructed here so its
    /// gate is wired to `goals` before any frame can be pushed.
    pub fn new(goals: GoalManager, tasks: Arc<TaskManager>, actuator: Arc<dyn Actuator>) -> Self {
        let gate = goals.gate_handle();
        Self {
            goals,
            tasks,
            reflexes: Mutex::new(ReflexStack::new(Box::new(gate))),
            lock: Mutex::new(ActionLock::new()),
            actuator,
        }
    }

    /// One control cycle: lazily expire the advisory lock, then run one
    /// arbitration round.  Driven by a single periodic timer; cycles never
    /// overlap.
    pub async fn tick(&mut self) {
        let _ = self.lock.lock().expect("action lock poisoned").holder();
        self.goals.tick().await;
    }

    pub fn goals(&mut self) -> &mut GoalManager {
        &mut self.goals
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Run `f` against the reflex stack.
    pub fn with_reflexes<R>(&self, f: impl FnOnce(&mut ReflexStack) -> R) -> R {
        f(&mut self.reflexes.lock().expect("reflex stack poisoned"))
    }

    /// Run `f` against the advisory action lock.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut ActionLock) -> R) -> R {
        f(&mut self.lock.lock().expect("action lock poisoned"))
    }

    /// Hard reset after a fatal state error.  Every subsystem returns to
    /// idle; the next tick arbitrates from a clean slate.
    pub async fn fatal_reset(&self) {
        warn!("fatal reset: clearing all control state");
        self.tasks.stop_current_task().await;
        self.reflexes.lock().expect("reflex stack poisoned").clear();
        self.lock.lock().expect("action lock poisoned").force_release();
        self.goals.clear_active();
        self.actuator.clear_controls().await;
    }
}
