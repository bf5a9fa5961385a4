//! `pilot-runtime` – goal arbitration and plan execution.
//!
//! The runtime layers the decision loop on top of the kernel primitives:
//!
//! - [`dispatch`] – [`ActionRegistry`][dispatch::ActionRegistry]: uniform
//!   async action dispatch with soft-failure normalization, plus the
//!   [`Actuator`][dispatch::Actuator] cancellation seam.
//! - [`goal_manager`] – per-tick priority arbitration with hysteresis and
//!   fire-and-forget goal execution.
//! - [`task_manager`] – FIFO plan queue with bounded retries, a
//!   recent-failures ring, correction splicing, persistent steps, and a
//!   cooperative stop flag.
//! - [`correction`] – the [`CorrectionPlanner`][correction::CorrectionPlanner]
//!   seam and its slow-tier inference implementation.
//! - [`control`] – [`ControlCore`][control::ControlCore]: one of each
//!   subsystem wired together, with the fatal-reset path.

pub mod control;
pub mod correction;
pub mod dispatch;
pub mod goal_manager;
pub mod task_manager;

pub use control::ControlCore;
pub use correction::{CorrectionPlanner, InferenceCorrectionPlanner, NullCorrectionPlanner};
pub use dispatch::{ActionHandler, ActionRegistry, Actuator, StepParams};
pub use goal_manager::{FnGoalSource, GoalManager, GoalProposal, GoalSource};
pub use task_manager::{PERSISTENT_ACTIONS, TaskManager, TaskManagerConfig, TaskQueueSource};
