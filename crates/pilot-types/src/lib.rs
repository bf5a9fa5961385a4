use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Arbitration priority of a goal proposal.
///
/// The total order is fixed and documented here once, so no component deals
/// in bare numbers: `Idle < Routine < Task < Elevated < Survival < Critical`.
/// The numeric weight returned by [`Priority::weight`] is what the hysteresis
/// comparison in the goal manager operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background behavior when nothing else bids (wandering, idling).
    Idle,
    /// Low-stakes housekeeping (inventory sorting, casual chat).
    Routine,
    /// Deliberate plan execution driven by the task queue.
    Task,
    /// Heightened attention (nearby hostile, low resources).
    Elevated,
    /// Immediate survival behavior (flee, eat, surface for air).
    Survival,
    /// Last-resort reflexes; nothing may outbid these.
    Critical,
}

impl Priority {
    /// Numeric weight used for hysteresis comparisons.
    ///
    /// Adjacent levels are spaced by 10 so a configurable margin smaller
    /// than the spacing still prevents oscillation between near-equal bids.
    pub fn weight(&self) -> u32 {
        match self {
            Priority::Idle => 0,
            Priority::Routine => 10,
            Priority::Task => 20,
            Priority::Elevated => 30,
            Priority::Survival => 40,
            Priority::Critical => 50,
        }
    }
}

/// Precedence level of an advisory actuator lock.
///
/// Total order: `Routine < Task < Reflex < Emergency`.  A holder can only be
/// preempted by a strictly higher level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockLevel {
    /// Ambient behaviors that yield to everything.
    Routine,
    /// Plan steps executed by the task manager.
    Task,
    /// Short high-priority interruptions.
    Reflex,
    /// Fatal-reset and self-preservation paths.
    Emergency,
}

/// One step of a [`TaskPlan`].
///
/// `params` is a free-form JSON object interpreted by the action handler.
/// A step marked `persistent` keeps the plan parked after its first
/// successful invocation until an external stop or completion signal.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskStep {
    /// Registered action name, e.g. `"move_to"` or `"say_message"`.
    pub action: String,
    /// Parameters forwarded verbatim to the action handler.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Block the plan after success until stopped or complete.
    #[serde(default)]
    pub persistent: bool,
}

impl TaskStep {
    /// Convenience constructor for a non-persistent step.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: serde_json::Map::new(),
            persistent: false,
        }
    }

    /// Attach a parameter, builder style.
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// An ordered multi-step plan consumed index-by-index by the task manager.
///
/// Plans are produced externally (by a planner, possibly via the inference
/// bridge) and by the correction-plan provider; both emit this same shape,
/// which is why it derives [`JsonSchema`] for structured model output.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskPlan {
    /// Short human-readable statement of what the plan achieves.
    pub description: String,
    /// Steps executed strictly in order, subject to correction splices.
    pub steps: Vec<TaskStep>,
}

/// Structured result of a dispatched action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ActionOutcome {
    /// A successful outcome with a status message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    /// A failed outcome with a reason.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a data payload, builder style.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// One entry in the task manager's bounded recent-failures log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub action: String,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Global error type spanning dispatch failures, plan aborts, inference
/// degradation, and fatal resets.
#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Action '{action}' failed: {message}")]
    ActionFailed { action: String, message: String },

    #[error("Plan aborted: {0}")]
    PlanAborted(String),

    #[error("Inference unavailable: {0}")]
    Inference(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Field is deliberately not called `source`: thiserror reserves that
    // name for the error-chain cause.
    #[error("Goal source '{name}' failed: {message}")]
    SourceFailed { name: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}
