//! Correction planning – turning a failed step into a recovery plan.
//!
//! When a step exhausts its retries the task manager asks a
//! [`CorrectionPlanner`] for a short plan that replaces the failed step.
//! The production planner sends the failure context to the slow inference
//! tier and parses a [`TaskPlan`] out of the reply; any reply that cannot
//! be parsed, or that references actions the registry does not know,
//! yields `None`, and the task manager aborts the whole plan.

use std::sync::Arc;

use async_trait::async_trait;
use pilot_inference::sanitize::{MAX_DEPTH, sanitize_payload};
use pilot_inference::{InferenceBridge, parse_structured};
use pilot_types::{FailureRecord, TaskPlan};
use serde_json::Value;
use tracing::{debug, warn};

/// Produces a recovery plan for a failed step, or `None` to abort the plan.
#[async_trait]
pub trait CorrectionPlanner: Send + Sync {
    /// `original` is the plan being executed; `failure` is the step that
    /// exhausted its retries; `forbidden` lists actions that failed in the
    /// recent window and must not appear in the correction; `available` is
    /// the registry's action set.
    async fn plan(
        &self,
        original: &TaskPlan,
        failure: &FailureRecord,
        forbidden: &[String],
        available: &[String],
    ) -> Option<TaskPlan>;
}

/// Planner that never proposes a correction.  Used where no model is
/// wired up; a step exhausting its retries then aborts its plan.
pub struct NullCorrectionPlanner;

#[async_trait]
impl CorrectionPlanner for NullCorrectionPlanner {
    async fn plan(
        &self,
        _: &TaskPlan,
        _: &FailureRecord,
        _: &[String],
        _: &[String],
    ) -> Option<TaskPlan> {
        None
    }
}

/// Slow-tier planner backed by the inference bridge.
pub struct InferenceCorrectionPlanner {
    bridge: Arc<InferenceBridge>,
}

impl InferenceCorrectionPlanner {
    pub fn new(bridge: Arc<InferenceBridge>) -> Self {
        Self { bridge }
    }

    fn build_prompt(
        original: &TaskPlan,
        failure: &FailureRecord,
        forbidden: &[String],
        available: &[String],
    ) -> String {
        let params = sanitize_payload(&Value::Object(failure.params.clone()), MAX_DEPTH);
        let mut prompt = format!(
            "An action failed during plan execution and needs a short recovery plan.\n\
             Original plan: {}\n\
             Failed action: {}\n\
             Parameters: {}\n\
             Error: {}\n\
             Available actions: {}\n",
            original.description,
            failure.action,
            params,
            failure.error,
            available.join(", "),
        );
        if !forbidden.is_empty() {
            prompt.push_str(&format!(
                "These actions failed repeatedly just now and must NOT be used: {}\n",
                forbidden.join(", ")
            ));
        }
        prompt.push_str(
            "Reply with a JSON plan: {\"description\": string, \"steps\": \
             [{\"action\": string, \"params\": object}]}. Use at most three steps.",
        );
        prompt
    }
}

#[async_trait]
impl CorrectionPlanner for InferenceCorrectionPlanner {
    async fn plan(
        &self,
        original: &TaskPlan,
        failure: &FailureRecord,
        forbidden: &[String],
        available: &[String],
    ) -> Option<TaskPlan> {
        let prompt = Self::build_prompt(original, failure, forbidden, available);
        let reply = self.bridge.slow(&prompt, true).await?;
        let plan: TaskPlan = match parse_structured(&reply) {
            Some(plan) => plan,
            None => {
                warn!(action = %failure.action, "correction reply was not a parseable plan");
                return None;
            }
        };
        if plan.steps.is_empty() {
            debug!(action = %failure.action, "correction plan was empty");
            return None;
        }
        if let Some(step) = plan
            .steps
            .iter()
            .find(|s| forbidden.contains(&s.action) || !available.contains(&s.action))
        {
            warn!(
                action = %step.action,
                "correction plan references a forbidden or unknown action; discarded"
            );
            return None;
        }
        Some(plan)
    }
}
