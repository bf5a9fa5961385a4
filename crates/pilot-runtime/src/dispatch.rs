//! [`ActionRegistry`] – single-namespace action dispatch.
//!
//! Every capability the agent can exercise is registered once, by name, at
//! startup.  The task manager resolves step names against this registry and
//! nothing else; unknown names are rejected eagerly when a plan is enqueued
//! rather than falling through a chain of providers at execution time.
//!
//! A handler's structured `{success: false, message}` outcome is normalized
//! by [`ActionRegistry::dispatch`] into an error, so retry logic upstream
//! treats soft failures and hard failures uniformly.

use std::collections::HashMap;

use async_trait::async_trait;
use pilot_types::{ActionOutcome, PilotError};
use serde_json::{Map, Value};
use tracing::debug;

/// Parameter map forwarded to action handlers.
pub type StepParams = Map<String, Value>;

/// One named capability of the agent.
///
/// Implementations wrap the domain specifics (movement, block interaction,
/// combat, chat) that are out of scope for the control core.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Perform the action.  Soft failures should be reported as
    /// `Ok(ActionOutcome::fail(..))`; both forms are normalized identically
    /// by the registry.
    async fn execute(&self, params: &StepParams) -> Result<ActionOutcome, PilotError>;

    /// Completion poll for persistent steps.  The default never completes,
    /// meaning a persistent step waits for an external stop signal.
    fn persistent_done(&self, _params: &StepParams) -> bool {
        false
    }
}

/// Best-effort cancellation surface of the single shared actuator.
///
/// Called when a goal is preempted or a plan is stopped; implementations
/// stop movement/combat/collection and release held controls.  These calls
/// must not fail: an actuator that cannot stop has nothing useful to report
/// to the control core.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Stop whatever the actuator is currently doing.
    async fn halt(&self);
    /// Release any held control state (movement keys, targets, selections).
    async fn clear_controls(&self);
}

/// Name → handler registry, resolved once at startup.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.  A handler already registered under
    /// the same name is replaced.
    pub fn register(&mut self, name: impl Into<String>, handler: Box<dyn ActionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// `true` when `name` resolves to a handler.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Execute `name` with `params`, normalizing soft failures.
    ///
    /// # Errors
    ///
    /// [`PilotError::UnknownAction`] for unregistered names;
    /// [`PilotError::ActionFailed`] for a handler error or a
    /// `success: false` outcome.
    pub async fn dispatch(
        &self,
        name: &str,
        params: &StepParams,
    ) -> Result<ActionOutcome, PilotError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| PilotError::UnknownAction(name.to_string()))?;
        debug!(action = name, "dispatching");
        match handler.execute(params).await {
            Ok(outcome) if outcome.success => Ok(outcome),
            Ok(outcome) => Err(PilotError::ActionFailed {
                action: name.to_string(),
                message: outcome.message,
            }),
            Err(PilotError::ActionFailed { action, message }) => {
                Err(PilotError::ActionFailed { action, message })
            }
            Err(e) => Err(PilotError::ActionFailed {
                action: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Completion poll for a persistent step.  Unknown names report `false`.
    pub fn persistent_done(&self, name: &str, params: &StepParams) -> bool {
        self.handlers
            .get(name)
            .is_some_and(|h| h.persistent_done(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHandler {
        outcome: fn() -> Result<ActionOutcome, PilotError>,
        done: bool,
    }

    #[async_trait]
    impl ActionHandler for FixedHandler {
        async fn execute(&self, _params: &StepParams) -> Result<ActionOutcome, PilotError> {
            (self.outcome)()
        }
        fn persistent_done(&self, _params: &StepParams) -> bool {
            self.done
        }
    }

    fn registry_with(name: &str, outcome: fn() -> Result<ActionOutcome, PilotError>) -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register(name, Box::new(FixedHandler { outcome, done: false }));
        registry
    }

    #[tokio::test]
    async fn successful_outcome_passes_through() {
        let registry = registry_with("wave", || Ok(ActionOutcome::ok("waved")));
        let outcome = registry.dispatch("wave", &StepParams::new()).await.unwrap();
        assert_eq!(outcome.message, "waved");
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let registry = ActionRegistry::new();
        let result = registry.dispatch("fly", &StepParams::new()).await;
        assert!(matches!(result, Err(PilotError::UnknownAction(name)) if name == "fly"));
    }

    #[tokio::test]
    async fn soft_failure_is_normalized_to_error() {
        let registry = registry_with("mine_block", || Ok(ActionOutcome::fail("Cannot harvest")));
        let result = registry.dispatch("mine_block", &StepParams::new()).await;
        assert!(matches!(
            result,
            Err(PilotError::ActionFailed { action, message })
                if action == "mine_block" && message == "Cannot harvest"
        ));
    }

    #[tokio::test]
    async fn hard_failure_keeps_action_name() {
        let registry = registry_with("probe", || Err(PilotError::Internal("io".to_string())));
        let result = registry.dispatch("probe", &StepParams::new()).await;
        assert!(matches!(
            result,
            Err(PilotError::ActionFailed { action, .. }) if action == "probe"
        ));
    }

    #[tokio::test]
    async fn reregistration_replaces_handler() {
        let mut registry = registry_with("wave", || Ok(ActionOutcome::fail("old")));
        registry.register(
            "wave",
            Box::new(FixedHandler {
                outcome: || Ok(ActionOutcome::ok("new")),
                done: false,
            }),
        );
        let outcome = registry.dispatch("wave", &StepParams::new()).await.unwrap();
        assert_eq!(outcome.message, "new");
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ActionRegistry::new();
        for name in ["move_to", "attack", "say_message"] {
            registry.register(
                name,
                Box::new(FixedHandler {
                    outcome: || Ok(ActionOutcome::ok("")),
                    done: false,
                }),
            );
        }
        assert_eq!(registry.names(), vec!["attack", "move_to", "say_message"]);
    }

    #[test]
    fn persistent_done_consults_handler() {
        let mut registry = ActionRegistry::new();
        registry.register(
            "guard_area",
            Box::new(FixedHandler {
                outcome: || Ok(ActionOutcome::ok("")),
                done: true,
            }),
        );
        assert!(registry.persistent_done("guard_area", &StepParams::new()));
        assert!(!registry.persistent_done("ghost", &StepParams::new()));
    }
}
