//! `pilot-cli` – the Pilot control loop entry point.
//!
//! This binary assembles the full stack and drives it:
//!
//! 1. Loads `~/.pilot/config.toml` (writing the defaults on first run).
//! 2. Spawns the isolated inference worker and the correction planner.
//! 3. Registers a demo action set and goal sources against the
//!    [`ControlCore`].
//! 4. Runs the periodic tick loop until **Ctrl-C**, which triggers a
//!    fatal reset before exit.

mod config;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pilot_inference::InferenceBridge;
use pilot_runtime::{
    ActionHandler, ActionRegistry, Actuator, ControlCore, FnGoalSource, GoalManager, GoalProposal,
    InferenceCorrectionPlanner, StepParams, TaskManager, TaskQueueSource,
};
use pilot_types::{ActionOutcome, PilotError, Priority};
use tracing::{info, warn};

/// Actuator backed by nothing but logs.  Stands in for a real embodiment
/// adapter during bench runs.
struct SimActuator;

#[async_trait]
impl Actuator for SimActuator {
    async fn halt(&self) {
        info!("actuator: halt");
    }
    async fn clear_controls(&self) {
        info!("actuator: controls cleared");
    }
}

/// Logs the `message` parameter.
struct SayHandler;

#[async_trait]
impl ActionHandler for SayHandler {
    async fn execute(&self, params: &StepParams) -> Result<ActionOutcome, PilotError> {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        info!(message, "say");
        Ok(ActionOutcome::ok("said"))
    }
}

/// Sleeps for the `millis` parameter.
struct WaitHandler;

#[async_trait]
impl ActionHandler for WaitHandler {
    async fn execute(&self, params: &StepParams) -> Result<ActionOutcome, PilotError> {
        let millis = params.get("millis").and_then(|v| v.as_u64()).unwrap_or(500);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(ActionOutcome::ok("waited"))
    }
}

fn init_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("PILOT_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cfg = match config::load() {
        Ok(Some(cfg)) => cfg,
        Ok(None) => {
            let cfg = config::Config::default();
            if let Err(e) = config::save(&cfg) {
                warn!(error = %e, "could not write default config");
            } else {
                info!(path = %config::config_path().display(), "default config written");
            }
            cfg
        }
        Err(e) => {
            warn!(error = %e, "config unreadable; using defaults");
            config::Config::default()
        }
    };
    info!(?cfg, "configuration loaded");

    let bridge = InferenceBridge::spawn(cfg.bridge_config(), cfg.client_config());
    let planner = Arc::new(InferenceCorrectionPlanner::new(Arc::clone(&bridge)));

    let mut registry = ActionRegistry::new();
    registry.register("say", Box::new(SayHandler));
    registry.register("wait", Box::new(WaitHandler));
    let registry = Arc::new(registry);

    let actuator: Arc<dyn Actuator> = Arc::new(SimActuator);
    let tasks = Arc::new(TaskManager::new(
        Arc::clone(&registry),
        Arc::clone(&actuator),
        planner,
        cfg.task_config(),
    ));

    let mut goals = GoalManager::new(Arc::clone(&actuator), cfg.hysteresis_margin);
    goals.register_source(Box::new(TaskQueueSource::new(Arc::clone(&tasks))));
    goals.register_source(Box::new(FnGoalSource::new("idle", || {
        Ok(Some(GoalProposal::new(
            "idle_wait",
            Priority::Idle,
            "hold position",
            |_cancel| async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(())
            },
        )))
    })));

    let mut core = ControlCore::new(goals, tasks, actuator);
    let mut ticker = tokio::time::interval(cfg.tick_interval());
    info!("control loop running; Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = ticker.tick() => core.tick().await,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "signal listener failed; shutting down");
                }
                info!("Ctrl-C received; resetting control state");
                core.fatal_reset().await;
                break;
            }
        }
    }
    info!("pilot stopped");
}
