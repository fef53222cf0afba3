mod action_schema;
mod capture;
mod config_manager;
mod control_surface;
mod controller;
mod error;
mod input;
mod llm_gateway;
mod perception;
mod prompts;
mod schema;
mod visual_context;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::capture::PlatformCapture;
use crate::config_manager::AgentConfig;
use crate::control_surface::{ControlSurface, HttpControlSurface, Topic};
use crate::controller::engine::{EngineDeps, GoalEngine};
use crate::controller::pause::{operator_signal, PauseCoordinator};
use crate::input::PlatformInput;
use crate::llm_gateway::{backend_from_config, formulate_objective};
use crate::perception::HttpPerception;
use crate::schema::Goal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::load();
    info!("🤖 deskdriver starting (model: {}, backend: {})", config.llm_model, config.llm_backend);

    let llm = backend_from_config(&config)?;
    let surface: Arc<dyn ControlSurface> = Arc::new(HttpControlSurface::new(&config)?);
    let capture = Arc::new(PlatformCapture::new());
    let perception = Arc::new(HttpPerception::new(&config)?);
    let input = Arc::new(PlatformInput::new());

    // One pause coordinator for the process; it is the sole writer of the
    // operator signal the engines wait on.
    let (signal_handle, signal) = operator_signal();
    let _pause_task = PauseCoordinator::new(
        Arc::clone(&surface),
        signal_handle,
        Duration::from_millis(config.pause_poll_ms),
    )
    .spawn();

    surface.publish_text(Topic::OperatorStatus, "idle").await;
    info!("Ready; polling the control surface for goals");

    // Goal intake: poll the control surface and run one engine per goal.
    let mut last_goal: Option<String> = None;
    loop {
        tokio::time::sleep(Duration::from_millis(config.goal_poll_ms)).await;

        let state = match surface.read_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Control surface poll failed: {}", e);
                continue;
            }
        };

        let goal_text = match state.user_goal {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => continue,
        };
        if last_goal.as_deref() == Some(goal_text.as_str()) {
            continue;
        }
        last_goal = Some(goal_text.clone());

        let goal = Goal::new(goal_text);
        info!("New goal received: '{}'", goal.text);
        surface.publish_text(Topic::OperatorStatus, "thinking").await;

        // Objective formulation gets a hard timeout so a hung model cannot
        // wedge goal intake.
        let objective = match tokio::time::timeout(
            Duration::from_secs(60),
            formulate_objective(llm.as_ref(), &goal),
        )
        .await
        {
            Ok(Ok(objective)) => objective,
            Ok(Err(e)) => {
                error!("Objective formulation failed: {}", e);
                surface
                    .publish_text(Topic::CurrentOperation, &format!("Could not formulate an objective: {}", e))
                    .await;
                surface.publish_text(Topic::OperatorStatus, "failed").await;
                continue;
            }
            Err(_) => {
                error!("Objective formulation timed out");
                surface
                    .publish_text(Topic::CurrentOperation, "Objective formulation timed out. Check the language model service.")
                    .await;
                surface.publish_text(Topic::OperatorStatus, "failed").await;
                continue;
            }
        };
        info!("Objective: '{}'", objective.text);

        // Fresh engine per goal; no state crosses goals.
        let deps = EngineDeps {
            llm: Arc::clone(&llm),
            capture: Arc::clone(&capture) as Arc<dyn capture::ScreenCapture>,
            perception: Arc::clone(&perception) as Arc<dyn perception::PerceptionService>,
            input: Arc::clone(&input) as Arc<dyn input::OsInput>,
            surface: Arc::clone(&surface),
        };
        let mut engine = GoalEngine::new(config.clone(), deps, signal.clone());

        match engine.run(&goal, &objective).await {
            Ok(report) => info!(
                "Goal finished: {}/{} steps succeeded",
                report.succeeded, report.total_steps
            ),
            Err(e) => error!("Goal failed: {}", e),
        }

        surface.publish_text(Topic::OperatorStatus, "idle").await;
    }
}
