use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::capture::ScreenCapture;
use crate::config_manager::AgentConfig;
use crate::control_surface::{ControlSurface, Topic};
use crate::controller::dispatcher::Dispatcher;
use crate::controller::pause::OperatorSignal;
use crate::controller::planner::CollaborativePlanner;
use crate::controller::resolver::{ActionResolver, Resolution};
use crate::error::AgentError;
use crate::input::OsInput;
use crate::llm_gateway::LanguageModel;
use crate::perception::PerceptionService;
use crate::schema::{
    EngineState, ExecutionRecord, Goal, Objective, Step, StepStatus, VisualContext,
};
use crate::visual_context::ContextAcquirer;

/// External collaborators one engine instance owns. Built once per goal;
/// instances never share per-goal state.
pub struct EngineDeps {
    pub llm: Arc<dyn LanguageModel>,
    pub capture: Arc<dyn ScreenCapture>,
    pub perception: Arc<dyn PerceptionService>,
    pub input: Arc<dyn OsInput>,
    pub surface: Arc<dyn ControlSurface>,
}

#[derive(Debug, Clone)]
pub struct EngineReport {
    pub state: EngineState,
    pub total_steps: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// The orchestration loop: acquire context once, negotiate a plan, then
/// execute steps strictly in order under bounded retries and a global
/// consecutive-failure ceiling.
pub struct GoalEngine {
    config: AgentConfig,
    surface: Arc<dyn ControlSurface>,
    acquirer: ContextAcquirer,
    planner: CollaborativePlanner,
    resolver: ActionResolver,
    dispatcher: Dispatcher,
    signal: OperatorSignal,

    state: EngineState,
    records: Vec<ExecutionRecord>,
    consecutive_errors: u32,
}

impl GoalEngine {
    pub fn new(config: AgentConfig, deps: EngineDeps, signal: OperatorSignal) -> Self {
        let acquirer = ContextAcquirer::new(
            &config,
            Arc::clone(&deps.capture),
            Arc::clone(&deps.perception),
            Arc::clone(&deps.llm),
            Arc::clone(&deps.input),
            Arc::clone(&deps.surface),
        );
        let planner = CollaborativePlanner::new(Arc::clone(&deps.llm), Arc::clone(&deps.surface));
        let resolver = ActionResolver::new(
            Arc::clone(&deps.llm),
            Arc::clone(&deps.surface),
            config.max_retries_per_step,
        );
        let dispatcher = Dispatcher::new(Arc::clone(&deps.input), config.dispatch_timeout());

        Self {
            surface: deps.surface,
            acquirer,
            planner,
            resolver,
            dispatcher,
            signal,
            config,
            state: EngineState::Idle,
            records: Vec::new(),
            consecutive_errors: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub async fn run(&mut self, goal: &Goal, objective: &Objective) -> Result<EngineReport, AgentError> {
        info!("🔥 Goal accepted: '{}'", goal.text);

        // 1. Acquire the primary visual context. Once per goal; degraded is
        // an acceptable substitute and planning proceeds either way.
        self.enter(EngineState::AcquiringContext).await;
        let context = self.acquirer.acquire().await;
        if let VisualContext::Degraded { reason, .. } = &context {
            warn!("Proceeding with degraded context: {}", reason);
            self.surface
                .publish_text(
                    Topic::CurrentOperation,
                    &format!("Visual analysis failed: {}. Continuing without screen details.", reason),
                )
                .await;
        }

        // 2. Plan. A planner failure degrades to the canned one-step plan;
        // the goal only fails here if even that is unobtainable.
        self.enter(EngineState::Planning).await;
        let mut steps = match self.planner.plan(objective, &context, &self.acquirer).await {
            Ok(steps) => steps,
            Err(e) => {
                warn!("Planner failed ({}); substituting the minimal canned plan", e);
                self.surface
                    .publish_text(Topic::CurrentOperation, &format!("{}. Using a minimal fallback plan.", e))
                    .await;
                let fallback = canned_plan();
                if fallback.is_empty() {
                    self.enter(EngineState::Failed).await;
                    self.report_terminal(&[]).await;
                    return Err(e);
                }
                fallback
            }
        };

        self.surface
            .publish(
                Topic::StepsGenerated,
                json!({ "steps": steps.iter().map(|s| s.description.clone()).collect::<Vec<_>>() }),
            )
            .await;

        // 3. Execute strictly in index order.
        self.enter(EngineState::Executing).await;
        let mut context_stale = false;
        let total = steps.len();

        for i in 0..steps.len() {
            let step_text = steps[i].description.clone();
            self.surface
                .publish_text(
                    Topic::CurrentOperation,
                    &format!("Executing step {}/{}: {}", i + 1, total, step_text),
                )
                .await;
            steps[i].status = StepStatus::InProgress;

            let resolution = self
                .resolver
                .resolve(&steps[i], objective, &context, context_stale, &mut self.signal, &self.acquirer)
                .await;

            let action = match resolution {
                Resolution::Done { summary } => {
                    info!("Model declared the objective complete: {}", summary);
                    steps[i].status = StepStatus::Completed;
                    self.surface
                        .publish_text(Topic::CurrentOperation, &format!("Objective complete: {}", summary))
                        .await;
                    self.enter(EngineState::Completed).await;
                    let report = self.build_report(&steps);
                    self.report_terminal(&steps).await;
                    return Ok(report);
                }
                Resolution::Act(action) => action,
            };

            let success = self.dispatcher.execute(&action).await;
            self.records.push(ExecutionRecord {
                step_index: i,
                action: action.clone(),
                success,
                timestamp: Utc::now(),
            });
            self.surface
                .publish(
                    Topic::PastOperation,
                    json!({ "text": action.summary(), "success": success }),
                )
                .await;

            if success {
                steps[i].status = match action.provenance {
                    crate::schema::ActionProvenance::Model => StepStatus::Completed,
                    _ => StepStatus::CompletedWithFallback,
                };
                self.consecutive_errors = 0;
                if action.kind.likely_changed_screen() {
                    context_stale = true;
                }
            } else {
                // Dispatch itself is never retried; the step is marked
                // failed and the loop advances under the global ceiling.
                steps[i].status = StepStatus::Failed;
                self.consecutive_errors += 1;
                error!(
                    "Step {} dispatch failed ({} consecutive)",
                    i + 1,
                    self.consecutive_errors
                );
                self.surface
                    .publish_text(
                        Topic::CurrentOperation,
                        &format!(
                            "Step {} failed to execute ({} consecutive failures)",
                            i + 1,
                            self.consecutive_errors
                        ),
                    )
                    .await;

                if self.consecutive_errors >= self.config.max_consecutive_errors {
                    self.enter(EngineState::Failed).await;
                    self.report_terminal(&steps).await;
                    return Err(AgentError::ErrorCeiling(self.consecutive_errors));
                }
            }

            if self.config.action_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.action_delay_ms)).await;
            }
        }

        self.enter(EngineState::Completed).await;
        let report = self.build_report(&steps);
        self.report_terminal(&steps).await;
        Ok(report)
    }

    async fn enter(&mut self, state: EngineState) {
        self.state = state;
        self.surface
            .publish_text(Topic::OperatorStatus, state.as_str())
            .await;
    }

    fn build_report(&self, steps: &[Step]) -> EngineReport {
        let succeeded = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::CompletedWithFallback))
            .count();
        let failed = steps.iter().filter(|s| s.status == StepStatus::Failed).count();
        EngineReport {
            state: self.state,
            total_steps: steps.len(),
            succeeded,
            failed,
        }
    }

    /// One terminal report per goal: successful vs failed step counts.
    async fn report_terminal(&self, steps: &[Step]) {
        let report = self.build_report(steps);
        info!(
            "🏁 Goal finished in state {:?}: {}/{} steps succeeded, {} failed",
            report.state, report.succeeded, report.total_steps, report.failed
        );
        self.surface
            .publish_text(
                Topic::CurrentOperation,
                &format!(
                    "Finished ({}): {} of {} steps succeeded, {} failed",
                    self.state.as_str(),
                    report.succeeded,
                    report.total_steps,
                    report.failed
                ),
            )
            .await;
    }
}

fn canned_plan() -> Vec<Step> {
    vec![Step::new(0, "Work toward the objective using the visible UI")]
}
