use std::sync::Arc;

use tracing::{info, warn};

use crate::action_schema::{parse_action_response, ParsedDirective};
use crate::control_surface::{ControlSurface, Topic};
use crate::controller::heuristics;
use crate::controller::pause::OperatorSignal;
use crate::llm_gateway::{ChatMessage, LanguageModel};
use crate::prompts;
use crate::schema::{Action, Objective, Step, VisualContext};
use crate::visual_context::ContextAcquirer;

/// What one step resolved to: an executable action, or the model declaring
/// the whole objective finished.
#[derive(Debug, Clone)]
pub enum Resolution {
    Act(Action),
    Done { summary: String },
}

/// Turns one step plus cached context into exactly one action, within
/// `max_retries_per_step` model attempts. Resolution can degrade — model,
/// then heuristic, then emergency — but it can never come back empty.
pub struct ActionResolver {
    llm: Arc<dyn LanguageModel>,
    surface: Arc<dyn ControlSurface>,
    max_retries: u32,
}

impl ActionResolver {
    pub fn new(llm: Arc<dyn LanguageModel>, surface: Arc<dyn ControlSurface>, max_retries: u32) -> Self {
        Self { llm, surface, max_retries: max_retries.max(1) }
    }

    pub async fn resolve(
        &self,
        step: &Step,
        objective: &Objective,
        context: &VisualContext,
        context_stale: bool,
        signal: &mut OperatorSignal,
        acquirer: &ContextAcquirer,
    ) -> Resolution {
        // A refresh requested by the model lives only for the remainder of
        // this resolution; the goal's primary context is untouched.
        let mut ephemeral_context: Option<VisualContext> = None;
        let mut failed_attempts: u32 = 0;

        for attempt in 1..=self.max_retries {
            // The one safe suspension point: before the attempt, never
            // inside dispatch.
            signal.wait_until_running().await;

            let narrative = ephemeral_context
                .as_ref()
                .map(|c| c.narrative())
                .unwrap_or_else(|| context.narrative());
            let stale = context_stale && ephemeral_context.is_none();

            match self.ask_model(step, objective, &narrative, attempt, stale).await {
                Ok(ParsedDirective::Act(action)) => {
                    info!("Step {} resolved on attempt {}: {}", step.index, attempt, action.summary());
                    return Resolution::Act(action);
                }
                Ok(ParsedDirective::Done { summary }) => {
                    return Resolution::Done { summary };
                }
                Ok(ParsedDirective::RefreshContext { reason }) => {
                    // Counts against the retry budget so a refresh-happy
                    // model still terminates.
                    info!("Step {} requested context refresh: {}", step.index, reason);
                    ephemeral_context = Some(acquirer.refresh(&reason, Some(step.index)).await);
                }
                Err(explanation) => {
                    failed_attempts += 1;
                    warn!(
                        "Step {} resolution attempt {}/{} failed: {}",
                        step.index, attempt, self.max_retries, explanation
                    );
                    self.surface
                        .publish_text(
                            Topic::CurrentOperation,
                            &format!(
                                "Step {}: could not obtain a valid action (attempt {}): {}",
                                step.index + 1,
                                attempt,
                                explanation
                            ),
                        )
                        .await;

                    // Two strikes and the heuristics get a shot, so a dead
                    // model doesn't cost the full retry budget in latency.
                    if failed_attempts >= 2 {
                        if let Some(action) = heuristics::fallback_action(&step.description, &objective.text) {
                            info!("Step {} resolved by fallback heuristics: {}", step.index, action.summary());
                            return Resolution::Act(action);
                        }
                    }
                }
            }
        }

        if let Some(action) = heuristics::fallback_action(&step.description, &objective.text) {
            return Resolution::Act(action);
        }

        let action = heuristics::emergency_action();
        warn!("Step {} exhausted retries with no fallback match; using emergency action", step.index);
        self.surface
            .publish_text(
                Topic::CurrentOperation,
                &format!("Step {}: retries exhausted, using emergency action", step.index + 1),
            )
            .await;
        Resolution::Act(action)
    }

    async fn ask_model(
        &self,
        step: &Step,
        objective: &Objective,
        narrative: &str,
        attempt: u32,
        context_stale: bool,
    ) -> Result<ParsedDirective, String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let messages = vec![
            ChatMessage::system(prompts::ACTION_SYSTEM_PROMPT),
            ChatMessage::user(prompts::action_user_prompt(
                &step.description,
                &objective.text,
                narrative,
                attempt,
                context_stale,
            )),
        ];

        let reply = self
            .llm
            .complete(messages, &step.description, &session_id)
            .await
            .map_err(|e| format!("model call failed: {}", e))?;

        if let Some(err) = reply.error {
            return Err(format!("model error: {}", err));
        }

        parse_action_response(&reply.text)
    }
}
