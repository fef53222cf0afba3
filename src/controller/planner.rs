use std::sync::Arc;

use tracing::{info, warn};

use crate::control_surface::{ControlSurface, Topic};
use crate::error::AgentError;
use crate::llm_gateway::{ChatMessage, LanguageModel};
use crate::prompts::{self, CONTEXT_REFRESH_MARKER};
use crate::schema::{Objective, Step, VisualContext};
use crate::visual_context::ContextAcquirer;

/// Two-phase negotiation with the language model: a "thinking" pass that
/// produces the strategic narrative (and may ask for one context refresh),
/// then a "decomposition" pass that produces the ordered step list.
pub struct CollaborativePlanner {
    llm: Arc<dyn LanguageModel>,
    surface: Arc<dyn ControlSurface>,
}

impl CollaborativePlanner {
    pub fn new(llm: Arc<dyn LanguageModel>, surface: Arc<dyn ControlSurface>) -> Self {
        Self { llm, surface }
    }

    pub async fn plan(
        &self,
        objective: &Objective,
        context: &VisualContext,
        acquirer: &ContextAcquirer,
    ) -> Result<Vec<Step>, AgentError> {
        // Phase A: thinking. At most one refresh round — the model gets one
        // chance to ask for a fresh look, then has to commit.
        let mut narrative = context.narrative();
        let mut thinking = self.think(objective, &narrative).await?;

        if wants_refresh(&thinking) {
            info!("Planner requested a context refresh before committing");
            let refreshed = acquirer.refresh("planner requested fresh context", None).await;
            narrative = refreshed.narrative();
            thinking = self.think(objective, &narrative).await?;
            if wants_refresh(&thinking) {
                warn!("Planner asked for a second refresh; refusing and planning with what we have");
            }
        }

        let thinking = strip_marker_lines(&thinking);
        self.surface.publish_text(Topic::Thinking, &thinking).await;

        // Phase B: decomposition into plain-text steps.
        let session_id = uuid::Uuid::new_v4().to_string();
        let messages = vec![ChatMessage::user(prompts::steps_prompt(
            &objective.text,
            &thinking,
            &narrative,
        ))];
        let reply = self
            .llm
            .complete(messages, "Generate actionable steps.", &session_id)
            .await
            .map_err(|e| AgentError::Planning(format!("step generation call failed: {}", e)))?;

        if let Some(err) = reply.error {
            return Err(AgentError::Planning(format!("step generation failed: {}", err)));
        }

        let descriptions = parse_steps(&reply.text);
        if descriptions.is_empty() {
            return Err(AgentError::Planning("model produced no usable steps".to_string()));
        }

        Ok(descriptions
            .into_iter()
            .enumerate()
            .map(|(i, text)| Step::new(i, text))
            .collect())
    }

    async fn think(&self, objective: &Objective, narrative: &str) -> Result<String, AgentError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let messages = vec![ChatMessage::user(prompts::thinking_prompt(
            &objective.text,
            narrative,
        ))];
        let reply = self
            .llm
            .complete(messages, "Reason about the objective and screen.", &session_id)
            .await
            .map_err(|e| AgentError::Planning(format!("thinking call failed: {}", e)))?;

        if let Some(err) = reply.error {
            return Err(AgentError::Planning(format!("thinking failed: {}", err)));
        }
        Ok(reply.text)
    }
}

fn wants_refresh(thinking: &str) -> bool {
    thinking.lines().any(|l| l.trim() == CONTEXT_REFRESH_MARKER)
}

fn strip_marker_lines(thinking: &str) -> String {
    thinking
        .lines()
        .filter(|l| l.trim() != CONTEXT_REFRESH_MARKER)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Parse the decomposition reply into step descriptions. Lines starting
/// `1.`, `1)`, `*` or `-` are step boundaries; when none are present, any
/// non-empty line outside the meta vocabulary is accepted as an implicit
/// step so that substantive but malformed output is not thrown away.
pub fn parse_steps(text: &str) -> Vec<String> {
    let mut steps = Vec::new();
    for line in text.lines() {
        if let Some(step) = strip_step_prefix(line.trim()) {
            steps.push(step);
        }
    }
    if !steps.is_empty() {
        return steps;
    }

    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_meta_line(l))
        .map(str::to_string)
        .collect()
}

fn strip_step_prefix(line: &str) -> Option<String> {
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix('*').or_else(|| line.strip_prefix('-')) {
        let rest = rest.trim();
        if !rest.is_empty() {
            return Some(rest.to_string());
        }
        return None;
    }

    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            let rest = rest.trim();
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

fn is_meta_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    ["goal:", "steps:", "guidelines:"].iter().any(|m| lower.starts_with(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ScreenCapture, Screenshot};
    use crate::config_manager::AgentConfig;
    use crate::control_surface::SurfaceState;
    use crate::input::OsInput;
    use crate::llm_gateway::LlmReply;
    use crate::perception::{PerceptionService, ScreenParse};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_numbered_steps_parse_in_order() {
        let steps = parse_steps("1. Open search\n2. Type chrome\n3. Press enter");
        assert_eq!(steps, vec!["Open search", "Type chrome", "Press enter"]);
    }

    #[test]
    fn test_mixed_bullets_and_parens() {
        let steps = parse_steps("1) Open the menu\n* Click settings\n- Scroll down");
        assert_eq!(steps, vec!["Open the menu", "Click settings", "Scroll down"]);
    }

    #[test]
    fn test_meta_lines_skipped_in_permissive_mode() {
        let steps = parse_steps("Goal: open chrome\nSteps:\nOpen the start menu and launch Chrome");
        assert_eq!(steps, vec!["Open the start menu and launch Chrome"]);
    }

    #[test]
    fn test_permissive_mode_not_used_when_markers_present() {
        let steps = parse_steps("Some preamble text\n1. Do the thing");
        assert_eq!(steps, vec!["Do the thing"]);
    }

    #[test]
    fn test_empty_text_yields_no_steps() {
        assert!(parse_steps("").is_empty());
        assert!(parse_steps("steps:\nguidelines:").is_empty());
    }

    #[test]
    fn test_refresh_marker_detection() {
        assert!(wants_refresh("CONTEXT_REFRESH_REQUIRED"));
        assert!(wants_refresh("thinking...\n  CONTEXT_REFRESH_REQUIRED  \nmore"));
        assert!(!wants_refresh("the screen may need CONTEXT_REFRESH_REQUIRED later"));
    }

    // -- plan() integration with a scripted model --

    struct ScriptedModel {
        replies: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _m: Vec<ChatMessage>, _o: &str, s: &str) -> Result<LlmReply> {
            let text = self.replies.lock().unwrap().pop_front().unwrap_or_default();
            Ok(LlmReply { text, session_id: s.to_string(), error: None })
        }
    }

    struct FixedCapture;
    #[async_trait]
    impl ScreenCapture for FixedCapture {
        async fn capture(&self) -> Result<Screenshot> {
            Ok(Screenshot {
                image_b64: "Zm9v".into(),
                width: 1920,
                height: 1080,
                file_ref: "/tmp/t.png".into(),
            })
        }
        fn screen_size(&self) -> (u32, u32) {
            (1920, 1080)
        }
    }

    struct CountingPerception {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl PerceptionService for CountingPerception {
        async fn parse_screenshot(&self, _b64: &str) -> Result<ScreenParse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScreenParse { elements: Vec::new() })
        }
    }

    struct NoInput;
    impl OsInput for NoInput {
        fn press(&self, _k: &str) -> Result<()> {
            Ok(())
        }
        fn hotkey(&self, _k: &[String]) -> Result<()> {
            Ok(())
        }
        fn click(&self, _x: i32, _y: i32) -> Result<()> {
            Ok(())
        }
        fn type_text(&self, _t: &str) -> Result<()> {
            Ok(())
        }
        fn scroll(&self, _a: i32) -> Result<()> {
            Ok(())
        }
    }

    struct NullSurface;
    #[async_trait]
    impl ControlSurface for NullSurface {
        async fn read_state(&self) -> Result<SurfaceState> {
            Ok(Default::default())
        }
        async fn publish(&self, _t: Topic, _p: Value) {}
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            llm_backend: "openai".into(),
            llm_base_url: String::new(),
            llm_api_key: String::new(),
            llm_model: String::new(),
            perception_url: String::new(),
            surface_url: String::new(),
            max_retries_per_step: 3,
            max_consecutive_errors: 5,
            action_delay_ms: 0,
            pause_poll_ms: 50,
            request_timeout_secs: 1,
            dispatch_timeout_secs: 1,
            goal_poll_ms: 50,
            desktop_anchor: false,
        }
    }

    #[tokio::test]
    async fn test_plan_with_one_refresh_round() {
        let llm = Arc::new(ScriptedModel {
            replies: Mutex::new(VecDeque::from(vec![
                CONTEXT_REFRESH_MARKER.to_string(),
                "Open the browser through the start menu.".to_string(),
                "1. Open search\n2. Type chrome\n3. Press enter".to_string(),
            ])),
        });
        let perception = Arc::new(CountingPerception { calls: AtomicUsize::new(0) });
        let surface: Arc<dyn ControlSurface> = Arc::new(NullSurface);
        let acquirer = ContextAcquirer::new(
            &test_config(),
            Arc::new(FixedCapture),
            Arc::clone(&perception) as Arc<dyn PerceptionService>,
            Arc::clone(&llm) as Arc<dyn LanguageModel>,
            Arc::new(NoInput),
            Arc::clone(&surface),
        );

        let planner = CollaborativePlanner::new(llm, surface);
        let objective = Objective::new("Open Google Chrome");
        let context = VisualContext::degraded("test setup");

        let steps = planner.plan(&objective, &context, &acquirer).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].index, 0);
        assert_eq!(steps[0].description, "Open search");
        assert_eq!(steps[2].description, "Press enter");
        // The marker triggered exactly one extra perception round.
        assert_eq!(perception.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_plan_empty_steps_is_planning_error() {
        let llm = Arc::new(ScriptedModel {
            replies: Mutex::new(VecDeque::from(vec![
                "Just thinking out loud.".to_string(),
                "".to_string(),
            ])),
        });
        let perception = Arc::new(CountingPerception { calls: AtomicUsize::new(0) });
        let surface: Arc<dyn ControlSurface> = Arc::new(NullSurface);
        let acquirer = ContextAcquirer::new(
            &test_config(),
            Arc::new(FixedCapture),
            perception as Arc<dyn PerceptionService>,
            Arc::clone(&llm) as Arc<dyn LanguageModel>,
            Arc::new(NoInput),
            Arc::clone(&surface),
        );

        let planner = CollaborativePlanner::new(llm, surface);
        let objective = Objective::new("Open Google Chrome");
        let context = VisualContext::degraded("test setup");

        let result = planner.plan(&objective, &context, &acquirer).await;
        assert!(matches!(result, Err(AgentError::Planning(_))));
    }
}
