use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::capture::ScreenCapture;
use crate::config_manager::AgentConfig;
use crate::control_surface::{ControlSurface, Topic};
use crate::input::{meta_key, OsInput};
use crate::llm_gateway::{ChatMessage, LanguageModel};
use crate::perception::{describe_elements, map_elements, PerceptionService};
use crate::prompts;
use crate::schema::{ParsedContext, VisualContext};

/// Runs the capture → parse → narrate pipeline. `acquire` runs once per
/// goal; `refresh` only on explicit request from the planner or resolver.
/// Every failure mode collapses into a Degraded context with a reason —
/// acquisition never errors out to the caller.
pub struct ContextAcquirer {
    capture: Arc<dyn ScreenCapture>,
    perception: Arc<dyn PerceptionService>,
    llm: Arc<dyn LanguageModel>,
    input: Arc<dyn OsInput>,
    surface: Arc<dyn ControlSurface>,
    desktop_anchor: bool,
}

impl ContextAcquirer {
    pub fn new(
        config: &AgentConfig,
        capture: Arc<dyn ScreenCapture>,
        perception: Arc<dyn PerceptionService>,
        llm: Arc<dyn LanguageModel>,
        input: Arc<dyn OsInput>,
        surface: Arc<dyn ControlSurface>,
    ) -> Self {
        Self {
            capture,
            perception,
            llm,
            input,
            surface,
            desktop_anchor: config.desktop_anchor,
        }
    }

    /// Primary acquisition at goal start. Optionally anchors the screen at
    /// the desktop first so the first parse sees a known state.
    pub async fn acquire(&self) -> VisualContext {
        if self.desktop_anchor {
            self.anchor_to_desktop().await;
        }
        self.build("initial acquisition").await
    }

    /// Explicit re-run of the pipeline. Never called automatically after
    /// actions; the callers own the decision and its frequency.
    pub async fn refresh(&self, reason: &str, step_index: Option<usize>) -> VisualContext {
        match step_index {
            Some(i) => info!("Refreshing visual context at step {}: {}", i, reason),
            None => info!("Refreshing visual context: {}", reason),
        }
        self.build(reason).await
    }

    async fn anchor_to_desktop(&self) {
        let input = Arc::clone(&self.input);
        let chord = vec![meta_key().to_string(), "d".to_string()];
        let result = tokio::task::spawn_blocking(move || input.hotkey(&chord)).await;
        match result {
            Ok(Ok(())) => tokio::time::sleep(std::time::Duration::from_millis(500)).await,
            Ok(Err(e)) => warn!("Desktop anchor failed, continuing unanchored: {}", e),
            Err(e) => warn!("Desktop anchor task failed: {}", e),
        }
    }

    async fn build(&self, label: &str) -> VisualContext {
        // 1. Capture
        let screenshot = match self.capture.capture().await {
            Ok(shot) => shot,
            Err(e) => {
                let reason = format!("screen capture failed: {}", e);
                warn!("{} ({})", reason, label);
                return VisualContext::degraded(reason);
            }
        };

        // 2. Parse
        let parsed = match self.perception.parse_screenshot(&screenshot.image_b64).await {
            Ok(parsed) => parsed,
            Err(e) => {
                let reason = format!("perception service failed: {}", e);
                warn!("{} ({})", reason, label);
                return VisualContext::degraded(reason);
            }
        };

        if parsed.elements.is_empty() {
            let reason = "perception service returned zero elements".to_string();
            warn!("{} ({})", reason, label);
            return VisualContext::degraded(reason);
        }

        // 3. Map to pixels against the geometry as it is right now.
        let (width, height) = self.capture.screen_size();
        let elements = map_elements(&parsed.elements, width, height);
        let listing = describe_elements(&elements);

        // 4. Narrate. An LLM failure here keeps the parsed elements and
        // falls back to the mechanical listing; it does not degrade.
        let narrative = match self.narrate(&listing).await {
            Some(text) => text,
            None => listing,
        };

        self.surface.publish_text(Topic::Visual, &narrative).await;

        VisualContext::Parsed(ParsedContext {
            screenshot_ref: screenshot.file_ref,
            elements,
            captured_at: Utc::now(),
            narrative,
        })
    }

    async fn narrate(&self, listing: &str) -> Option<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let messages = vec![ChatMessage::user(prompts::visual_analysis_prompt(listing))];
        match self.llm.complete(messages, "Describe the current screen.", &session_id).await {
            Ok(reply) if reply.is_usable() => Some(reply.text.trim().to_string()),
            Ok(reply) => {
                warn!("Visual narration unusable: {:?}", reply.error);
                None
            }
            Err(e) => {
                warn!("Visual narration call failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Screenshot;
    use crate::llm_gateway::LlmReply;
    use crate::perception::{RawElement, ScreenParse};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedCapture;
    #[async_trait]
    impl ScreenCapture for FixedCapture {
        async fn capture(&self) -> Result<Screenshot> {
            Ok(Screenshot {
                image_b64: "Zm9v".to_string(),
                width: 1920,
                height: 1080,
                file_ref: "/tmp/test.png".to_string(),
            })
        }
        fn screen_size(&self) -> (u32, u32) {
            (1920, 1080)
        }
    }

    struct CountingPerception {
        calls: AtomicUsize,
        elements: Vec<RawElement>,
        fail: bool,
    }
    #[async_trait]
    impl crate::perception::PerceptionService for CountingPerception {
        async fn parse_screenshot(&self, _image_b64: &str) -> Result<ScreenParse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow::anyhow!("connection refused"));
            }
            Ok(ScreenParse { elements: self.elements.clone() })
        }
    }

    struct SilentModel;
    #[async_trait]
    impl LanguageModel for SilentModel {
        async fn complete(&self, _m: Vec<ChatMessage>, _o: &str, s: &str) -> Result<LlmReply> {
            Ok(LlmReply { text: String::new(), session_id: s.to_string(), error: Some("down".into()) })
        }
    }

    struct NoInput;
    impl OsInput for NoInput {
        fn press(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        fn hotkey(&self, _keys: &[String]) -> Result<()> {
            Ok(())
        }
        fn click(&self, _x: i32, _y: i32) -> Result<()> {
            Ok(())
        }
        fn type_text(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        fn scroll(&self, _amount: i32) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingSurface {
        published: Mutex<Vec<String>>,
    }
    #[async_trait]
    impl ControlSurface for RecordingSurface {
        async fn read_state(&self) -> Result<crate::control_surface::SurfaceState> {
            Ok(Default::default())
        }
        async fn publish(&self, topic: Topic, _payload: Value) {
            self.published.lock().unwrap().push(topic.as_str().to_string());
        }
    }

    fn config() -> AgentConfig {
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

    fn acquirer(perception: Arc<CountingPerception>) -> ContextAcquirer {
        ContextAcquirer::new(
            &config(),
            Arc::new(FixedCapture),
            perception,
            Arc::new(SilentModel),
            Arc::new(NoInput),
            Arc::new(RecordingSurface { published: Mutex::new(Vec::new()) }),
        )
    }

    #[tokio::test]
    async fn test_zero_elements_degrades_with_reason() {
        let perception = Arc::new(CountingPerception {
            calls: AtomicUsize::new(0),
            elements: Vec::new(),
            fail: false,
        });
        let ctx = acquirer(Arc::clone(&perception)).acquire().await;
        match ctx {
            VisualContext::Degraded { reason, .. } => assert!(reason.contains("zero elements")),
            other => panic!("expected degraded context, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_degrades_not_errors() {
        let perception = Arc::new(CountingPerception {
            calls: AtomicUsize::new(0),
            elements: Vec::new(),
            fail: true,
        });
        let ctx = acquirer(Arc::clone(&perception)).acquire().await;
        assert!(ctx.is_degraded());
        assert!(ctx.narrative().contains("perception service failed"));
    }

    #[tokio::test]
    async fn test_narration_failure_falls_back_to_listing() {
        let perception = Arc::new(CountingPerception {
            calls: AtomicUsize::new(0),
            elements: vec![RawElement {
                content: "Start".to_string(),
                kind: "icon".to_string(),
                bbox_normalized: [0.0, 0.9, 0.05, 1.0],
                interactivity: true,
            }],
            fail: false,
        });
        let ctx = acquirer(Arc::clone(&perception)).acquire().await;
        match ctx {
            VisualContext::Parsed(parsed) => {
                assert!(parsed.narrative.contains("Start"));
                assert_eq!(parsed.elements.len(), 1);
            }
            other => panic!("expected parsed context, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_calls_perception_again() {
        let perception = Arc::new(CountingPerception {
            calls: AtomicUsize::new(0),
            elements: Vec::new(),
            fail: false,
        });
        let acq = acquirer(Arc::clone(&perception));
        let _ = acq.acquire().await;
        assert_eq!(perception.calls.load(Ordering::SeqCst), 1);
        let _ = acq.refresh("planner requested", Some(2)).await;
        assert_eq!(perception.calls.load(Ordering::SeqCst), 2);
    }
}
