use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config_manager::AgentConfig;

/// Topic-keyed state slots on the control surface. Writes are latest-wins;
/// there is no ordering contract beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Thinking,
    Visual,
    CurrentOperation,
    OperatorStatus,
    StepsGenerated,
    PastOperation,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Thinking => "thinking",
            Topic::Visual => "visual",
            Topic::CurrentOperation => "current_operation",
            Topic::OperatorStatus => "operator_status",
            Topic::StepsGenerated => "steps_generated",
            Topic::PastOperation => "past_operation",
        }
    }
}

/// Snapshot of what the control surface currently reports.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SurfaceState {
    #[serde(default)]
    pub user_goal: Option<String>,
    #[serde(default)]
    pub formulated_objective: Option<String>,
    #[serde(default)]
    pub operator_status: Option<String>,
    #[serde(default)]
    pub is_paused: bool,
}

/// The external presentation/control process. Publishing is fire-and-forget
/// and must never block or fail the engine loop.
#[async_trait]
pub trait ControlSurface: Send + Sync {
    async fn read_state(&self) -> anyhow::Result<SurfaceState>;
    async fn publish(&self, topic: Topic, payload: Value);

    async fn publish_text(&self, topic: Topic, text: &str) {
        self.publish(topic, json!({ "text": text })).await;
    }
}

pub struct HttpControlSurface {
    client: Client,
    base_url: String,
}

impl HttpControlSurface {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        // Deliberately short timeout: a stuck surface only costs telemetry.
        let client = Client::builder()
            .no_proxy()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: config.surface_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ControlSurface for HttpControlSurface {
    async fn read_state(&self) -> anyhow::Result<SurfaceState> {
        let url = format!("{}/state", self.base_url);
        let response = self.client.get(&url).send().await?;
        let state = response.json::<SurfaceState>().await?;
        Ok(state)
    }

    async fn publish(&self, topic: Topic, payload: Value) {
        let url = format!("{}/state/{}", self.base_url, topic.as_str());
        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!("Control surface rejected {} update: {}", topic.as_str(), resp.status());
            }
            Ok(_) => debug!("Published {} update", topic.as_str()),
            Err(e) => warn!("Failed to publish {} update: {}", topic.as_str(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_wire_names() {
        assert_eq!(Topic::CurrentOperation.as_str(), "current_operation");
        assert_eq!(Topic::StepsGenerated.as_str(), "steps_generated");
        assert_eq!(Topic::PastOperation.as_str(), "past_operation");
    }

    #[test]
    fn test_surface_state_defaults() {
        let state: SurfaceState = serde_json::from_str("{}").unwrap();
        assert!(state.user_goal.is_none());
        assert!(!state.is_paused);

        let state: SurfaceState =
            serde_json::from_str(r#"{"user_goal": "open chrome", "is_paused": true}"#).unwrap();
        assert_eq!(state.user_goal.as_deref(), Some("open chrome"));
        assert!(state.is_paused);
    }
}
