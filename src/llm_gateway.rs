use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::warn;

use crate::config_manager::AgentConfig;
use crate::schema::{Goal, Objective};

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    fn to_json(&self) -> Value {
        json!({ "role": self.role, "content": self.content })
    }
}

/// Normalized reply shape shared by both backends. Transport failures come
/// back as `Err`; model-level problems (refusal, empty content) come back
/// in-band through `error` so callers can degrade instead of aborting.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub session_id: String,
    pub error: Option<String>,
}

impl LlmReply {
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.text.trim().is_empty()
    }
}

/// Remote language-model capability: ordered messages in, free text out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        objective: &str,
        session_id: &str,
    ) -> Result<LlmReply>;
}

/// Shared POST with bounded retry: 3 attempts, exponential backoff, retried
/// on network errors, 5xx and 429. 4xx other than 429 returns immediately.
async fn post_with_retry(client: &Client, url: &str, api_key: &str, body: &Value) -> Result<reqwest::Response> {
    let max_retries = 3;
    let mut attempt = 0;
    let mut backoff = Duration::from_secs(1);

    loop {
        attempt += 1;
        let mut req = client.post(url).json(body);
        if !api_key.is_empty() {
            req = req.bearer_auth(api_key);
        }
        match req.send().await {
            Ok(resp) => {
                if resp.status().is_server_error() || resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    if attempt > max_retries {
                        return Ok(resp);
                    }
                } else {
                    return Ok(resp);
                }
            }
            Err(e) => {
                if attempt > max_retries {
                    return Err(anyhow::anyhow!("Max retries exceeded: {}", e));
                }
                warn!("LLM network error (attempt {}/{}): {}. Retrying in {:?}", attempt, max_retries, e, backoff);
            }
        }

        sleep(backoff).await;
        backoff *= 2;
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    let client = Client::builder()
        .no_proxy()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}

/// Non-streaming chat-completions backend (OpenAI-compatible endpoint).
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.request_timeout())?,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiBackend {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _objective: &str,
        session_id: &str,
    ) -> Result<LlmReply> {
        let body = json!({
            "model": self.model,
            "messages": messages.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
            "temperature": 0.2,
        });

        let url = format!("{}/chat/completions", self.base_url);
        let response = post_with_retry(&self.client, &url, &self.api_key, &body).await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Ok(LlmReply {
                text: String::new(),
                session_id: session_id.to_string(),
                error: Some(format!("API error: {}", error_text)),
            });
        }

        let body: Value = response.json().await?;

        if let Some(refusal) = body["choices"][0]["message"]["refusal"].as_str() {
            return Ok(LlmReply {
                text: String::new(),
                session_id: session_id.to_string(),
                error: Some(format!("Model refused: {}", refusal)),
            });
        }

        match body["choices"][0]["message"]["content"].as_str() {
            Some(content) if !content.trim().is_empty() => Ok(LlmReply {
                text: content.to_string(),
                session_id: session_id.to_string(),
                error: None,
            }),
            _ => Ok(LlmReply {
                text: String::new(),
                session_id: session_id.to_string(),
                error: Some("No content in model response".to_string()),
            }),
        }
    }
}

/// Streaming backend for local OpenAI-compatible servers. Consumes the SSE
/// stream and accumulates deltas into the same `LlmReply` shape as the
/// non-streaming backend.
pub struct LmStreamBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LmStreamBackend {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.request_timeout())?,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }
}

#[async_trait]
impl LanguageModel for LmStreamBackend {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _objective: &str,
        session_id: &str,
    ) -> Result<LlmReply> {
        use futures::StreamExt;

        let body = json!({
            "model": self.model,
            "messages": messages.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
            "temperature": 0.2,
            "stream": true,
        });

        let url = format!("{}/chat/completions", self.base_url);
        let response = post_with_retry(&self.client, &url, &self.api_key, &body).await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Ok(LlmReply {
                text: String::new(),
                session_id: session_id.to_string(),
                error: Some(format!("Stream API error: {}", error_text)),
            });
        }

        let mut full_content = String::new();
        let mut stream = response.bytes_stream();
        let mut partial = String::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            partial.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames can split mid-line; keep the trailing fragment.
            while let Some(newline) = partial.find('\n') {
                let line: String = partial.drain(..=newline).collect();
                let line = line.trim();
                if let Some(data) = line.strip_prefix("data: ") {
                    if data == "[DONE]" {
                        partial.clear();
                        break;
                    }
                    if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                        if let Some(delta) = parsed["choices"][0]["delta"]["content"].as_str() {
                            full_content.push_str(delta);
                        }
                    }
                }
            }
        }

        if full_content.trim().is_empty() {
            return Ok(LlmReply {
                text: String::new(),
                session_id: session_id.to_string(),
                error: Some("Stream produced no content".to_string()),
            });
        }

        Ok(LlmReply {
            text: full_content,
            session_id: session_id.to_string(),
            error: None,
        })
    }
}

pub fn backend_from_config(config: &AgentConfig) -> Result<std::sync::Arc<dyn LanguageModel>> {
    match config.llm_backend.as_str() {
        "stream" => Ok(std::sync::Arc::new(LmStreamBackend::new(config)?)),
        _ => Ok(std::sync::Arc::new(OpenAiBackend::new(config)?)),
    }
}

/// Elaborate the raw goal into an Objective. The model is asked for
/// reasoning followed by a final actionable line; the last non-empty line
/// is taken as the objective.
pub async fn formulate_objective(llm: &dyn LanguageModel, goal: &Goal) -> Result<Objective> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let messages = vec![
        ChatMessage::system(crate::prompts::OBJECTIVE_SYSTEM_PROMPT),
        ChatMessage::user(format!("GOAL: {}", goal.text)),
    ];

    let reply = llm.complete(messages, &goal.text, &session_id).await?;
    if let Some(err) = reply.error {
        return Err(anyhow::anyhow!("Objective formulation failed: {}", err));
    }

    let text = reply
        .text
        .lines()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .unwrap_or(goal.text.as_str())
        .to_string();

    if text.is_empty() {
        return Err(anyhow::anyhow!("Objective formulation returned empty text"));
    }

    Ok(Objective::new(text))
}
