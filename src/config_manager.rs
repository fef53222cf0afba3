use std::env;
use std::time::Duration;

/// Runtime configuration, read from `.env` (if present) overlaid by process
/// environment variables. Loaded once at startup; every engine instance gets
/// its own clone.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// "openai" (plain chat completions) or "stream" (SSE accumulation).
    pub llm_backend: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,

    pub perception_url: String,
    pub surface_url: String,

    pub max_retries_per_step: u32,
    pub max_consecutive_errors: u32,
    pub action_delay_ms: u64,
    pub pause_poll_ms: u64,
    pub request_timeout_secs: u64,
    pub dispatch_timeout_secs: u64,
    pub goal_poll_ms: u64,

    /// Drive the screen to the desktop before the first capture of a goal.
    pub desktop_anchor: bool,
}

impl AgentConfig {
    pub fn load() -> Self {
        dotenv::dotenv().ok();

        Self {
            llm_backend: env_str("DESKDRIVER_LLM_BACKEND", "openai"),
            llm_base_url: env_str("DESKDRIVER_LLM_URL", "https://api.openai.com/v1"),
            llm_api_key: env_str("DESKDRIVER_LLM_API_KEY", ""),
            llm_model: env_str("DESKDRIVER_LLM_MODEL", "gpt-4o"),
            perception_url: env_str("DESKDRIVER_PERCEPTION_URL", "http://127.0.0.1:8111"),
            surface_url: env_str("DESKDRIVER_SURFACE_URL", "http://127.0.0.1:8000"),
            max_retries_per_step: env_u32("DESKDRIVER_MAX_RETRIES_PER_STEP", 3),
            max_consecutive_errors: env_u32("DESKDRIVER_MAX_CONSECUTIVE_ERRORS", 5),
            action_delay_ms: env_u64("DESKDRIVER_ACTION_DELAY_MS", 2000),
            pause_poll_ms: env_u64("DESKDRIVER_PAUSE_POLL_MS", 500),
            request_timeout_secs: env_u64("DESKDRIVER_REQUEST_TIMEOUT_SECS", 120),
            dispatch_timeout_secs: env_u64("DESKDRIVER_DISPATCH_TIMEOUT_SECS", 5),
            goal_poll_ms: env_u64("DESKDRIVER_GOAL_POLL_MS", 500),
            desktop_anchor: env_bool("DESKDRIVER_DESKTOP_ANCHOR", false),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::load()
    }
}

fn env_str(key: &str, default_val: &str) -> String {
    env::var(key).unwrap_or_else(|_| default_val.to_string())
}

fn env_u32(key: &str, default_val: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default_val)
}

fn env_u64(key: &str, default_val: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default_val)
}

fn env_bool(key: &str, default_val: bool) -> bool {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim().to_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        }
        Err(_) => default_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_variants() {
        env::set_var("DESKDRIVER_TEST_FLAG", "yes");
        assert!(env_bool("DESKDRIVER_TEST_FLAG", false));
        env::set_var("DESKDRIVER_TEST_FLAG", "0");
        assert!(!env_bool("DESKDRIVER_TEST_FLAG", true));
        env::remove_var("DESKDRIVER_TEST_FLAG");
        assert!(env_bool("DESKDRIVER_TEST_FLAG", true));
    }

    #[test]
    fn test_env_u32_fallback_on_garbage() {
        env::set_var("DESKDRIVER_TEST_NUM", "not-a-number");
        assert_eq!(env_u32("DESKDRIVER_TEST_NUM", 7), 7);
        env::set_var("DESKDRIVER_TEST_NUM", "12");
        assert_eq!(env_u32("DESKDRIVER_TEST_NUM", 7), 12);
        env::remove_var("DESKDRIVER_TEST_NUM");
    }
}
