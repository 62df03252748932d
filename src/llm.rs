//! Model generation seam: local client and the trait both backends share.
//!
//! The core treats text generation as a single async function. Backends
//! return an empty string when they are unavailable — "empty means failure"
//! is the whole error contract, and callers fall back rather than error out.

use crate::config::LocalLlmConfig;
use crate::types::AssistantMode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Text generation backend. Implementations must return an empty string (not
/// an error) when no answer can be produced.
#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a reply for `prompt` under the given interaction mode.
    async fn generate(&self, prompt: &str, mode: AssistantMode) -> String;
}

/// System prompt used for each mode.
pub fn system_prompt(mode: AssistantMode) -> &'static str {
    match mode {
        AssistantMode::Code => {
            "You are a code assistant. Write precise, runnable code and explain \
             assumptions briefly. Prefer safe local-first instructions."
        }
        AssistantMode::Action => {
            "You are an action assistant. Be concise, deterministic, and \
             safety-aware. When actions are involved, summarize the plan and \
             required approvals."
        }
        AssistantMode::Chat => {
            "You are an offline assistant. Respond clearly and accurately. \
             Prefer practical and direct answers."
        }
    }
}

/// Canned reply used when the local model produced no output.
pub fn offline_fallback(prompt: &str, mode: AssistantMode) -> String {
    match mode {
        AssistantMode::Code => format!(
            "Local model is unavailable. I can still help with structure and \
             pseudocode. Start from this task: {}",
            prompt.trim()
        ),
        AssistantMode::Action => {
            "I prepared an action plan using local rules. Approve required steps to execute."
                .to_owned()
        }
        AssistantMode::Chat => format!("Offline fallback response: {}", prompt.trim()),
    }
}

/// HTTP client for an Ollama-style local generation endpoint.
pub struct LocalLlmClient {
    config: Arc<LocalLlmConfig>,
    client: reqwest::Client,
}

impl LocalLlmClient {
    /// Create a client over the configured endpoint.
    pub fn new(config: Arc<LocalLlmConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_sec.max(1)))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait::async_trait]
impl TextGenerator for LocalLlmClient {
    async fn generate(&self, prompt: &str, mode: AssistantMode) -> String {
        let payload = json!({
            "model": self.config.model,
            "prompt": prompt,
            "system": system_prompt(mode),
            "stream": false,
            "options": {"temperature": 0.2, "num_predict": self.config.max_tokens},
        });
        let url = format!("{}/api/generate", self.config.base_url.trim_end_matches('/'));

        let response = match self.client.post(&url).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "local model request failed");
                return String::new();
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "local model returned error status");
            return String::new();
        }
        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "local model returned unparseable body");
                return String::new();
            }
        };
        let text = body
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_owned();
        debug!(chars = text.len(), "local model replied");
        text
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> LocalLlmClient {
        LocalLlmClient::new(Arc::new(LocalLlmConfig {
            base_url: server.uri(),
            model: "test-model".to_owned(),
            request_timeout_sec: 5,
            max_tokens: 64,
        }))
    }

    #[tokio::test]
    async fn generate_returns_trimmed_response_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"response": "  hello there \n"})),
            )
            .mount(&server)
            .await;

        let reply = client_for(&server).generate("hi", AssistantMode::Chat).await;
        assert_eq!(reply, "hello there");
    }

    #[tokio::test]
    async fn generate_returns_empty_on_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reply = client_for(&server).generate("hi", AssistantMode::Chat).await;
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn generate_returns_empty_when_server_unreachable() {
        let client = LocalLlmClient::new(Arc::new(LocalLlmConfig {
            base_url: "http://127.0.0.1:9".to_owned(),
            model: "test-model".to_owned(),
            request_timeout_sec: 1,
            max_tokens: 64,
        }));
        let reply = client.generate("hi", AssistantMode::Chat).await;
        assert!(reply.is_empty());
    }

    #[test]
    fn offline_fallback_varies_by_mode() {
        assert!(offline_fallback("task", AssistantMode::Code).contains("task"));
        assert!(offline_fallback("x", AssistantMode::Action).contains("action plan"));
        assert!(offline_fallback("hi", AssistantMode::Chat).contains("hi"));
    }

    #[test]
    fn system_prompts_are_distinct() {
        let prompts = [
            system_prompt(AssistantMode::Chat),
            system_prompt(AssistantMode::Action),
            system_prompt(AssistantMode::Code),
        ];
        assert_ne!(prompts[0], prompts[1]);
        assert_ne!(prompts[1], prompts[2]);
    }
}
