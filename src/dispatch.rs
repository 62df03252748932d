//! Hybrid local/cloud dispatch for transcribed speech.
//!
//! A self-contained fast path: classify the transcript's intent with keyword
//! rules, prompt the local model for structured JSON, escalate to the cloud
//! model when deep reasoning is needed or the local response failed to
//! structure, and always return something usable. Callers can tell "model
//! answered" from "we guessed" via `backend`, attempt counts, and warnings.

use crate::config::CloudLlmConfig;
use crate::error::{AssistantError, Result};
use crate::llm::TextGenerator;
use crate::types::{AssistantMode, JsonMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keywords that flag a transcript as needing deep reasoning.
const DEEP_REASONING_TOKENS: &[&str] = &[
    "analyze",
    "reason",
    "compare",
    "tradeoff",
    "architecture",
    "deep",
    "why",
];

/// Keywords that classify a transcript as a coding request.
const CODE_TOKENS: &[&str] = &["code", "python", "typescript", "bug", "refactor"];

/// Keywords that classify a transcript as an automation request.
const AUTOMATION_TOKENS: &[&str] = &[
    "open ",
    "launch ",
    "play ",
    "run ",
    "execute ",
    "remind me",
    "set reminder",
];

/// Reply used when neither model produced usable output.
const DETERMINISTIC_FALLBACK_REPLY: &str =
    "I understood your request but could not get a model response. \
     I prepared structured actions for execution.";

/// Coarse intent of a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechIntent {
    Chat,
    Automation,
    Code,
    Unknown,
}

impl SpeechIntent {
    /// Stable string form used in events and storage rows.
    pub fn as_str(self) -> &'static str {
        match self {
            SpeechIntent::Chat => "chat",
            SpeechIntent::Automation => "automation",
            SpeechIntent::Code => "code",
            SpeechIntent::Unknown => "unknown",
        }
    }
}

/// Output of the rule-based intent classifier.
#[derive(Debug, Clone, Copy)]
pub struct IntentPrediction {
    pub intent: SpeechIntent,
    pub mode: AssistantMode,
    pub confidence: f64,
    pub requires_deep_reasoning: bool,
}

/// One tool invocation proposed by a model (or inferred from the transcript).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredAction {
    pub tool: String,
    #[serde(default)]
    pub args: JsonMap,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

/// Aggregated outcome of one dispatch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub transcript: String,
    pub intent: SpeechIntent,
    pub mode: AssistantMode,
    pub reply: String,
    pub actions: Vec<StructuredAction>,
    /// Which backend produced the reply: `local`, `cloud`,
    /// `deterministic-fallback`, or `none`.
    pub backend: String,
    pub used_cloud_fallback: bool,
    pub local_attempts: u32,
    pub cloud_attempts: u32,
    pub warnings: Vec<String>,
}

struct ParsedPayload {
    reply: String,
    actions: Vec<StructuredAction>,
    is_structured: bool,
}

/// Cloud reasoning backend. Errors are recorded as warnings by the
/// dispatcher, never surfaced to its caller.
#[async_trait::async_trait]
pub trait CloudReasoner: Send + Sync {
    /// Generate a reply for the dispatch prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// OpenAI-compatible chat-completions cloud backend.
pub struct OpenAiCompatReasoner {
    config: Arc<CloudLlmConfig>,
    client: reqwest::Client,
}

impl OpenAiCompatReasoner {
    /// Create a reasoner over the configured endpoint.
    pub fn new(config: Arc<CloudLlmConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec.max(1)))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait::async_trait]
impl CloudReasoner for OpenAiCompatReasoner {
    async fn generate(&self, prompt: &str) -> Result<String> {
        if self.config.api_key.is_empty() {
            return Err(AssistantError::Model(
                "cloud API key is not configured".to_owned(),
            ));
        }
        let payload = json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a reliable dispatcher reasoning model. \
                                Return strict JSON with 'reply' and 'actions'.",
                },
                {"role": "user", "content": prompt},
            ],
            "temperature": 0.2,
        });

        let response = self
            .client
            .post(&self.config.base_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AssistantError::Model(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AssistantError::Model(format!(
                "cloud returned status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AssistantError::Model(e.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_owned();
        Ok(content)
    }
}

/// Keyword-rule intent classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedIntentClassifier;

impl RuleBasedIntentClassifier {
    /// Classify a transcript into an intent and interaction mode.
    pub fn classify(&self, transcript: &str) -> IntentPrediction {
        let text = transcript.trim().to_lowercase();
        if text.is_empty() {
            return IntentPrediction {
                intent: SpeechIntent::Unknown,
                mode: AssistantMode::Chat,
                confidence: 0.0,
                requires_deep_reasoning: false,
            };
        }

        let requires_deep_reasoning = DEEP_REASONING_TOKENS
            .iter()
            .any(|token| text.contains(token));

        if CODE_TOKENS.iter().any(|token| text.contains(token)) {
            return IntentPrediction {
                intent: SpeechIntent::Code,
                mode: AssistantMode::Code,
                confidence: 0.86,
                requires_deep_reasoning: true,
            };
        }
        if AUTOMATION_TOKENS.iter().any(|token| text.contains(token)) {
            return IntentPrediction {
                intent: SpeechIntent::Automation,
                mode: AssistantMode::Action,
                confidence: 0.84,
                requires_deep_reasoning,
            };
        }
        IntentPrediction {
            intent: SpeechIntent::Chat,
            mode: AssistantMode::Chat,
            confidence: 0.77,
            requires_deep_reasoning,
        }
    }
}

/// Local-first dispatcher with cloud escalation and deterministic fallback.
pub struct HybridDispatcher {
    classifier: RuleBasedIntentClassifier,
    local: Arc<dyn TextGenerator>,
    cloud: Arc<dyn CloudReasoner>,
    cloud_config: Arc<CloudLlmConfig>,
}

impl HybridDispatcher {
    /// Create a dispatcher over the given backends.
    pub fn new(
        local: Arc<dyn TextGenerator>,
        cloud: Arc<dyn CloudReasoner>,
        cloud_config: Arc<CloudLlmConfig>,
    ) -> Self {
        Self {
            classifier: RuleBasedIntentClassifier,
            local,
            cloud,
            cloud_config,
        }
    }

    /// Classify, generate, and (maybe) escalate one transcript.
    pub async fn dispatch(
        &self,
        transcript: &str,
        session_id: &str,
        context: &JsonMap,
    ) -> DispatchResult {
        let cleaned = transcript.trim();
        if cleaned.is_empty() {
            return DispatchResult {
                transcript: String::new(),
                intent: SpeechIntent::Unknown,
                mode: AssistantMode::Chat,
                reply: "No transcript provided.".to_owned(),
                actions: Vec::new(),
                backend: "none".to_owned(),
                used_cloud_fallback: false,
                local_attempts: 0,
                cloud_attempts: 0,
                warnings: vec!["empty transcript".to_owned()],
            };
        }

        let prediction = self.classifier.classify(cleaned);
        let prompt = build_dispatch_prompt(cleaned, &prediction, session_id, context);

        let mut warnings: Vec<String> = Vec::new();
        let mut cloud_attempts = 0u32;

        let local_raw = self.local.generate(&prompt, prediction.mode).await;
        let local_attempts = 1u32;
        let local_parsed = parse_payload(&local_raw, cleaned, &prediction);

        let should_try_cloud = self.cloud_config.enabled
            && (prediction.requires_deep_reasoning || !local_parsed.is_structured);
        let mut cloud_answered = false;

        if should_try_cloud {
            debug!(
                deep = prediction.requires_deep_reasoning,
                structured = local_parsed.is_structured,
                "escalating dispatch to cloud"
            );
            let (cloud_raw, attempts, cloud_warnings) = self.generate_with_cloud_retry(&prompt).await;
            cloud_attempts = attempts;
            warnings.extend(cloud_warnings);
            if !cloud_raw.is_empty() {
                cloud_answered = true;
                let cloud_parsed = parse_payload(&cloud_raw, cleaned, &prediction);
                if !cloud_parsed.reply.is_empty() {
                    info!(attempts = cloud_attempts, "cloud fallback answered");
                    return DispatchResult {
                        transcript: cleaned.to_owned(),
                        intent: prediction.intent,
                        mode: prediction.mode,
                        reply: cloud_parsed.reply,
                        actions: cloud_parsed.actions,
                        backend: "cloud".to_owned(),
                        used_cloud_fallback: true,
                        local_attempts,
                        cloud_attempts,
                        warnings,
                    };
                }
            }
        }

        if !local_parsed.reply.is_empty() {
            if should_try_cloud && !cloud_answered {
                warnings.push("cloud fallback unavailable; returned local response".to_owned());
            }
            return DispatchResult {
                transcript: cleaned.to_owned(),
                intent: prediction.intent,
                mode: prediction.mode,
                reply: local_parsed.reply,
                actions: local_parsed.actions,
                backend: "local".to_owned(),
                used_cloud_fallback: false,
                local_attempts,
                cloud_attempts,
                warnings,
            };
        }

        warn!("both backends empty, using deterministic fallback");
        warnings.push("used deterministic fallback response".to_owned());
        DispatchResult {
            transcript: cleaned.to_owned(),
            intent: prediction.intent,
            mode: prediction.mode,
            reply: DETERMINISTIC_FALLBACK_REPLY.to_owned(),
            actions: infer_actions_from_transcript(cleaned, &prediction),
            backend: "deterministic-fallback".to_owned(),
            used_cloud_fallback: should_try_cloud,
            local_attempts,
            cloud_attempts,
            warnings,
        }
    }

    /// Retry the cloud backend with linear backoff. Empty responses and
    /// errors both count as failed attempts, recorded as warnings.
    async fn generate_with_cloud_retry(&self, prompt: &str) -> (String, u32, Vec<String>) {
        let mut attempts = 0u32;
        let mut warnings = Vec::new();
        let max_attempts = self.cloud_config.max_retries + 1;
        let delay = Duration::from_millis(self.cloud_config.retry_delay_ms);

        for index in 0..max_attempts {
            attempts += 1;
            match self.cloud.generate(prompt).await {
                Ok(text) if !text.trim().is_empty() => return (text, attempts, warnings),
                Ok(_) => warnings.push(format!("cloud attempt {attempts} returned empty response")),
                Err(e) => warnings.push(format!("cloud attempt {attempts} failed: {e}")),
            }
            if index < max_attempts - 1 && !delay.is_zero() {
                tokio::time::sleep(delay * (index + 1)).await;
            }
        }
        (String::new(), attempts, warnings)
    }
}

fn build_dispatch_prompt(
    transcript: &str,
    prediction: &IntentPrediction,
    session_id: &str,
    context: &JsonMap,
) -> String {
    format!(
        "You are the hybrid dispatcher.\n\
         Classified intent:\n\
         - intent: {}\n\
         - mode: {}\n\
         - requires_deep_reasoning: {}\n\
         - session_id: {}\n\
         - context: {}\n\n\
         Return strict JSON with schema:\n\
         {{\"reply\":\"string\",\"actions\":[{{\"tool\":\"string\",\"args\":{{}},\"confidence\":0.0,\"reason\":\"string\"}}]}}\n\n\
         Transcript: {}",
        prediction.intent.as_str(),
        prediction.mode.as_str(),
        prediction.requires_deep_reasoning,
        session_id,
        serde_json::Value::Object(context.clone()),
        transcript,
    )
}

fn parse_payload(payload_text: &str, transcript: &str, prediction: &IntentPrediction) -> ParsedPayload {
    let cleaned = payload_text.trim();
    if cleaned.is_empty() {
        return ParsedPayload {
            reply: String::new(),
            actions: Vec::new(),
            is_structured: false,
        };
    }

    let Some(parsed) = try_parse_json(cleaned) else {
        return ParsedPayload {
            reply: cleaned.to_owned(),
            actions: infer_actions_from_transcript(transcript, prediction),
            is_structured: false,
        };
    };

    let mut reply = parsed
        .get("reply")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_owned();
    if reply.is_empty() {
        reply = parsed
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_owned();
    }
    if reply.is_empty() {
        reply = cleaned.to_owned();
    }
    let actions = parse_actions(parsed.get("actions"), transcript, prediction);
    ParsedPayload {
        reply,
        actions,
        is_structured: true,
    }
}

/// Recover a JSON object from model output: strict parse, then a fenced
/// ```json block, then the outermost `{...}` slice.
fn try_parse_json(text: &str) -> Option<JsonMap> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(text) {
        return Some(map);
    }

    let lowered = text.to_lowercase();
    if let Some(fence_start) = lowered.find("```json") {
        let body_start = fence_start + "```json".len();
        if let Some(fence_len) = text[body_start..].find("```") {
            let candidate = text[body_start..body_start + fence_len].trim();
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(candidate) {
                return Some(map);
            }
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&text[start..=end]) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn parse_actions(
    actions_value: Option<&serde_json::Value>,
    transcript: &str,
    prediction: &IntentPrediction,
) -> Vec<StructuredAction> {
    let Some(serde_json::Value::Array(items)) = actions_value else {
        return infer_actions_from_transcript(transcript, prediction);
    };

    let mut parsed = Vec::new();
    for item in items {
        let Some(object) = item.as_object() else {
            continue;
        };
        let tool = object
            .get("tool")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_owned();
        if tool.is_empty() {
            continue;
        }
        let args = object
            .get("args")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        parsed.push(StructuredAction {
            tool,
            args,
            confidence: object.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0),
            reason: object
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_owned(),
        });
    }
    if parsed.is_empty() {
        return infer_actions_from_transcript(transcript, prediction);
    }
    parsed
}

/// Derive actions from the transcript when the model gave none. Automation
/// intents only; the trigger set mirrors the planner's but is intentionally
/// independent of it.
fn infer_actions_from_transcript(
    transcript: &str,
    prediction: &IntentPrediction,
) -> Vec<StructuredAction> {
    if prediction.intent != SpeechIntent::Automation {
        return Vec::new();
    }
    let text = transcript.trim().to_lowercase();
    let after_first_word = || {
        transcript
            .split_once(' ')
            .map(|(_, rest)| rest.trim().to_owned())
            .unwrap_or_default()
    };

    if text.starts_with("open ") || text.starts_with("launch ") {
        let mut args = JsonMap::new();
        args.insert("app_name".into(), json!(after_first_word()));
        return vec![StructuredAction {
            tool: "open_app".to_owned(),
            args,
            confidence: 0.62,
            reason: "inferred from open/launch command".to_owned(),
        }];
    }
    if text.starts_with("play ") {
        let mut args = JsonMap::new();
        args.insert("action".into(), json!("play"));
        args.insert("query".into(), json!(after_first_word()));
        return vec![StructuredAction {
            tool: "media_control".to_owned(),
            args,
            confidence: 0.61,
            reason: "inferred from play command".to_owned(),
        }];
    }
    if text.contains("remind me") || text.contains("set reminder") {
        let mut args = JsonMap::new();
        args.insert("text".into(), json!(transcript));
        return vec![StructuredAction {
            tool: "reminder".to_owned(),
            args,
            confidence: 0.65,
            reason: "inferred from reminder phrase".to_owned(),
        }];
    }
    if text.starts_with("run ") || text.starts_with("execute ") {
        let mut args = JsonMap::new();
        args.insert("command".into(), json!(after_first_word()));
        return vec![StructuredAction {
            tool: "safe_shell".to_owned(),
            args,
            confidence: 0.55,
            reason: "inferred from run/execute command".to_owned(),
        }];
    }
    Vec::new()
}
