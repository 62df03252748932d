//! Core data model: plans, runs, steps, and the decisions attached to them.
//!
//! Entities here are plain serde-serializable records. The orchestrator owns
//! plans and runs after creation; everything else is passed by value between
//! components. String timestamps are RFC 3339 UTC so event and storage
//! payloads stay wire-stable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// JSON object type used for tool args and result data.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Current UTC time as an RFC 3339 string.
pub fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Top-level interaction mode for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantMode {
    /// Conversational reply, no planning.
    Chat,
    /// Automation request: plan and (maybe) execute tools.
    Action,
    /// Code generation request.
    Code,
}

impl AssistantMode {
    /// Stable string form used in events and storage rows.
    pub fn as_str(self) -> &'static str {
        match self {
            AssistantMode::Chat => "chat",
            AssistantMode::Action => "action",
            AssistantMode::Code => "code",
        }
    }

    /// Parse a mode from loosely-formatted text, defaulting to `Action`.
    pub fn from_text(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "chat" => AssistantMode::Chat,
            "code" => AssistantMode::Code,
            _ => AssistantMode::Action,
        }
    }
}

impl fmt::Display for AssistantMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk classification attached to a step by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Stable string form used in events and storage rows.
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Lifecycle of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Running,
    Completed,
    Failed,
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    PartialSuccess,
}

impl RunStatus {
    /// Stable string form used in events and storage rows.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::PartialSuccess => "partial_success",
        }
    }
}

/// Status of a single step within a run timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Planned,
    Running,
    Success,
    Failed,
    Skipped,
    Blocked,
}

/// One step of a plan.
///
/// `tool == None` means "answer directly with the model". Steps are scored by
/// the policy engine once at plan-creation time; after that the only mutation
/// is the `[BLOCKED: ...]` description annotation the planner applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub args: JsonMap,
    pub risk: RiskLevel,
    pub needs_approval: bool,
}

impl PlanStep {
    /// Create a step invoking `tool` with the given args.
    pub fn with_tool(id: impl Into<String>, description: impl Into<String>, tool: &str, args: JsonMap) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: Some(tool.to_owned()),
            args,
            risk: RiskLevel::Low,
            needs_approval: false,
        }
    }

    /// Create a direct-answer step (no tool).
    pub fn direct(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: None,
            args: JsonMap::new(),
            risk: RiskLevel::Low,
            needs_approval: false,
        }
    }
}

/// An ordered, capped sequence of steps derived from one user goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub mode: AssistantMode,
    pub status: PlanStatus,
    pub created_at: String,
    pub steps: Vec<PlanStep>,
}

/// One append-only entry in a run's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStepEvent {
    pub timestamp: String,
    pub step_id: String,
    pub status: StepStatus,
    pub message: String,
    #[serde(default)]
    pub data: JsonMap,
}

/// One execution attempt of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRun {
    pub id: String,
    pub plan_id: String,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub timeline: Vec<RunStepEvent>,
}

/// Output of one policy evaluation. Pure data, embedded where needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub risk: RiskLevel,
    pub needs_approval: bool,
    pub reason: String,
}

/// Result of one tool invocation. Tools never raise: every failure path is
/// encoded as `success == false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: JsonMap,
}

impl ToolExecutionResult {
    /// Successful result with a message and no data.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: JsonMap::new(),
        }
    }

    /// Successful result with attached data.
    pub fn ok_with(message: impl Into<String>, data: JsonMap) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    /// Failure result with a message and no data.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: JsonMap::new(),
        }
    }

    /// Failure result with attached data.
    pub fn fail_with(message: impl Into<String>, data: JsonMap) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
        }
    }
}

/// Reply produced by the chat entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub reply: String,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Outcome of processing one voice command (text or transcribed audio).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceCommandOutcome {
    pub transcript: String,
    pub reply: String,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub audio_path: String,
    #[serde(default)]
    pub stt_backend: String,
    #[serde(default)]
    pub tts_backend: String,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Public snapshot of the voice loop state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceLoopSnapshot {
    pub running: bool,
    pub session_id: String,
    pub mode: AssistantMode,
    pub require_wake_word: bool,
    pub poll_interval_sec: u64,
    pub wake_words: Vec<String>,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub last_transcript: String,
    pub last_command: String,
    pub last_reply: String,
    pub last_backend: String,
    pub last_error: String,
    pub started_at: Option<String>,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn mode_string_round_trip() {
        for mode in [AssistantMode::Chat, AssistantMode::Action, AssistantMode::Code] {
            assert_eq!(AssistantMode::from_text(mode.as_str()), mode);
        }
    }

    #[test]
    fn mode_from_text_defaults_to_action() {
        assert_eq!(AssistantMode::from_text("unknown"), AssistantMode::Action);
        assert_eq!(AssistantMode::from_text(""), AssistantMode::Action);
        assert_eq!(AssistantMode::from_text("  CHAT "), AssistantMode::Chat);
    }

    #[test]
    fn run_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::PartialSuccess).unwrap();
        assert_eq!(json, "\"partial_success\"");
    }

    #[test]
    fn plan_step_constructors() {
        let direct = PlanStep::direct("step_1", "Respond directly");
        assert!(direct.tool.is_none());
        assert!(!direct.needs_approval);

        let mut args = JsonMap::new();
        args.insert("app_name".into(), serde_json::Value::String("notepad".into()));
        let tool = PlanStep::with_tool("step_2", "Open notepad", "open_app", args);
        assert_eq!(tool.tool.as_deref(), Some("open_app"));
    }

    #[test]
    fn utc_now_iso_parses_back() {
        let now = utc_now_iso();
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
