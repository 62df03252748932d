//! Configuration types for the assistant core.
//!
//! All sections deserialize with `#[serde(default)]` so a partial
//! `config.toml` falls back to working defaults field by field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Local model settings.
    pub llm: LocalLlmConfig,
    /// Cloud fallback model settings.
    pub cloud: CloudLlmConfig,
    /// Tool/shell/app safety rules.
    pub policy: PolicyConfig,
    /// Planner settings.
    pub planner: PlannerConfig,
    /// Event bus settings.
    pub events: EventBusConfig,
    /// History/reminder storage settings.
    pub storage: StorageConfig,
    /// Reminder-due poller settings.
    pub reminders: ReminderConfig,
    /// Voice capture/transcription/synthesis settings.
    pub voice: VoiceConfig,
}

/// Local model client configuration (Ollama-style HTTP endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalLlmConfig {
    /// Base URL of the local generation server.
    pub base_url: String,
    /// Model name to request.
    pub model: String,
    /// Per-request timeout in seconds.
    pub request_timeout_sec: u64,
    /// Maximum tokens to generate per request.
    pub max_tokens: u32,
}

impl Default for LocalLlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_owned(),
            model: "qwen2.5:7b-instruct".to_owned(),
            request_timeout_sec: 45,
            max_tokens: 512,
        }
    }
}

/// Cloud fallback model configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudLlmConfig {
    /// Whether cloud escalation is enabled at all.
    pub enabled: bool,
    /// Chat-completions endpoint URL.
    pub base_url: String,
    /// Model name to request.
    pub model: String,
    /// Bearer token. Empty means unconfigured; requests fail as warnings.
    pub api_key: String,
    /// Per-request timeout in seconds.
    pub timeout_sec: u64,
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Base delay between retries; attempt N waits `delay * N`.
    pub retry_delay_ms: u64,
}

impl Default for CloudLlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1/chat/completions".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            api_key: String::new(),
            timeout_sec: 30,
            max_retries: 2,
            retry_delay_ms: 750,
        }
    }
}

/// Safety rules consulted by the policy engine and the shell tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Tools that may appear in a plan at all.
    pub allowed_tools: Vec<String>,
    /// App key → launch command. Only these apps can be opened.
    pub allowed_apps: BTreeMap<String, String>,
    /// Shell commands must match one of these prefixes (whole-token).
    pub allowed_shell_prefixes: Vec<String>,
    /// Shell commands containing any of these terms are blocked.
    pub blocked_shell_terms: Vec<String>,
    /// Execute plans automatically when no step needs approval.
    pub auto_execute_low_risk: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut allowed_apps = BTreeMap::new();
        allowed_apps.insert("notepad".to_owned(), "notepad".to_owned());
        allowed_apps.insert("calculator".to_owned(), "calc".to_owned());
        allowed_apps.insert("vscode".to_owned(), "code".to_owned());
        allowed_apps.insert("chrome".to_owned(), "chrome".to_owned());
        allowed_apps.insert("files".to_owned(), "nautilus".to_owned());
        Self {
            allowed_tools: vec![
                "open_app".to_owned(),
                "media_control".to_owned(),
                "reminder".to_owned(),
                "code_agent".to_owned(),
                "safe_shell".to_owned(),
            ],
            allowed_apps,
            allowed_shell_prefixes: vec![
                "echo".to_owned(),
                "ls".to_owned(),
                "date".to_owned(),
                "uptime".to_owned(),
                "python --version".to_owned(),
            ],
            // Space-padded so they match whole tokens against the padded
            // command, not substrings of longer words.
            blocked_shell_terms: vec![
                " rm ".to_owned(),
                " del ".to_owned(),
                " format ".to_owned(),
                " mkfs ".to_owned(),
                " shutdown ".to_owned(),
                " reboot ".to_owned(),
                " sudo ".to_owned(),
            ],
            auto_execute_low_risk: true,
        }
    }
}

/// Planner limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Hard cap on steps per plan; extra steps are truncated.
    pub max_plan_steps: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { max_plan_steps: 6 }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Per-subscriber queue capacity. Oldest events drop on overflow.
    pub queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// Storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path. Parent directories are created on open.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/wisp.db"),
        }
    }
}

/// Reminder-due poller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderConfig {
    /// Seconds between due-reminder checks (clamped to at least 3).
    pub poll_interval_sec: u64,
}

impl ReminderConfig {
    /// Effective poll interval with the lower clamp applied.
    pub fn effective_poll_interval_sec(&self) -> u64 {
        self.poll_interval_sec.max(3)
    }
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self { poll_interval_sec: 5 }
    }
}

/// Voice pipeline and voice loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Directory polled for dropped-in audio/transcript files.
    pub input_dir: PathBuf,
    /// Directory where synthesized replies are written.
    pub output_dir: PathBuf,
    /// External STT command template; `{audio_path}` is substituted.
    /// Empty means no STT backend is configured.
    pub stt_command: String,
    /// External TTS command template; `{text}` and `{output_path}` are
    /// substituted. Empty means no TTS backend is configured.
    pub tts_command: String,
    /// External capture command template. Its stdout is either an audio file
    /// path or a raw transcript. Empty means capture is disabled and only the
    /// inbox directory is polled.
    pub capture_command: String,
    /// Trigger phrases that must prefix a command when wake-word gating is on.
    pub wake_words: Vec<String>,
    /// Session id the background voice loop reports under.
    pub loop_session_id: String,
    /// Mode the voice loop processes commands in ("chat"/"action"/"code").
    pub loop_mode: String,
    /// Whether the voice loop requires a wake word before acting.
    pub loop_require_wake_word: bool,
    /// Seconds between voice loop iterations (clamped to at least 1).
    pub loop_poll_interval_sec: u64,
    /// Start the voice loop together with the background workers.
    pub loop_auto_start: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/voice/inbox"),
            output_dir: PathBuf::from("data/voice/out"),
            stt_command: String::new(),
            tts_command: String::new(),
            capture_command: String::new(),
            wake_words: vec!["wisp".to_owned(), "hey wisp".to_owned()],
            loop_session_id: "voice-loop".to_owned(),
            loop_mode: "action".to_owned(),
            loop_require_wake_word: true,
            loop_poll_interval_sec: 2,
            loop_auto_start: false,
        }
    }
}

impl AssistantConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AssistantError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AssistantError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/wisp/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp/wisp-config"))
            .join("wisp")
            .join("config.toml")
    }
}
