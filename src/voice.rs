//! Voice I/O collaborator: capture, transcription, synthesis, wake words.
//!
//! Backends are external commands configured as template strings; a missing
//! backend is a warning in the result, never an error, so the voice loop can
//! run unconfigured (inbox polling + `.txt` transcripts still work). All
//! calls are safe to make from a background loop.

use crate::config::VoiceConfig;
use crate::error::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Timeout for external STT/TTS/capture commands.
const EXTERNAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(45);

/// Result of one transcription attempt.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionResult {
    pub text: String,
    pub backend: String,
    pub warning: String,
}

/// Result of one synthesis attempt.
#[derive(Debug, Clone, Default)]
pub struct SynthesisResult {
    pub audio_path: String,
    pub backend: String,
    pub warning: String,
}

/// Result of one capture attempt: either an audio path to transcribe or a
/// transcript directly, depending on what the capture command printed.
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    pub path: Option<PathBuf>,
    pub transcript: String,
    pub backend: String,
    pub warning: String,
}

/// Wrapper around external voice backends and the audio inbox directory.
pub struct VoicePipeline {
    config: Arc<VoiceConfig>,
}

impl VoicePipeline {
    /// Create the pipeline, ensuring the inbox and output directories exist.
    pub fn new(config: Arc<VoiceConfig>) -> Result<Self> {
        std::fs::create_dir_all(&config.input_dir)?;
        std::fs::create_dir_all(&config.output_dir)?;
        Ok(Self { config })
    }

    /// Directory polled for dropped-in audio/transcript files.
    pub fn input_dir(&self) -> &Path {
        &self.config.input_dir
    }

    /// Transcribe an audio (or `.txt` transcript) file.
    pub async fn transcribe(&self, audio_path: &Path) -> TranscriptionResult {
        if !audio_path.exists() {
            return TranscriptionResult {
                backend: "none".to_owned(),
                warning: format!("File not found: {}", audio_path.display()),
                ..Default::default()
            };
        }

        if !self.config.stt_command.trim().is_empty() {
            let command = self
                .config
                .stt_command
                .replace("{audio_path}", &audio_path.display().to_string());
            if let Some(output) = run_external_command(&command).await {
                if !output.is_empty() {
                    return TranscriptionResult {
                        text: output,
                        backend: "command".to_owned(),
                        warning: String::new(),
                    };
                }
            }
        }

        if audio_path.extension().and_then(|e| e.to_str()) == Some("txt") {
            return match std::fs::read_to_string(audio_path) {
                Ok(text) => TranscriptionResult {
                    text: text.trim().to_owned(),
                    backend: "txt-fallback".to_owned(),
                    warning: String::new(),
                },
                Err(e) => TranscriptionResult {
                    backend: "txt-fallback".to_owned(),
                    warning: e.to_string(),
                    ..Default::default()
                },
            };
        }

        TranscriptionResult {
            backend: "none".to_owned(),
            warning: "No STT backend configured. Set voice.stt_command or drop .txt files for fallback."
                .to_owned(),
            ..Default::default()
        }
    }

    /// Synthesize speech for `text`, falling back to writing a text file when
    /// no TTS backend is configured.
    pub async fn synthesize(&self, text: &str) -> SynthesisResult {
        let safe_text = text.trim();
        if safe_text.is_empty() {
            return SynthesisResult {
                backend: "none".to_owned(),
                warning: "Text is empty".to_owned(),
                ..Default::default()
            };
        }

        if !self.config.tts_command.trim().is_empty() {
            let target = self.config.output_dir.join(format!("reply_{}.wav", short_id()));
            let command = self
                .config
                .tts_command
                .replace("{text}", &safe_text.replace('"', ""))
                .replace("{output_path}", &target.display().to_string());
            if run_external_command(&command).await.is_some() && target.exists() {
                return SynthesisResult {
                    audio_path: target.display().to_string(),
                    backend: "command".to_owned(),
                    warning: String::new(),
                };
            }
        }

        let fallback = self.config.output_dir.join(format!("reply_{}.txt", short_id()));
        if let Err(e) = std::fs::write(&fallback, safe_text) {
            return SynthesisResult {
                backend: "text-fallback".to_owned(),
                warning: e.to_string(),
                ..Default::default()
            };
        }
        SynthesisResult {
            audio_path: fallback.display().to_string(),
            backend: "text-fallback".to_owned(),
            warning: "No TTS backend configured. Set voice.tts_command to generate audio.".to_owned(),
        }
    }

    /// Run the configured capture command once. With no command configured
    /// this is a quiet no-op so inbox polling remains the only source.
    pub async fn capture_once(&self) -> CaptureResult {
        if self.config.capture_command.trim().is_empty() {
            return CaptureResult {
                backend: "none".to_owned(),
                ..Default::default()
            };
        }

        let Some(output) = run_external_command(&self.config.capture_command).await else {
            return CaptureResult {
                backend: "command".to_owned(),
                warning: "capture command failed".to_owned(),
                ..Default::default()
            };
        };
        if output.is_empty() {
            return CaptureResult {
                backend: "command".to_owned(),
                ..Default::default()
            };
        }

        let candidate = PathBuf::from(&output);
        if candidate.is_file() {
            CaptureResult {
                path: Some(candidate),
                backend: "command".to_owned(),
                ..Default::default()
            }
        } else {
            CaptureResult {
                transcript: output,
                backend: "command".to_owned(),
                ..Default::default()
            }
        }
    }

    /// First file in the inbox directory not present in `seen`, by name order.
    pub fn next_inbox_file(&self, seen: &HashSet<String>) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.config.input_dir).ok()?;
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        files.into_iter().find(|path| !seen.contains(&canonical_key(path)))
    }

    /// Store an uploaded voice file into the inbox and return its path.
    pub fn save_upload(&self, filename: &str, content: &[u8]) -> Result<PathBuf> {
        let clean_name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("voice_input.bin");
        let target = self
            .config
            .input_dir
            .join(format!("{}_{clean_name}", short_id()));
        std::fs::write(&target, content)?;
        Ok(target)
    }

    /// Wake-word gate: returns whether a wake word was detected and the
    /// command text remaining after it.
    pub fn parse_wake_command(&self, text: &str) -> (bool, String) {
        let lowered = text.to_lowercase();
        let mut best: Option<usize> = None;
        for wake_word in &self.config.wake_words {
            let needle = wake_word.trim().to_lowercase();
            if needle.is_empty() {
                continue;
            }
            if let Some(idx) = lowered.find(&needle) {
                let end = idx + needle.len();
                best = Some(best.map_or(end, |current: usize| current.max(end)));
            }
        }
        match best {
            Some(end) => {
                let remainder = text[end..]
                    .trim_start_matches(|c: char| c.is_whitespace() || c == ',' || c == '.' || c == ':' || c == '!')
                    .trim()
                    .to_owned();
                (true, remainder)
            }
            None => (false, String::new()),
        }
    }
}

/// Stable identity for a seen-file set entry.
pub fn canonical_key(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_owned())
        .display()
        .to_string()
}

fn short_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..10].to_owned()
}

/// Run one external command with a timeout; returns trimmed stdout on a zero
/// exit, `None` otherwise. Failures are logged, not raised.
async fn run_external_command(command: &str) -> Option<String> {
    let tokens = split_command(command);
    let (program, args) = tokens.split_first()?;

    let run = Command::new(program).args(args).kill_on_drop(true).output();
    let output = match tokio::time::timeout(EXTERNAL_COMMAND_TIMEOUT, run).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(command, error = %e, "external voice command failed to start");
            return None;
        }
        Err(_) => {
            warn!(command, "external voice command timed out");
            return None;
        }
    };
    if !output.status.success() {
        debug!(command, status = ?output.status.code(), "external voice command returned nonzero");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Split a command template into argv tokens, honoring single and double
/// quotes so substituted text with spaces stays one argument.
fn split_command(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
