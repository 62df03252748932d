//! Background voice loop: capture → wake-word gate → command pipeline.
//!
//! A singleton worker that continuously captures audio (or polls the inbox
//! directory for dropped-in files), transcribes what it finds, gates it
//! through wake-word detection, and feeds surviving commands into the same
//! text-processing path used by `process_voice_text`. Start is idempotent —
//! repeated starts only update parameters — and any fault inside one
//! iteration is recorded and published without killing the worker.

use super::{Orchestrator, WorkerHandle};
use crate::config::VoiceConfig;
use crate::error::Result;
use crate::types::{AssistantMode, VoiceLoopSnapshot, utc_now_iso};
use crate::voice::canonical_key;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Singleton voice-loop state, guarded by the orchestrator lock.
pub(crate) struct VoiceLoopState {
    pub(crate) running: bool,
    pub(crate) session_id: String,
    pub(crate) mode: AssistantMode,
    pub(crate) require_wake_word: bool,
    pub(crate) poll_interval_sec: u64,
    wake_words: Vec<String>,
    processed_count: u64,
    skipped_count: u64,
    last_transcript: String,
    last_command: String,
    last_reply: String,
    last_backend: String,
    last_error: String,
    started_at: Option<String>,
    updated_at: String,
}

impl VoiceLoopState {
    pub(crate) fn from_config(config: &VoiceConfig) -> Self {
        Self {
            running: false,
            session_id: config.loop_session_id.clone(),
            mode: AssistantMode::from_text(&config.loop_mode),
            require_wake_word: config.loop_require_wake_word,
            poll_interval_sec: config.loop_poll_interval_sec.max(1),
            wake_words: config.wake_words.clone(),
            processed_count: 0,
            skipped_count: 0,
            last_transcript: String::new(),
            last_command: String::new(),
            last_reply: String::new(),
            last_backend: String::new(),
            last_error: String::new(),
            started_at: None,
            updated_at: utc_now_iso(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = utc_now_iso();
    }

    pub(crate) fn snapshot(&self) -> VoiceLoopSnapshot {
        VoiceLoopSnapshot {
            running: self.running,
            session_id: self.session_id.clone(),
            mode: self.mode,
            require_wake_word: self.require_wake_word,
            poll_interval_sec: self.poll_interval_sec,
            wake_words: self.wake_words.clone(),
            processed_count: self.processed_count,
            skipped_count: self.skipped_count,
            last_transcript: self.last_transcript.clone(),
            last_command: self.last_command.clone(),
            last_reply: self.last_reply.clone(),
            last_backend: self.last_backend.clone(),
            last_error: self.last_error.clone(),
            started_at: self.started_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// Optional parameter overrides for [`Orchestrator::start_voice_loop`].
#[derive(Debug, Clone, Default)]
pub struct VoiceLoopOptions {
    pub session_id: Option<String>,
    pub mode: Option<AssistantMode>,
    pub require_wake_word: Option<bool>,
    pub poll_interval_sec: Option<u64>,
}

impl Orchestrator {
    /// Start the voice loop, or update its parameters if already running.
    ///
    /// Only a `false → true` running transition spawns a worker task and
    /// publishes `voice.loop.started`; repeated starts apply the overrides
    /// without restarting. On a real start the current inbox file set is
    /// snapshotted as already seen, so only files arriving afterwards react.
    pub async fn start_voice_loop(self: &Arc<Self>, options: VoiceLoopOptions) -> VoiceLoopSnapshot {
        // Inbox listing is disk I/O, so it happens before the lock.
        let current_inbox = self.list_current_inbox_files();

        let (started, snapshot) = {
            let mut state = self.lock_state();
            let voice_loop = &mut state.voice_loop;
            if let Some(session_id) = options.session_id {
                voice_loop.session_id = session_id;
            }
            if let Some(mode) = options.mode {
                voice_loop.mode = mode;
            }
            if let Some(require_wake_word) = options.require_wake_word {
                voice_loop.require_wake_word = require_wake_word;
            }
            if let Some(poll_interval_sec) = options.poll_interval_sec {
                voice_loop.poll_interval_sec = poll_interval_sec.max(1);
            }

            let mut started = false;
            if !voice_loop.running {
                started = true;
                voice_loop.running = true;
                voice_loop.processed_count = 0;
                voice_loop.skipped_count = 0;
                voice_loop.last_transcript.clear();
                voice_loop.last_command.clear();
                voice_loop.last_reply.clear();
                voice_loop.last_backend.clear();
                voice_loop.last_error.clear();
                voice_loop.started_at = Some(utc_now_iso());
            }
            voice_loop.touch();
            let snapshot = voice_loop.snapshot();
            if started {
                state.voice_loop_seen_files = current_inbox;
            }
            (started, snapshot)
        };

        if started {
            let cancel = CancellationToken::new();
            let handle = self.spawn_voice_loop_worker(cancel.clone());
            self.lock_state().voice_loop_worker = Some(WorkerHandle { cancel, handle });
            info!(
                session = snapshot.session_id.as_str(),
                wake_word = snapshot.require_wake_word,
                "voice loop started"
            );
            self.publish(json!({
                "type": "voice.loop.started",
                "session_id": snapshot.session_id,
                "mode": snapshot.mode.as_str(),
                "require_wake_word": snapshot.require_wake_word,
                "poll_interval_sec": snapshot.poll_interval_sec,
            }));
        }
        snapshot
    }

    /// Stop the voice loop, cancelling the worker and awaiting it before
    /// returning a consistent snapshot. Stopping twice is a no-op.
    pub async fn stop_voice_loop(&self) -> VoiceLoopSnapshot {
        let (stopped, worker, snapshot) = {
            let mut state = self.lock_state();
            let mut stopped = false;
            if state.voice_loop.running {
                stopped = true;
                state.voice_loop.running = false;
                state.voice_loop.touch();
            }
            let worker = state.voice_loop_worker.take();
            (stopped, worker, state.voice_loop.snapshot())
        };

        if let Some(worker) = worker {
            worker.cancel.cancel();
            let _ = worker.handle.await;
        }
        if stopped {
            info!("voice loop stopped");
            self.publish(json!({
                "type": "voice.loop.stopped",
                "session_id": snapshot.session_id,
            }));
        }
        snapshot
    }

    /// Current voice loop snapshot.
    pub fn voice_loop_state(&self) -> VoiceLoopSnapshot {
        self.lock_state().voice_loop.snapshot()
    }

    fn spawn_voice_loop_worker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (running, session_id, mode, require_wake_word, poll_interval_sec) = {
                    let state = orchestrator.lock_state();
                    let voice_loop = &state.voice_loop;
                    (
                        voice_loop.running,
                        voice_loop.session_id.clone(),
                        voice_loop.mode,
                        voice_loop.require_wake_word,
                        voice_loop.poll_interval_sec.max(1),
                    )
                };
                if !running {
                    return;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = orchestrator.voice_loop_iteration(&session_id, mode, require_wake_word) => {
                        // One bad iteration must never kill the worker.
                        if let Err(e) = result {
                            orchestrator.record_voice_loop_error(&e.to_string());
                            orchestrator.publish(json!({
                                "type": "voice.loop.error",
                                "session_id": session_id,
                                "message": e.to_string(),
                            }));
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(poll_interval_sec)) => {}
                }
            }
        })
    }

    /// One pass of the loop body: capture or poll, transcribe, gate, process.
    pub(crate) async fn voice_loop_iteration(
        &self,
        session_id: &str,
        mode: AssistantMode,
        require_wake_word: bool,
    ) -> Result<()> {
        let capture = self.voice().capture_once().await;
        let mut transcript = capture.transcript.trim().to_owned();
        let mut backend = capture.backend;
        let mut warning = capture.warning;

        if let Some(audio_path) = capture.path {
            let stt = self.transcribe_audio(&audio_path).await;
            transcript = stt.text.trim().to_owned();
            if !stt.backend.is_empty() {
                backend = stt.backend;
            }
            merge_warning(&mut warning, &stt.warning);
        }

        if transcript.is_empty() {
            let seen: HashSet<String> = self.lock_state().voice_loop_seen_files.clone();
            if let Some(inbox_file) = self.voice().next_inbox_file(&seen) {
                self.lock_state()
                    .voice_loop_seen_files
                    .insert(canonical_key(&inbox_file));
                let stt = self.transcribe_audio(&inbox_file).await;
                transcript = stt.text.trim().to_owned();
                if !stt.backend.is_empty() {
                    backend = stt.backend;
                }
                merge_warning(&mut warning, &stt.warning);
            }
        }

        if !warning.is_empty() {
            self.record_voice_loop_error(&warning);
        }
        if transcript.is_empty() {
            return Ok(());
        }
        debug!(transcript = transcript.as_str(), "voice loop heard something");

        let mut command_text = transcript.clone();
        if require_wake_word {
            let (detected, remainder) = self.voice().parse_wake_command(&transcript);
            if !detected {
                self.record_voice_loop_skip(&transcript, &backend, "wake word not detected");
                self.publish(json!({
                    "type": "voice.loop.ignored",
                    "session_id": session_id,
                    "transcript": transcript,
                    "reason": "wake_word_not_detected",
                }));
                return Ok(());
            }
            if remainder.is_empty() {
                self.record_voice_loop_skip(
                    &transcript,
                    &backend,
                    "wake word detected without command",
                );
                self.publish(json!({
                    "type": "voice.loop.ignored",
                    "session_id": session_id,
                    "transcript": transcript,
                    "reason": "wake_word_without_command",
                }));
                return Ok(());
            }
            command_text = remainder;
        }

        let response = self
            .process_voice_text(&command_text, session_id, mode)
            .await?;
        self.record_voice_loop_processed(&transcript, &command_text, &response.reply, &backend);
        self.publish(json!({
            "type": "voice.loop.processed",
            "session_id": session_id,
            "mode": mode.as_str(),
            "transcript": transcript,
            "command": command_text,
            "reply": response.reply,
            "audio_path": response.audio_path,
            "interrupted": response.interrupted,
        }));
        Ok(())
    }

    fn list_current_inbox_files(&self) -> HashSet<String> {
        let Ok(entries) = std::fs::read_dir(self.voice().input_dir()) else {
            return HashSet::new();
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .map(|path| canonical_key(&path))
            .collect()
    }

    fn record_voice_loop_processed(
        &self,
        transcript: &str,
        command: &str,
        reply: &str,
        backend: &str,
    ) {
        let mut state = self.lock_state();
        let voice_loop = &mut state.voice_loop;
        voice_loop.processed_count += 1;
        voice_loop.last_transcript = transcript.to_owned();
        voice_loop.last_command = command.to_owned();
        voice_loop.last_reply = reply.to_owned();
        voice_loop.last_backend = backend.to_owned();
        voice_loop.last_error.clear();
        voice_loop.touch();
    }

    fn record_voice_loop_skip(&self, transcript: &str, backend: &str, reason: &str) {
        let mut state = self.lock_state();
        let voice_loop = &mut state.voice_loop;
        voice_loop.skipped_count += 1;
        voice_loop.last_transcript = transcript.to_owned();
        voice_loop.last_backend = backend.to_owned();
        voice_loop.last_error = reason.to_owned();
        voice_loop.touch();
    }

    fn record_voice_loop_error(&self, error: &str) {
        if error.is_empty() {
            return;
        }
        let mut state = self.lock_state();
        state.voice_loop.last_error = error.to_owned();
        state.voice_loop.touch();
    }
}

fn merge_warning(existing: &mut String, incoming: &str) {
    let incoming = incoming.trim();
    if incoming.is_empty() {
        return;
    }
    if existing.is_empty() {
        *existing = incoming.to_owned();
    } else {
        *existing = format!("{existing}; {incoming}");
    }
}
