//! The orchestrator: owns plans, runs, voice sessions, and background
//! workers, and composes every other component.
//!
//! All shared mutable state lives behind one coarse mutex with short critical
//! sections. No critical section performs I/O or model calls — tool
//! execution, generation, and storage writes happen outside the lock, with
//! results written back under a fresh acquisition. That keeps slow model
//! calls from stalling unrelated operations (event publication, voice
//! session bookkeeping).

mod voice_loop;

pub use voice_loop::VoiceLoopOptions;

use crate::config::AssistantConfig;
use crate::dispatch::{CloudReasoner, DispatchResult, HybridDispatcher, OpenAiCompatReasoner};
use crate::error::{AssistantError, Result};
use crate::events::EventBus;
use crate::llm::{LocalLlmClient, TextGenerator, offline_fallback};
use crate::planner::Planner;
use crate::policy::PolicyEngine;
use crate::storage::Storage;
use crate::tools::{ToolDescriptor, ToolRegistry, build_default_registry};
use crate::types::{
    ActionRun, AssistantMode, ChatOutcome, JsonMap, Plan, PlanStatus, PlanStep, RunStatus,
    RunStepEvent, StepStatus, ToolExecutionResult, VoiceCommandOutcome, utc_now_iso,
};
use crate::voice::VoicePipeline;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use voice_loop::VoiceLoopState;

/// Number of history exchanges folded into a chat prompt.
const CHAT_HISTORY_TURNS: usize = 4;

/// Per-session conversational voice state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSessionState {
    pub session_id: String,
    pub mode: AssistantMode,
    pub interrupted: bool,
    pub last_partial: String,
    pub updated_at: String,
}

impl VoiceSessionState {
    fn new(session_id: &str, mode: AssistantMode) -> Self {
        Self {
            session_id: session_id.to_owned(),
            mode,
            interrupted: false,
            last_partial: String::new(),
            updated_at: utc_now_iso(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = utc_now_iso();
    }
}

struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything guarded by the orchestrator-wide lock.
pub(crate) struct SharedState {
    plans: HashMap<String, Plan>,
    runs: HashMap<String, ActionRun>,
    voice_sessions: HashMap<String, VoiceSessionState>,
    pub(crate) voice_loop: VoiceLoopState,
    pub(crate) voice_loop_seen_files: HashSet<String>,
    workers_running: bool,
    reminder_worker: Option<WorkerHandle>,
    voice_loop_worker: Option<WorkerHandle>,
}

/// The assistant core. Construct once per process, share via `Arc`.
pub struct Orchestrator {
    config: Arc<AssistantConfig>,
    storage: Arc<Storage>,
    events: EventBus,
    llm: Arc<dyn TextGenerator>,
    policy: PolicyEngine,
    planner: Planner,
    registry: ToolRegistry,
    voice: VoicePipeline,
    dispatcher: HybridDispatcher,
    pub(crate) state: Mutex<SharedState>,
}

impl Orchestrator {
    /// Build the orchestrator with the default HTTP model backends.
    pub fn new(config: AssistantConfig) -> Result<Arc<Self>> {
        let llm: Arc<dyn TextGenerator> =
            Arc::new(LocalLlmClient::new(Arc::new(config.llm.clone())));
        let cloud: Arc<dyn CloudReasoner> =
            Arc::new(OpenAiCompatReasoner::new(Arc::new(config.cloud.clone())));
        Self::with_backends(config, llm, cloud)
    }

    /// Build the orchestrator with injected model backends.
    pub fn with_backends(
        config: AssistantConfig,
        llm: Arc<dyn TextGenerator>,
        cloud: Arc<dyn CloudReasoner>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let storage = Arc::new(Storage::open(&config.storage.db_path)?);
        let events = EventBus::new(config.events.queue_capacity);
        let policy_config = Arc::new(config.policy.clone());
        let policy = PolicyEngine::new(Arc::clone(&policy_config));
        let planner = Planner::new(
            Arc::new(config.planner.clone()),
            policy_config,
            policy.clone(),
        );
        let registry =
            build_default_registry(Arc::clone(&config), Arc::clone(&storage), Arc::clone(&llm));
        let voice = VoicePipeline::new(Arc::new(config.voice.clone()))?;
        let dispatcher =
            HybridDispatcher::new(Arc::clone(&llm), cloud, Arc::new(config.cloud.clone()));
        let voice_loop = VoiceLoopState::from_config(&config.voice);

        Ok(Arc::new(Self {
            config,
            storage,
            events,
            llm,
            policy,
            planner,
            registry,
            voice,
            dispatcher,
            state: Mutex::new(SharedState {
                plans: HashMap::new(),
                runs: HashMap::new(),
                voice_sessions: HashMap::new(),
                voice_loop,
                voice_loop_seen_files: HashSet::new(),
                workers_running: false,
                reminder_worker: None,
                voice_loop_worker: None,
            }),
        }))
    }

    /// Event bus handle; subscribe here for live progress.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shared persistent store.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Active configuration.
    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /// Name/description/schema triples for every registered tool.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.list()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SharedState> {
        // A poisoned lock means a panic elsewhere; the state itself is plain
        // data, so continuing with it is safe.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish an event, stamping the timestamp.
    pub(crate) fn publish(&self, mut event: serde_json::Value) {
        if let Some(object) = event.as_object_mut() {
            object.insert("timestamp".into(), json!(utc_now_iso()));
        }
        self.events.publish(event);
    }

    // ── Background workers ───────────────────────────────────────────────

    /// Start the reminder poller (and the voice loop when configured to
    /// auto-start). Calling again while running is a no-op.
    pub async fn start_background_workers(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.workers_running {
                return;
            }
            state.workers_running = true;
            let cancel = CancellationToken::new();
            let handle = self.spawn_reminder_worker(cancel.clone());
            state.reminder_worker = Some(WorkerHandle { cancel, handle });
        }
        info!("background workers started");
        if self.config.voice.loop_auto_start {
            self.start_voice_loop(VoiceLoopOptions::default()).await;
        }
    }

    /// Stop all background workers and await their cancellation. Idempotent.
    pub async fn stop_background_workers(self: &Arc<Self>) {
        self.stop_voice_loop().await;
        let worker = {
            let mut state = self.lock_state();
            state.workers_running = false;
            state.reminder_worker.take()
        };
        if let Some(worker) = worker {
            worker.cancel.cancel();
            let _ = worker.handle.await;
            info!("background workers stopped");
        }
    }

    fn spawn_reminder_worker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let interval = std::time::Duration::from_secs(
            self.config.reminders.effective_poll_interval_sec(),
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                orchestrator.deliver_due_reminders();
            }
        })
    }

    /// One reminder poll: mark each newly-due reminder notified, then
    /// publish its event. Marking first keeps delivery at exactly once.
    fn deliver_due_reminders(&self) {
        let now = utc_now_iso();
        let due = match self.storage.list_due_unnotified(&now) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "reminder poll failed");
                return;
            }
        };
        for reminder in due {
            if let Err(e) = self.storage.mark_reminder_notified(reminder.id) {
                warn!(error = %e, id = reminder.id, "could not mark reminder notified");
                continue;
            }
            self.publish(json!({
                "type": "reminder.due",
                "reminder": serde_json::to_value(&reminder).unwrap_or_default(),
            }));
        }
    }

    // ── Chat and planning ────────────────────────────────────────────────

    /// Main text entry point. Chat mode answers directly with recent-history
    /// context; Action and Code modes plan first, and Action plans execute
    /// immediately when nothing needs approval and auto-execute is enabled.
    pub async fn chat(
        &self,
        session_id: &str,
        text: &str,
        mode: AssistantMode,
    ) -> Result<ChatOutcome> {
        if mode == AssistantMode::Chat {
            let prompt = self.chat_prompt_with_history(session_id, text)?;
            let mut reply = self.llm.generate(&prompt, AssistantMode::Chat).await;
            if reply.is_empty() {
                reply = offline_fallback(text, AssistantMode::Chat);
            }
            self.storage
                .save_history(session_id, text, &reply, mode.as_str())?;
            return Ok(ChatOutcome {
                reply,
                plan: None,
                run_id: None,
            });
        }

        let plan = self.create_plan(text, mode);

        if mode == AssistantMode::Code {
            let reply = "Code plan created. Approve the step to run code generation.".to_owned();
            self.storage
                .save_history(session_id, text, &reply, mode.as_str())?;
            return Ok(ChatOutcome {
                reply,
                plan: Some(plan),
                run_id: None,
            });
        }

        let risky_steps: Vec<String> = plan
            .steps
            .iter()
            .filter(|step| step.needs_approval)
            .map(|step| step.id.clone())
            .collect();

        if risky_steps.is_empty() && self.config.policy.auto_execute_low_risk {
            let run = self.execute_plan(&plan.id, &[], session_id).await?;
            let reply = summarize_run(&run);
            return Ok(ChatOutcome {
                reply,
                plan: Some(plan),
                run_id: Some(run.id),
            });
        }

        let reply = format!(
            "Plan created with {} step(s). Approval required for steps: {}.",
            plan.steps.len(),
            if risky_steps.is_empty() {
                "none".to_owned()
            } else {
                risky_steps.join(", ")
            }
        );
        self.storage
            .save_history(session_id, text, &reply, mode.as_str())?;
        Ok(ChatOutcome {
            reply,
            plan: Some(plan),
            run_id: None,
        })
    }

    /// Create and register a plan for a goal, publishing `plan.created`.
    pub fn create_plan(&self, goal: &str, mode: AssistantMode) -> Plan {
        let plan = self.planner.create_plan(goal, mode);
        {
            let mut state = self.lock_state();
            state.plans.insert(plan.id.clone(), plan.clone());
        }
        self.publish(json!({
            "type": "plan.created",
            "plan_id": plan.id,
            "mode": plan.mode.as_str(),
            "steps": serde_json::to_value(&plan.steps).unwrap_or_default(),
        }));
        plan
    }

    /// Look up a plan by id.
    pub fn get_plan(&self, plan_id: &str) -> Option<Plan> {
        self.lock_state().plans.get(plan_id).cloned()
    }

    /// Look up a run by id.
    pub fn get_run(&self, run_id: &str) -> Option<ActionRun> {
        self.lock_state().runs.get(run_id).cloned()
    }

    /// Execute a registered plan. Steps blocked by policy become Blocked
    /// timeline entries; approval-gated steps missing from `approved_steps`
    /// become Skipped; the rest run in plan order.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] for an unknown plan id — the one
    /// hard lookup error in the core.
    pub async fn execute_plan(
        &self,
        plan_id: &str,
        approved_steps: &[String],
        session_id: &str,
    ) -> Result<ActionRun> {
        let plan = self
            .get_plan(plan_id)
            .ok_or_else(|| AssistantError::NotFound(format!("Plan not found: {plan_id}")))?;

        let mut run = ActionRun {
            id: format!("run_{}", short_id()),
            plan_id: plan.id.clone(),
            status: RunStatus::Running,
            started_at: utc_now_iso(),
            finished_at: None,
            timeline: Vec::new(),
        };
        {
            let mut state = self.lock_state();
            state.runs.insert(run.id.clone(), run.clone());
            if let Some(stored) = state.plans.get_mut(&plan.id) {
                stored.status = PlanStatus::Running;
            }
        }
        self.publish(json!({
            "type": "run.started",
            "run_id": run.id,
            "plan_id": plan.id,
        }));

        let mut failures = 0u32;
        let mut successes = 0u32;

        for step in &plan.steps {
            let decision = self.policy.evaluate(step);
            if !decision.allowed {
                failures += 1;
                self.append_timeline(
                    &mut run,
                    &step.id,
                    StepStatus::Blocked,
                    &decision.reason,
                    JsonMap::new(),
                );
                self.publish(json!({
                    "type": "step.blocked",
                    "run_id": run.id,
                    "step_id": step.id,
                    "reason": decision.reason,
                }));
                continue;
            }

            if step.needs_approval && !approved_steps.contains(&step.id) {
                // An unapproved step keeps the run from counting as complete.
                failures += 1;
                self.append_timeline(
                    &mut run,
                    &step.id,
                    StepStatus::Skipped,
                    "Skipped because approval is missing.",
                    JsonMap::new(),
                );
                self.publish(json!({
                    "type": "step.skipped",
                    "run_id": run.id,
                    "step_id": step.id,
                }));
                continue;
            }

            self.publish(json!({
                "type": "step.running",
                "run_id": run.id,
                "step_id": step.id,
            }));
            self.append_timeline(
                &mut run,
                &step.id,
                StepStatus::Running,
                &step.description,
                JsonMap::new(),
            );

            let result = self.run_step(&plan, step).await;
            if result.success {
                successes += 1;
                self.append_timeline(
                    &mut run,
                    &step.id,
                    StepStatus::Success,
                    &result.message,
                    result.data,
                );
                self.publish(json!({
                    "type": "step.success",
                    "run_id": run.id,
                    "step_id": step.id,
                }));
            } else {
                failures += 1;
                self.append_timeline(
                    &mut run,
                    &step.id,
                    StepStatus::Failed,
                    &result.message,
                    result.data,
                );
                self.publish(json!({
                    "type": "step.failed",
                    "run_id": run.id,
                    "step_id": step.id,
                    "error": result.message,
                }));
            }
        }

        run.status = match (failures, successes) {
            (0, s) if s > 0 => RunStatus::Completed,
            (f, s) if f > 0 && s > 0 => RunStatus::PartialSuccess,
            _ => RunStatus::Failed,
        };
        run.finished_at = Some(utc_now_iso());

        {
            let mut state = self.lock_state();
            state.runs.insert(run.id.clone(), run.clone());
            if let Some(stored) = state.plans.get_mut(&plan.id) {
                stored.status = if run.status == RunStatus::Failed {
                    PlanStatus::Failed
                } else {
                    PlanStatus::Completed
                };
            }
        }

        let summary = summarize_run(&run);
        self.storage
            .save_history(session_id, &plan.goal, &summary, plan.mode.as_str())?;
        self.publish(json!({
            "type": "run.finished",
            "run_id": run.id,
            "status": run.status.as_str(),
        }));
        Ok(run)
    }

    /// Run one approved step: direct model answer or a tool invocation.
    async fn run_step(&self, plan: &Plan, step: &PlanStep) -> ToolExecutionResult {
        match step.tool.as_deref() {
            None => {
                let mut answer = self.llm.generate(&plan.goal, plan.mode).await;
                if answer.is_empty() {
                    answer = offline_fallback(&plan.goal, plan.mode);
                }
                let mut data = JsonMap::new();
                data.insert("response".into(), json!(answer));
                ToolExecutionResult::ok_with("Direct response generated.", data)
            }
            Some(tool) => self.registry.execute(tool, &step.args).await,
        }
    }

    fn append_timeline(
        &self,
        run: &mut ActionRun,
        step_id: &str,
        status: StepStatus,
        message: &str,
        data: JsonMap,
    ) {
        run.timeline.push(RunStepEvent {
            timestamp: utc_now_iso(),
            step_id: step_id.to_owned(),
            status,
            message: message.to_owned(),
            data,
        });
        let mut state = self.lock_state();
        if let Some(stored) = state.runs.get_mut(&run.id) {
            stored.timeline = run.timeline.clone();
        }
    }

    fn chat_prompt_with_history(&self, session_id: &str, user_text: &str) -> Result<String> {
        let recent = self
            .storage
            .list_recent_history(session_id, CHAT_HISTORY_TURNS)?;
        if recent.is_empty() {
            return Ok(user_text.to_owned());
        }
        let mut lines = vec!["Recent conversation context (oldest -> newest):".to_owned()];
        for item in recent.iter().rev() {
            lines.push(format!("User: {}", item.user_text));
            lines.push(format!("Assistant: {}", item.assistant_text));
        }
        lines.push(format!("User: {user_text}"));
        Ok(lines.join("\n"))
    }

    // ── Ad-hoc tool execution ────────────────────────────────────────────

    /// Policy-check and execute one tool directly (dashboard-style), writing
    /// the attempt to action history either way.
    pub async fn execute_tool_action(
        &self,
        session_id: &str,
        actor: &str,
        tool: &str,
        args: JsonMap,
    ) -> Result<ToolExecutionResult> {
        let planned = PlanStep::with_tool(
            format!("adhoc_{}", short_id()),
            format!("Direct tool action: {tool}"),
            tool,
            args.clone(),
        );
        let decision = self.policy.evaluate(&planned);
        if !decision.allowed {
            let mut data = JsonMap::new();
            data.insert("risk".into(), json!(decision.risk.as_str()));
            data.insert("needs_approval".into(), json!(decision.needs_approval));
            let result = ToolExecutionResult::fail_with(decision.reason, data);
            self.storage.save_action_history(
                session_id,
                actor,
                tool,
                &args,
                result.success,
                &result.message,
                &result.data,
            )?;
            return Ok(result);
        }

        let result = self.registry.execute(tool, &args).await;
        self.storage.save_action_history(
            session_id,
            actor,
            tool,
            &args,
            result.success,
            &result.message,
            &result.data,
        )?;
        self.publish(json!({
            "type": "action.executed",
            "session_id": session_id,
            "actor": actor,
            "tool": tool,
            "success": result.success,
            "message": result.message,
        }));
        Ok(result)
    }

    // ── Voice dispatch and processing ────────────────────────────────────

    /// Fast-path dispatch of a transcript through the hybrid dispatcher,
    /// bypassing the planner and policy scoring.
    pub async fn dispatch_transcribed_speech(
        &self,
        transcript: &str,
        session_id: &str,
        context: &JsonMap,
    ) -> Result<DispatchResult> {
        let result = self.dispatcher.dispatch(transcript, session_id, context).await;
        let mut meta = JsonMap::new();
        meta.insert("intent".into(), json!(result.intent.as_str()));
        meta.insert("used_cloud_fallback".into(), json!(result.used_cloud_fallback));
        meta.insert("local_attempts".into(), json!(result.local_attempts));
        meta.insert("cloud_attempts".into(), json!(result.cloud_attempts));
        self.storage.save_voice_history(
            session_id,
            &result.transcript,
            &result.reply,
            result.mode.as_str(),
            &result.backend,
            "transcribed-input",
            "none",
            &meta,
        )?;
        Ok(result)
    }

    /// Transcribe an audio file via the voice collaborator.
    pub async fn transcribe_audio(&self, audio_path: &Path) -> crate::voice::TranscriptionResult {
        self.voice.transcribe(audio_path).await
    }

    /// Synthesize speech via the voice collaborator.
    pub async fn synthesize_text(&self, text: &str) -> crate::voice::SynthesisResult {
        self.voice.synthesize(text).await
    }

    pub(crate) fn voice(&self) -> &VoicePipeline {
        &self.voice
    }

    /// Transcribe an audio file, then process the transcript as a voice
    /// command. STT warnings and backend carry into the outcome.
    pub async fn process_voice_command(
        &self,
        audio_path: &Path,
        session_id: &str,
        mode: AssistantMode,
    ) -> Result<VoiceCommandOutcome> {
        let stt = self.transcribe_audio(audio_path).await;
        let mut warnings = Vec::new();
        if !stt.warning.is_empty() {
            warnings.push(stt.warning.clone());
        }

        let transcript = stt.text.trim();
        if transcript.is_empty() {
            if warnings.is_empty() {
                warnings.push("transcription failed".to_owned());
            }
            return Ok(VoiceCommandOutcome {
                transcript: String::new(),
                reply: "Could not transcribe audio.".to_owned(),
                plan: None,
                run_id: None,
                audio_path: String::new(),
                stt_backend: stt.backend,
                tts_backend: "none".to_owned(),
                interrupted: false,
                warnings,
            });
        }

        let mut outcome = self.process_voice_text(transcript, session_id, mode).await?;
        outcome.stt_backend = stt.backend;
        let mut merged = warnings;
        merged.extend(outcome.warnings);
        outcome.warnings = merged;
        Ok(outcome)
    }

    /// Process one voice command already in text form.
    ///
    /// Barge-in contract: the interrupt flag is checked after the reply is
    /// generated but before synthesis. An interrupted session gets its reply
    /// back with no audio and `interrupted = true`, and the flag is cleared.
    pub async fn process_voice_text(
        &self,
        transcript: &str,
        session_id: &str,
        mode: AssistantMode,
    ) -> Result<VoiceCommandOutcome> {
        let text = transcript.trim().to_owned();
        if text.is_empty() {
            return Ok(VoiceCommandOutcome {
                transcript: String::new(),
                reply: "No transcript text provided.".to_owned(),
                plan: None,
                run_id: None,
                audio_path: String::new(),
                stt_backend: String::new(),
                tts_backend: String::new(),
                interrupted: false,
                warnings: vec!["empty transcript".to_owned()],
            });
        }

        {
            let mut state = self.lock_state();
            let session = state
                .voice_sessions
                .entry(session_id.to_owned())
                .or_insert_with(|| VoiceSessionState::new(session_id, mode));
            session.mode = mode;
            session.interrupted = false;
            session.last_partial.clear();
            session.touch();
        }

        let response = self.chat(session_id, &text, mode).await?;

        if self.is_voice_interrupted(session_id) {
            self.clear_voice_interrupt(session_id);
            return Ok(VoiceCommandOutcome {
                transcript: text,
                reply: response.reply,
                plan: response.plan,
                run_id: response.run_id,
                audio_path: String::new(),
                stt_backend: String::new(),
                tts_backend: "none".to_owned(),
                interrupted: true,
                warnings: vec!["interrupted before speech output".to_owned()],
            });
        }

        let tts = self.voice.synthesize(&response.reply).await;
        let mut warnings = Vec::new();
        if !tts.warning.is_empty() {
            warnings.push(tts.warning.clone());
        }

        let outcome = VoiceCommandOutcome {
            transcript: text.clone(),
            reply: response.reply,
            plan: response.plan,
            run_id: response.run_id,
            audio_path: tts.audio_path,
            stt_backend: String::new(),
            tts_backend: tts.backend,
            interrupted: false,
            warnings,
        };
        let mut meta = JsonMap::new();
        meta.insert(
            "run_id".into(),
            json!(outcome.run_id.clone().unwrap_or_default()),
        );
        meta.insert(
            "plan_id".into(),
            json!(outcome.plan.as_ref().map(|p| p.id.clone()).unwrap_or_default()),
        );
        self.storage.save_voice_history(
            session_id,
            &text,
            &outcome.reply,
            mode.as_str(),
            "orchestrator",
            "text",
            &outcome.tts_backend,
            &meta,
        )?;
        Ok(outcome)
    }

    // ── Voice session state machine ──────────────────────────────────────

    /// Create-or-touch a voice session.
    pub fn register_voice_session(
        &self,
        session_id: &str,
        mode: AssistantMode,
    ) -> VoiceSessionState {
        let mut state = self.lock_state();
        let session = state
            .voice_sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| VoiceSessionState::new(session_id, mode));
        session.mode = mode;
        session.touch();
        session.clone()
    }

    /// Remove a voice session. Unknown ids are a no-op.
    pub fn close_voice_session(&self, session_id: &str) {
        self.lock_state().voice_sessions.remove(session_id);
    }

    /// Update the streaming partial transcript for a session.
    pub fn set_voice_partial(&self, session_id: &str, text: &str) -> VoiceSessionState {
        let mut state = self.lock_state();
        let session = state
            .voice_sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| VoiceSessionState::new(session_id, AssistantMode::Action));
        session.last_partial = text.to_owned();
        session.touch();
        session.clone()
    }

    /// Mark a session interrupted (barge-in) and publish `voice.interrupted`.
    /// The in-flight command for this session will skip speech synthesis.
    pub fn interrupt_voice_session(&self, session_id: &str) -> VoiceSessionState {
        let snapshot = {
            let mut state = self.lock_state();
            let session = state
                .voice_sessions
                .entry(session_id.to_owned())
                .or_insert_with(|| VoiceSessionState::new(session_id, AssistantMode::Action));
            session.interrupted = true;
            session.touch();
            session.clone()
        };
        self.publish(json!({
            "type": "voice.interrupted",
            "session_id": session_id,
        }));
        snapshot
    }

    /// Clear a session's interrupt flag.
    pub fn clear_voice_interrupt(&self, session_id: &str) {
        let mut state = self.lock_state();
        if let Some(session) = state.voice_sessions.get_mut(session_id) {
            session.interrupted = false;
            session.touch();
        }
    }

    /// Whether a session is currently flagged interrupted.
    pub fn is_voice_interrupted(&self, session_id: &str) -> bool {
        self.lock_state()
            .voice_sessions
            .get(session_id)
            .is_some_and(|session| session.interrupted)
    }
}

pub(crate) fn short_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..10].to_owned()
}

/// Human-readable one-line summary of a finished run.
fn summarize_run(run: &ActionRun) -> String {
    let success_count = run
        .timeline
        .iter()
        .filter(|event| event.status == StepStatus::Success)
        .count();
    let failure_count = run
        .timeline
        .iter()
        .filter(|event| matches!(event.status, StepStatus::Failed | StepStatus::Blocked))
        .count();
    format!(
        "Run {} finished with status '{}'. Successful steps: {}, failed/blocked: {}.",
        run.id,
        run.status.as_str(),
        success_count,
        failure_count
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::types::StepStatus;

    struct ScriptedGenerator {
        reply: String,
    }

    #[async_trait::async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str, _mode: AssistantMode) -> String {
            self.reply.clone()
        }
    }

    struct NoCloud;

    #[async_trait::async_trait]
    impl CloudReasoner for NoCloud {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn test_orchestrator(dir: &Path, reply: &str) -> Arc<Orchestrator> {
        let mut config = AssistantConfig::default();
        config.storage.db_path = dir.join("orch.db");
        config.voice.input_dir = dir.join("inbox");
        config.voice.output_dir = dir.join("out");
        Orchestrator::with_backends(
            config,
            Arc::new(ScriptedGenerator {
                reply: reply.to_owned(),
            }),
            Arc::new(NoCloud),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn chat_mode_answers_directly_and_saves_history() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "hello back");

        let outcome = orchestrator
            .chat("s1", "hello there", AssistantMode::Chat)
            .await
            .unwrap();
        assert_eq!(outcome.reply, "hello back");
        assert!(outcome.plan.is_none());

        let history = orchestrator.storage().list_recent_history("s1", 4).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].assistant_text, "hello back");
    }

    #[tokio::test]
    async fn chat_mode_empty_model_reply_uses_offline_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "");
        let outcome = orchestrator
            .chat("s1", "hello", AssistantMode::Chat)
            .await
            .unwrap();
        assert!(outcome.reply.contains("Offline fallback response"));
    }

    #[tokio::test]
    async fn action_mode_auto_executes_low_risk_plan() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "done");

        let outcome = orchestrator
            .chat("s1", "list reminders", AssistantMode::Action)
            .await
            .unwrap();
        let run_id = outcome.run_id.expect("auto-executed run");
        let run = orchestrator.get_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(outcome.reply.contains("completed"));
    }

    #[tokio::test]
    async fn action_mode_with_risky_step_waits_for_approval() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "done");

        let outcome = orchestrator
            .chat("s1", "run command echo hi", AssistantMode::Action)
            .await
            .unwrap();
        assert!(outcome.run_id.is_none());
        assert!(outcome.reply.contains("Approval required"));
    }

    #[tokio::test]
    async fn execute_plan_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "x");
        let err = orchestrator
            .execute_plan("plan_missing", &[], "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::NotFound(_)));
    }

    #[tokio::test]
    async fn direct_step_records_response_in_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "the answer");

        let plan = orchestrator.create_plan("what is the answer", AssistantMode::Action);
        let run = orchestrator.execute_plan(&plan.id, &[], "s1").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let success = run
            .timeline
            .iter()
            .find(|e| e.status == StepStatus::Success)
            .unwrap();
        assert_eq!(success.data["response"], "the answer");
    }

    #[tokio::test]
    async fn blocked_step_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "x");

        let plan = orchestrator.create_plan("open winamp", AssistantMode::Action);
        let run = orchestrator.execute_plan(&plan.id, &[], "s1").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.timeline.len(), 1);
        assert_eq!(run.timeline[0].status, StepStatus::Blocked);

        let stored_plan = orchestrator.get_plan(&plan.id).unwrap();
        assert_eq!(stored_plan.status, PlanStatus::Failed);
    }

    #[tokio::test]
    async fn success_plus_skipped_step_is_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AssistantConfig::default();
        config.storage.db_path = dir.path().join("orch.db");
        config.voice.input_dir = dir.path().join("inbox");
        config.voice.output_dir = dir.path().join("out");
        config
            .policy
            .allowed_apps
            .insert("noop".to_owned(), "true".to_owned());
        let orchestrator = Orchestrator::with_backends(
            config,
            Arc::new(ScriptedGenerator { reply: "x".into() }),
            Arc::new(NoCloud),
        )
        .unwrap();

        // One allow-listed app launch plus one allow-listed shell command
        // that was never approved.
        let mut open_args = JsonMap::new();
        open_args.insert("app_name".into(), json!("noop"));
        let open_step = PlanStep::with_tool("step_1", "Open noop", "open_app", open_args);

        let mut shell_args = JsonMap::new();
        shell_args.insert("command".into(), json!("echo hi"));
        let mut shell_step =
            PlanStep::with_tool("step_2", "Run a safe shell command", "safe_shell", shell_args);
        shell_step.needs_approval = true;

        let plan = Plan {
            id: "plan_partial".to_owned(),
            goal: "open noop then echo".to_owned(),
            mode: AssistantMode::Action,
            status: PlanStatus::Draft,
            created_at: utc_now_iso(),
            steps: vec![open_step, shell_step],
        };
        orchestrator
            .lock_state()
            .plans
            .insert(plan.id.clone(), plan);

        let run = orchestrator
            .execute_plan("plan_partial", &[], "s1")
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::PartialSuccess);
        let statuses: Vec<StepStatus> = run.timeline.iter().map(|e| e.status).collect();
        assert!(statuses.contains(&StepStatus::Success));
        assert!(statuses.contains(&StepStatus::Skipped));
    }

    #[tokio::test]
    async fn execute_tool_action_blocked_by_policy_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "x");

        let mut args = JsonMap::new();
        args.insert("command".into(), json!("curl http://example.com"));
        let result = orchestrator
            .execute_tool_action("dash", "admin", "safe_shell", args)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("not allowlisted"));
    }

    #[tokio::test]
    async fn voice_session_register_interrupt_clear() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "x");

        let session = orchestrator.register_voice_session("v1", AssistantMode::Action);
        assert!(!session.interrupted);

        let sub = orchestrator.events().subscribe();
        let session = orchestrator.interrupt_voice_session("v1");
        assert!(session.interrupted);
        assert!(orchestrator.is_voice_interrupted("v1"));
        let event = sub.try_recv().unwrap();
        assert_eq!(event["type"], "voice.interrupted");

        orchestrator.clear_voice_interrupt("v1");
        assert!(!orchestrator.is_voice_interrupted("v1"));

        orchestrator.close_voice_session("v1");
        assert!(!orchestrator.is_voice_interrupted("v1"));
    }

    #[tokio::test]
    async fn set_voice_partial_updates_session() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "x");
        let session = orchestrator.set_voice_partial("v1", "open note");
        assert_eq!(session.last_partial, "open note");
    }

    #[tokio::test]
    async fn process_voice_text_synthesizes_when_not_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "spoken reply");

        let outcome = orchestrator
            .process_voice_text("hello there", "v1", AssistantMode::Chat)
            .await
            .unwrap();
        assert!(!outcome.interrupted);
        assert_eq!(outcome.tts_backend, "text-fallback");
        assert!(!outcome.audio_path.is_empty());
    }

    #[tokio::test]
    async fn empty_voice_text_warns() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "x");
        let outcome = orchestrator
            .process_voice_text("   ", "v1", AssistantMode::Chat)
            .await
            .unwrap();
        assert!(outcome.warnings.iter().any(|w| w == "empty transcript"));
    }

    #[tokio::test]
    async fn process_voice_command_reads_txt_inbox_file() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "ok");
        let audio = dir.path().join("inbox/cmd.txt");
        std::fs::write(&audio, "list reminders").unwrap();

        let outcome = orchestrator
            .process_voice_command(&audio, "v1", AssistantMode::Action)
            .await
            .unwrap();
        assert_eq!(outcome.transcript, "list reminders");
        assert_eq!(outcome.stt_backend, "txt-fallback");
        assert!(outcome.run_id.is_some());
    }

    #[tokio::test]
    async fn reminder_worker_delivers_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "x");
        orchestrator
            .storage()
            .add_reminder("past due", "2020-01-01T00:00:00+00:00")
            .unwrap();

        let sub = orchestrator.events().subscribe();
        orchestrator.deliver_due_reminders();
        let event = sub.try_recv().unwrap();
        assert_eq!(event["type"], "reminder.due");
        assert_eq!(event["reminder"]["note"], "past due");

        // Second poll finds nothing: the reminder was marked notified.
        orchestrator.deliver_due_reminders();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn background_workers_start_stop_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path(), "x");

        orchestrator.start_background_workers().await;
        orchestrator.start_background_workers().await;
        assert!(orchestrator.lock_state().reminder_worker.is_some());

        orchestrator.stop_background_workers().await;
        orchestrator.stop_background_workers().await;
        assert!(orchestrator.lock_state().reminder_worker.is_none());
    }
}
