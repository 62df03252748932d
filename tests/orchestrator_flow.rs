//! End-to-end orchestrator flows: planning, policy gating, approvals,
//! barge-in, and the background voice loop.

use serde_json::json;
use std::sync::{Arc, Mutex};
use wisp::config::AssistantConfig;
use wisp::dispatch::CloudReasoner;
use wisp::llm::TextGenerator;
use wisp::orchestrator::VoiceLoopOptions;
use wisp::types::{AssistantMode, JsonMap, RunStatus, StepStatus};
use wisp::{AssistantError, Orchestrator};

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
    async fn generate(&self, _prompt: &str) -> Result<String, AssistantError> {
        Ok(String::new())
    }
}

fn test_config(dir: &std::path::Path) -> AssistantConfig {
    let mut config = AssistantConfig::default();
    config.storage.db_path = dir.join("flow.db");
    config.voice.input_dir = dir.join("inbox");
    config.voice.output_dir = dir.join("out");
    config.voice.loop_poll_interval_sec = 1;
    // An allow-listed app whose launch command exists everywhere and exits
    // immediately.
    config
        .policy
        .allowed_apps
        .insert("noop".to_owned(), "true".to_owned());
    config
}

fn orchestrator_with_reply(dir: &std::path::Path, reply: &str) -> Arc<Orchestrator> {
    Orchestrator::with_backends(
        test_config(dir),
        Arc::new(ScriptedGenerator {
            reply: reply.to_owned(),
        }),
        Arc::new(NoCloud),
    )
    .unwrap()
}

#[tokio::test]
async fn unapproved_shell_plan_is_skipped_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with_reply(dir.path(), "unused");
    let sub = orchestrator.events().subscribe();

    let plan = orchestrator.create_plan("run command echo hello", AssistantMode::Action);
    let run = orchestrator.execute_plan(&plan.id, &[], "s1").await.unwrap();

    // The only step was approval-gated and no approval came: zero successes.
    assert_eq!(run.status, RunStatus::Failed);
    let statuses: Vec<StepStatus> = run.timeline.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![StepStatus::Skipped]);

    // Per-subscriber FIFO: run.started precedes the step events, which
    // precede run.finished.
    let events: Vec<String> = sub
        .drain()
        .into_iter()
        .filter_map(|e| e["type"].as_str().map(str::to_owned))
        .collect();
    let started = events.iter().position(|t| t == "run.started").unwrap();
    let skipped = events.iter().position(|t| t == "step.skipped").unwrap();
    let finished = events.iter().position(|t| t == "run.finished").unwrap();
    assert!(started < skipped && skipped < finished);
}

#[tokio::test]
async fn approving_the_shell_step_completes_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with_reply(dir.path(), "unused");

    let plan = orchestrator.create_plan("run command echo approved-run", AssistantMode::Action);
    let shell_step = plan
        .steps
        .iter()
        .find(|s| s.tool.as_deref() == Some("safe_shell"))
        .unwrap();
    assert!(shell_step.needs_approval);

    let run = orchestrator
        .execute_plan(&plan.id, &[shell_step.id.clone()], "s1")
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let success = run
        .timeline
        .iter()
        .find(|e| e.status == StepStatus::Success)
        .unwrap();
    assert!(success.data["stdout"].as_str().unwrap().contains("approved-run"));
}

#[tokio::test]
async fn plan_history_lands_in_storage_after_execution() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with_reply(dir.path(), "unused");

    let plan = orchestrator.create_plan("list reminders", AssistantMode::Action);
    orchestrator.execute_plan(&plan.id, &[], "s-hist").await.unwrap();

    let history = orchestrator.storage().list_recent_history("s-hist", 4).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].assistant_text.contains("finished with status"));
}

/// Generator that barges in on its own session the moment generation runs,
/// so the interrupt lands between generation and synthesis without timing.
struct IntrudingGenerator {
    target: Mutex<Option<Arc<Orchestrator>>>,
}

#[async_trait::async_trait]
impl TextGenerator for IntrudingGenerator {
    async fn generate(&self, _prompt: &str, _mode: AssistantMode) -> String {
        let target = self.target.lock().unwrap().clone();
        if let Some(orchestrator) = target {
            orchestrator.interrupt_voice_session("barge");
        }
        "a reply that should not be spoken".to_owned()
    }
}

#[tokio::test]
async fn barge_in_returns_reply_without_synthesis() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(IntrudingGenerator {
        target: Mutex::new(None),
    });
    let orchestrator = Orchestrator::with_backends(
        test_config(dir.path()),
        Arc::clone(&generator) as Arc<dyn TextGenerator>,
        Arc::new(NoCloud),
    )
    .unwrap();
    *generator.target.lock().unwrap() = Some(Arc::clone(&orchestrator));

    let outcome = orchestrator
        .process_voice_text("hello there", "barge", AssistantMode::Chat)
        .await
        .unwrap();
    assert!(outcome.interrupted);
    assert_eq!(outcome.reply, "a reply that should not be spoken");
    assert!(outcome.audio_path.is_empty(), "no synthesis after barge-in");
    assert_eq!(outcome.tts_backend, "none");
    assert!(
        outcome
            .warnings
            .iter()
            .any(|w| w.contains("interrupted before speech output"))
    );

    // The flag is cleared: the next command speaks normally.
    *generator.target.lock().unwrap() = None;
    let outcome = orchestrator
        .process_voice_text("hello again", "barge", AssistantMode::Chat)
        .await
        .unwrap();
    assert!(!outcome.interrupted);
    assert!(!outcome.audio_path.is_empty());
}

#[tokio::test]
async fn dispatch_saves_voice_history() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with_reply(
        dir.path(),
        r#"{"reply": "Opening it now.", "actions": [{"tool": "open_app", "args": {"app_name": "noop"}}]}"#,
    );

    let result = orchestrator
        .dispatch_transcribed_speech("open noop", "voice-1", &JsonMap::new())
        .await
        .unwrap();
    assert_eq!(result.backend, "local");
    assert_eq!(result.actions.len(), 1);
    assert_eq!(result.reply, "Opening it now.");
}

#[tokio::test]
async fn voice_loop_worker_processes_new_inbox_file() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with_reply(dir.path(), "loop reply");

    orchestrator
        .start_voice_loop(VoiceLoopOptions {
            require_wake_word: Some(false),
            poll_interval_sec: Some(1),
            ..Default::default()
        })
        .await;

    // Written after start, so it is not in the seen-file snapshot.
    std::fs::write(dir.path().join("inbox/say.txt"), "list reminders").unwrap();

    let mut processed = 0;
    for _ in 0..80 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        processed = orchestrator.voice_loop_state().processed_count;
        if processed > 0 {
            break;
        }
    }
    let snapshot = orchestrator.stop_voice_loop().await;
    assert_eq!(processed, 1, "worker should process the dropped file");
    assert_eq!(snapshot.last_transcript, "list reminders");
    assert!(!snapshot.running);
}

#[tokio::test]
async fn execute_tool_action_allows_and_records_low_risk_tool() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with_reply(dir.path(), "unused");
    let sub = orchestrator.events().subscribe();

    let mut args = JsonMap::new();
    args.insert("action".into(), json!("set"));
    args.insert("note".into(), json!("from the dashboard"));
    let result = orchestrator
        .execute_tool_action("dash", "admin", "reminder", args)
        .await
        .unwrap();
    assert!(result.success);

    let event = sub
        .drain()
        .into_iter()
        .find(|e| e["type"] == "action.executed")
        .unwrap();
    assert_eq!(event["tool"], "reminder");
    assert_eq!(event["success"], true);

    let reminders = orchestrator.storage().list_reminders(false).unwrap();
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].note, "from the dashboard");
}
