//! Media playback control stub.
//!
//! Validates and acknowledges playback commands without a real player
//! backend; the accepted action is echoed back in the result data so
//! front-ends can wire their own player to it.

use crate::tools::{Tool, ToolContext, arg_str};
use crate::types::{JsonMap, ToolExecutionResult};
use serde_json::json;

const SUPPORTED_ACTIONS: &[&str] = &["play", "pause", "resume", "stop", "next", "previous"];

/// Lightweight media playback commands.
pub struct MediaControlTool;

#[async_trait::async_trait]
impl Tool for MediaControlTool {
    fn name(&self) -> &str {
        "media_control"
    }

    fn description(&self) -> &str {
        "Control local media playback with lightweight commands."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": SUPPORTED_ACTIONS},
                "target": {"type": "string"},
            },
            "required": ["action"],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, args: &JsonMap, _context: &ToolContext) -> ToolExecutionResult {
        let action = arg_str(args, "action").trim().to_lowercase();
        let target = arg_str(args, "target").trim().to_owned();

        if !SUPPORTED_ACTIONS.contains(&action.as_str()) {
            return ToolExecutionResult::fail(format!("Unsupported action '{action}'."));
        }

        let mut data = JsonMap::new();
        data.insert("action".into(), json!(action));
        data.insert(
            "target".into(),
            json!(if target.is_empty() { "default" } else { &target }),
        );
        ToolExecutionResult::ok_with(format!("Media action accepted: {action}."), data)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::AssistantConfig;
    use crate::storage::Storage;
    use crate::types::AssistantMode;
    use std::sync::Arc;

    struct SilentGenerator;

    #[async_trait::async_trait]
    impl crate::llm::TextGenerator for SilentGenerator {
        async fn generate(&self, _prompt: &str, _mode: AssistantMode) -> String {
            String::new()
        }
    }

    fn context(dir: &std::path::Path) -> ToolContext {
        ToolContext {
            config: Arc::new(AssistantConfig::default()),
            storage: Arc::new(Storage::open(&dir.join("t.db")).unwrap()),
            llm: Arc::new(SilentGenerator),
        }
    }

    #[tokio::test]
    async fn play_with_target_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = JsonMap::new();
        args.insert("action".into(), json!("play"));
        args.insert("target".into(), json!("jazz playlist"));

        let result = MediaControlTool.execute(&args, &context(dir.path())).await;
        assert!(result.success);
        assert_eq!(result.data["target"], "jazz playlist");
    }

    #[tokio::test]
    async fn missing_target_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = JsonMap::new();
        args.insert("action".into(), json!("pause"));

        let result = MediaControlTool.execute(&args, &context(dir.path())).await;
        assert!(result.success);
        assert_eq!(result.data["target"], "default");
    }

    #[tokio::test]
    async fn unsupported_action_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = JsonMap::new();
        args.insert("action".into(), json!("rewind"));

        let result = MediaControlTool.execute(&args, &context(dir.path())).await;
        assert!(!result.success);
    }
}
