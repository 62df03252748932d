//! Desktop application launcher, allow-list gated.

use crate::tools::{Tool, ToolContext, arg_str};
use crate::types::{JsonMap, ToolExecutionResult};
use serde_json::json;
use tracing::info;

/// Launches allow-listed desktop applications, detached from this process.
pub struct OpenAppTool;

#[async_trait::async_trait]
impl Tool for OpenAppTool {
    fn name(&self) -> &str {
        "open_app"
    }

    fn description(&self) -> &str {
        "Open allowlisted desktop applications."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {"app_name": {"type": "string"}},
            "required": ["app_name"],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, args: &JsonMap, context: &ToolContext) -> ToolExecutionResult {
        let app_name = arg_str(args, "app_name").trim().to_lowercase();
        if app_name.is_empty() {
            return ToolExecutionResult::fail("Missing app_name.");
        }

        let Some(app_command) = context.config.policy.allowed_apps.get(&app_name) else {
            return ToolExecutionResult::fail(format!("App '{app_name}' is not in allowlist."));
        };

        let mut tokens = app_command.split_whitespace();
        let Some(program) = tokens.next() else {
            return ToolExecutionResult::fail("Configured app command is empty.");
        };
        let launch_args: Vec<&str> = tokens.collect();

        match std::process::Command::new(program).args(&launch_args).spawn() {
            Ok(_) => {
                info!(app = app_name.as_str(), "launched app");
                let mut data = JsonMap::new();
                data.insert("app_name".into(), json!(app_name));
                data.insert("command".into(), json!(app_command));
                ToolExecutionResult::ok_with(format!("Opened {app_name}."), data)
            }
            Err(e) => ToolExecutionResult::fail(format!("Failed to open app: {e}")),
        }
    }
}
