//! Strictly-validated shell command runner.
//!
//! The tool re-applies the same validation the policy engine does — empty,
//! line breaks, control operators, blocked terms, prefix allow-list — so a
//! caller that bypasses planning still cannot run an unvetted command. The
//! command is executed argv-style with no shell, with a clamped timeout.

use crate::policy::PolicyEngine;
use crate::tools::{Tool, ToolContext, arg_str};
use crate::types::{JsonMap, PlanStep, ToolExecutionResult};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 12;
/// Hard timeout bounds.
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 120;
/// Captured stdout/stderr are tail-truncated to this many bytes.
const OUTPUT_TAIL_BYTES: usize = 4000;

/// Runs allow-listed shell commands with strict prefix checks.
pub struct SafeShellTool;

#[async_trait::async_trait]
impl Tool for SafeShellTool {
    fn name(&self) -> &str {
        "safe_shell"
    }

    fn description(&self) -> &str {
        "Run allowlisted shell commands with strict prefix checks."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "timeout_sec": {"type": "integer"},
            },
            "required": ["command"],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, args: &JsonMap, context: &ToolContext) -> ToolExecutionResult {
        let command = arg_str(args, "command").trim().to_owned();
        let timeout_sec = args
            .get("timeout_sec")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);

        // Same checks the policy engine applies at plan time; a step that was
        // never policy-scored gets no free pass here.
        let policy = PolicyEngine::new(Arc::new(context.config.policy.clone()));
        let probe = PlanStep::with_tool("probe", "shell validation", "safe_shell", args.clone());
        let decision = policy.evaluate(&probe);
        if !decision.allowed {
            let mut data = JsonMap::new();
            data.insert("command".into(), json!(command));
            return ToolExecutionResult::fail_with(
                format!("Command blocked: {}", decision.reason),
                data,
            );
        }

        let mut tokens = command.split_whitespace();
        let Some(program) = tokens.next() else {
            return ToolExecutionResult::fail("Missing command.");
        };
        let run_args: Vec<&str> = tokens.collect();

        let run = tokio::process::Command::new(program)
            .args(&run_args)
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(Duration::from_secs(timeout_sec), run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let mut data = JsonMap::new();
                data.insert("command".into(), json!(command));
                return ToolExecutionResult::fail_with(format!("Shell execution error: {e}"), data);
            }
            Err(_) => {
                let mut data = JsonMap::new();
                data.insert("command".into(), json!(command));
                return ToolExecutionResult::fail_with(
                    format!("Command timed out after {timeout_sec}s."),
                    data,
                );
            }
        };

        let success = output.status.success();
        info!(command = command.as_str(), success, "ran shell command");

        let mut data = JsonMap::new();
        data.insert("command".into(), json!(command));
        data.insert("returncode".into(), json!(output.status.code()));
        data.insert(
            "stdout".into(),
            json!(tail(&String::from_utf8_lossy(&output.stdout))),
        );
        data.insert(
            "stderr".into(),
            json!(tail(&String::from_utf8_lossy(&output.stderr))),
        );
        if success {
            ToolExecutionResult::ok_with("Command executed.", data)
        } else {
            ToolExecutionResult::fail_with("Command failed.", data)
        }
    }
}

/// Last `OUTPUT_TAIL_BYTES` of a capture, on a char boundary.
fn tail(text: &str) -> String {
    if text.len() <= OUTPUT_TAIL_BYTES {
        return text.to_owned();
    }
    let mut start = text.len() - OUTPUT_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_owned()
}
