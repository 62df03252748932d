//! Code-generation bridge to the local model.
//!
//! Produces code suggestions and explanations only: this tool never writes
//! files and never runs shell commands itself — those request flags exist on
//! the args purely so the policy engine can gate or block them upstream.

use crate::llm::offline_fallback;
use crate::tools::{Tool, ToolContext, arg_str};
use crate::types::{AssistantMode, JsonMap, ToolExecutionResult};
use serde_json::json;

/// Generates code suggestions and technical explanations.
pub struct CodeAgentTool;

#[async_trait::async_trait]
impl Tool for CodeAgentTool {
    fn name(&self) -> &str {
        "code_agent"
    }

    fn description(&self) -> &str {
        "Generate code suggestions and technical explanations."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string"},
                "language": {"type": "string"},
                "write_files": {"type": "boolean"},
                "run_shell": {"type": "boolean"},
            },
            "required": ["task"],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, args: &JsonMap, context: &ToolContext) -> ToolExecutionResult {
        let task = arg_str(args, "task").trim().to_owned();
        if task.is_empty() {
            return ToolExecutionResult::fail("Missing task.");
        }
        let language = {
            let given = arg_str(args, "language").trim();
            if given.is_empty() { "text" } else { given }.to_owned()
        };

        let prompt = format!(
            "Task:\n{task}\n\nLanguage: {language}\n\n\
             Return practical code with short explanation. \
             Do not assume internet. Keep it runnable locally."
        );
        let mut answer = context.llm.generate(&prompt, AssistantMode::Code).await;
        if answer.is_empty() {
            answer = offline_fallback(&task, AssistantMode::Code);
        }

        let mut data = JsonMap::new();
        data.insert("task".into(), json!(task));
        data.insert("language".into(), json!(language));
        data.insert("output".into(), json!(answer));
        ToolExecutionResult::ok_with("Code guidance generated.", data)
    }
}
