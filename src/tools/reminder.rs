//! Reminder create/list/complete against persistent storage.

use crate::tools::{Tool, ToolContext, arg_str};
use crate::types::{JsonMap, ToolExecutionResult};
use chrono::{Duration, Utc};
use serde_json::json;

/// Reminder CRUD backed by the shared store.
pub struct ReminderTool;

#[async_trait::async_trait]
impl Tool for ReminderTool {
    fn name(&self) -> &str {
        "reminder"
    }

    fn description(&self) -> &str {
        "Create, list, and complete reminders."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["set", "list", "complete"]},
                "note": {"type": "string"},
                "due_at": {"type": "string"},
                "reminder_id": {"type": "integer"},
            },
            "required": ["action"],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, args: &JsonMap, context: &ToolContext) -> ToolExecutionResult {
        match arg_str(args, "action").trim().to_lowercase().as_str() {
            "set" => {
                let note = {
                    let trimmed = arg_str(args, "note").trim();
                    if trimmed.is_empty() { "Reminder" } else { trimmed }.to_owned()
                };
                let due_at = {
                    let given = arg_str(args, "due_at").trim();
                    if given.is_empty() {
                        (Utc::now() + Duration::minutes(30)).to_rfc3339()
                    } else {
                        given.to_owned()
                    }
                };
                match context.storage.add_reminder(&note, &due_at) {
                    Ok(id) => {
                        let mut data = JsonMap::new();
                        data.insert("id".into(), json!(id));
                        data.insert("note".into(), json!(note));
                        data.insert("due_at".into(), json!(due_at));
                        ToolExecutionResult::ok_with(format!("Reminder created: {note}"), data)
                    }
                    Err(e) => ToolExecutionResult::fail(format!("Could not save reminder: {e}")),
                }
            }
            "list" => match context.storage.list_reminders(false) {
                Ok(reminders) => {
                    let mut data = JsonMap::new();
                    data.insert(
                        "reminders".into(),
                        serde_json::to_value(&reminders).unwrap_or_default(),
                    );
                    ToolExecutionResult::ok_with(
                        format!("Found {} active reminders.", reminders.len()),
                        data,
                    )
                }
                Err(e) => ToolExecutionResult::fail(format!("Could not list reminders: {e}")),
            },
            "complete" => {
                let Some(reminder_id) = args.get("reminder_id").and_then(|v| v.as_i64()) else {
                    return ToolExecutionResult::fail("Missing reminder_id.");
                };
                match context.storage.complete_reminder(reminder_id) {
                    Ok(true) => {
                        let mut data = JsonMap::new();
                        data.insert("reminder_id".into(), json!(reminder_id));
                        ToolExecutionResult::ok_with(
                            format!("Reminder {reminder_id} completed."),
                            data,
                        )
                    }
                    Ok(false) => {
                        ToolExecutionResult::fail(format!("Reminder {reminder_id} not found."))
                    }
                    Err(e) => ToolExecutionResult::fail(format!("Could not complete reminder: {e}")),
                }
            }
            other => ToolExecutionResult::fail(format!("Unsupported reminder action '{other}'.")),
        }
    }
}
