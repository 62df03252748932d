//! Tool contract and registry.
//!
//! A tool is a named capability with a declarative input schema and one
//! `execute` entry point. Tools only ever see the [`ToolContext`] — config,
//! storage, and the model-generation function — and their hard contract is
//! that execution never raises to the caller: every failure path must be
//! encoded in [`ToolExecutionResult::success`]` == false`.

pub mod code_agent;
pub mod media_control;
pub mod open_app;
pub mod reminder;
pub mod safe_shell;

use crate::config::AssistantConfig;
use crate::llm::TextGenerator;
use crate::storage::Storage;
use crate::types::{JsonMap, ToolExecutionResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Everything a tool is allowed to touch.
#[derive(Clone)]
pub struct ToolContext {
    pub config: Arc<AssistantConfig>,
    pub storage: Arc<Storage>,
    pub llm: Arc<dyn TextGenerator>,
}

/// A named capability invocable through the registry.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Registry key, e.g. `"open_app"`.
    fn name(&self) -> &str;

    /// One-line human description for listings.
    fn description(&self) -> &str;

    /// JSON-schema-shaped description of accepted args.
    fn input_schema(&self) -> serde_json::Value;

    /// Run the tool. Must not panic; failures are results.
    async fn execute(&self, args: &JsonMap, context: &ToolContext) -> ToolExecutionResult;
}

/// Listing entry returned by [`ToolRegistry::list`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Name → tool map with uniform invocation.
pub struct ToolRegistry {
    context: ToolContext,
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry over the given context.
    pub fn new(context: ToolContext) -> Self {
        Self {
            context,
            tools: HashMap::new(),
        }
    }

    /// Register (or replace) a tool under its own name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Whether a tool with this name is registered.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Name/description/schema triples for every registered tool.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut entries: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_owned(),
                description: tool.description().to_owned(),
                input_schema: tool.input_schema(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Execute a tool by name. Unknown names are a failure result, not an
    /// error.
    pub async fn execute(&self, name: &str, args: &JsonMap) -> ToolExecutionResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolExecutionResult::fail(format!("Unknown tool: {name}"));
        };
        debug!(tool = name, "executing tool");
        tool.execute(args, &self.context).await
    }
}

/// Build the registry with the default tool set.
pub fn build_default_registry(
    config: Arc<AssistantConfig>,
    storage: Arc<Storage>,
    llm: Arc<dyn TextGenerator>,
) -> ToolRegistry {
    let context = ToolContext {
        config,
        storage,
        llm,
    };
    let mut registry = ToolRegistry::new(context);
    registry.register(Box::new(open_app::OpenAppTool));
    registry.register(Box::new(media_control::MediaControlTool));
    registry.register(Box::new(reminder::ReminderTool));
    registry.register(Box::new(code_agent::CodeAgentTool));
    registry.register(Box::new(safe_shell::SafeShellTool));
    registry
}

/// String arg accessor shared by the tool implementations: missing and
/// non-string values read as empty.
pub(crate) fn arg_str<'a>(args: &'a JsonMap, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::types::AssistantMode;

    struct SilentGenerator;

    #[async_trait::async_trait]
    impl TextGenerator for SilentGenerator {
        async fn generate(&self, _prompt: &str, _mode: AssistantMode) -> String {
            String::new()
        }
    }

    fn registry_with_temp_storage() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(&dir.path().join("tools.db")).unwrap());
        let registry = build_default_registry(
            Arc::new(AssistantConfig::default()),
            storage,
            Arc::new(SilentGenerator),
        );
        (dir, registry)
    }

    #[tokio::test]
    async fn unknown_tool_returns_failure_result() {
        let (_dir, registry) = registry_with_temp_storage();
        let result = registry.execute("teleport", &JsonMap::new()).await;
        assert!(!result.success);
        assert!(result.message.contains("Unknown tool"));
    }

    #[test]
    fn default_registry_lists_all_five_tools() {
        let (_dir, registry) = registry_with_temp_storage();
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["code_agent", "media_control", "open_app", "reminder", "safe_shell"]
        );
        for name in &names {
            assert!(registry.has_tool(name));
        }
    }
}
