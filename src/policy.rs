//! Per-step safety policy.
//!
//! [`PolicyEngine::evaluate`] is a pure function from a plan step to a
//! [`PolicyDecision`]; it is the single choke point consulted before any tool
//! runs. Rules are checked in priority order, and the absence of a matching
//! rule is itself a block — there is no default-allow path and no error path.

use crate::config::PolicyConfig;
use crate::types::{PlanStep, PolicyDecision, RiskLevel};
use std::sync::Arc;

/// Shell control operators that always block a `safe_shell` command.
const BLOCKED_CONTROL_OPERATORS: &[&str] = &["&&", "||", "|", ";", "<", ">", "$(", "`", "&"];

fn contains_control_operator(command: &str) -> bool {
    BLOCKED_CONTROL_OPERATORS.iter().any(|op| command.contains(op))
}

fn contains_line_break(command: &str) -> bool {
    command.contains('\n') || command.contains('\r')
}

/// Whole-word-ish blocked-term match: the command is padded with spaces so
/// a term like `rm` matches `rm -rf /` but not `format` inside `performance`
/// when the configured term is ` format `.
fn contains_blocked_term(command: &str, blocked_terms: &[String]) -> bool {
    let padded = format!(" {} ", command.to_lowercase());
    blocked_terms
        .iter()
        .any(|term| !term.is_empty() && padded.contains(&term.to_lowercase()))
}

/// Prefix allow-list check. A prefix matches only exactly or when followed by
/// whitespace: `python --version` accepts `python --version` and
/// `python --version -v`, but rejects `python --versionx`.
fn is_allowlisted_prefix(command: &str, allowed_prefixes: &[String]) -> bool {
    let lowered = command.trim().to_lowercase();
    for prefix in allowed_prefixes {
        let normalized = prefix.trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if lowered == normalized {
            return true;
        }
        if let Some(rest) = lowered.strip_prefix(&normalized) {
            if rest.starts_with(char::is_whitespace) {
                return true;
            }
        }
    }
    false
}

fn arg_str<'a>(step: &'a PlanStep, key: &str) -> &'a str {
    step.args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn arg_bool(step: &PlanStep, key: &str) -> bool {
    step.args.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn allow(risk: RiskLevel, needs_approval: bool, reason: &str) -> PolicyDecision {
    PolicyDecision {
        allowed: true,
        risk,
        needs_approval,
        reason: reason.to_owned(),
    }
}

fn block(reason: String) -> PolicyDecision {
    PolicyDecision {
        allowed: false,
        risk: RiskLevel::High,
        needs_approval: true,
        reason,
    }
}

/// Evaluates safety rules for plan steps. Cheap to clone; holds shared config.
#[derive(Clone)]
pub struct PolicyEngine {
    config: Arc<PolicyConfig>,
}

impl PolicyEngine {
    /// Create an engine over the given safety rules.
    pub fn new(config: Arc<PolicyConfig>) -> Self {
        Self { config }
    }

    /// Evaluate one step. Never panics, never errors.
    pub fn evaluate(&self, step: &PlanStep) -> PolicyDecision {
        let Some(tool) = step.tool.as_deref() else {
            return allow(RiskLevel::Low, false, "Direct answer only.");
        };

        if !self.config.allowed_tools.iter().any(|t| t == tool) {
            return block(format!("Tool '{tool}' is not allowlisted."));
        }

        match tool {
            "open_app" => {
                let app_name = arg_str(step, "app_name").trim().to_lowercase();
                if !self.config.allowed_apps.contains_key(&app_name) {
                    return block(format!("App '{app_name}' is not allowlisted."));
                }
                allow(RiskLevel::Low, false, "Allowlisted app launch.")
            }
            "media_control" => allow(RiskLevel::Low, false, "Media control is low risk."),
            "reminder" => allow(RiskLevel::Low, false, "Reminder operations are low risk."),
            "code_agent" => {
                if arg_bool(step, "run_shell") {
                    return block("Code agent shell execution is blocked by policy.".to_owned());
                }
                if arg_bool(step, "write_files") {
                    return allow(
                        RiskLevel::Medium,
                        true,
                        "File writes require explicit approval.",
                    );
                }
                allow(
                    RiskLevel::Medium,
                    true,
                    "Code generation requires approval by default.",
                )
            }
            "safe_shell" => self.evaluate_shell(arg_str(step, "command")),
            _ => block("No policy rule available.".to_owned()),
        }
    }

    fn evaluate_shell(&self, command: &str) -> PolicyDecision {
        let command = command.trim();
        if command.is_empty() {
            return block("Shell command is missing.".to_owned());
        }
        if contains_line_break(command) {
            return block("Shell command contains forbidden line break.".to_owned());
        }
        if contains_control_operator(command) {
            return block("Shell command contains forbidden control operator.".to_owned());
        }
        if contains_blocked_term(command, &self.config.blocked_shell_terms) {
            return block("Shell command contains blocked term.".to_owned());
        }
        if is_allowlisted_prefix(command, &self.config.allowed_shell_prefixes) {
            return allow(
                RiskLevel::Medium,
                true,
                "Allowlisted shell command requires explicit approval.",
            );
        }
        block("Shell command prefix is not allowlisted.".to_owned())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::types::{JsonMap, PlanStep};
    use serde_json::json;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Arc::new(PolicyConfig::default()))
    }

    fn shell_step(command: &str) -> PlanStep {
        let mut args = JsonMap::new();
        args.insert("command".into(), json!(command));
        PlanStep::with_tool("step_1", "Run a safe shell command", "safe_shell", args)
    }

    #[test]
    fn direct_answer_always_allowed_no_approval() {
        let step = PlanStep::direct("step_1", "Respond directly");
        let decision = engine().evaluate(&step);
        assert!(decision.allowed);
        assert!(!decision.needs_approval);
        assert_eq!(decision.risk, RiskLevel::Low);
    }

    #[test]
    fn unknown_tool_is_blocked() {
        let step = PlanStep::with_tool("step_1", "Use mystery tool", "teleport", JsonMap::new());
        let decision = engine().evaluate(&step);
        assert!(!decision.allowed);
        assert_eq!(decision.risk, RiskLevel::High);
    }

    #[test]
    fn allowlisted_app_is_low_risk() {
        let mut args = JsonMap::new();
        args.insert("app_name".into(), json!("notepad"));
        let step = PlanStep::with_tool("step_1", "Open notepad", "open_app", args);
        let decision = engine().evaluate(&step);
        assert!(decision.allowed);
        assert!(!decision.needs_approval);
    }

    #[test]
    fn unlisted_app_is_blocked() {
        let mut args = JsonMap::new();
        args.insert("app_name".into(), json!("regedit"));
        let step = PlanStep::with_tool("step_1", "Open regedit", "open_app", args);
        assert!(!engine().evaluate(&step).allowed);
    }

    #[test]
    fn code_agent_always_needs_approval() {
        let mut args = JsonMap::new();
        args.insert("task".into(), json!("write a sort function"));
        let step = PlanStep::with_tool("step_1", "Generate code", "code_agent", args);
        let decision = engine().evaluate(&step);
        assert!(decision.allowed);
        assert!(decision.needs_approval);
        assert_eq!(decision.risk, RiskLevel::Medium);
    }

    #[test]
    fn code_agent_shell_request_is_blocked() {
        let mut args = JsonMap::new();
        args.insert("run_shell".into(), json!(true));
        let step = PlanStep::with_tool("step_1", "Generate and run", "code_agent", args);
        assert!(!engine().evaluate(&step).allowed);
    }

    #[test]
    fn code_agent_file_writes_need_approval() {
        let mut args = JsonMap::new();
        args.insert("write_files".into(), json!(true));
        let step = PlanStep::with_tool("step_1", "Generate files", "code_agent", args);
        let decision = engine().evaluate(&step);
        assert!(decision.allowed);
        assert!(decision.needs_approval);
    }

    #[test]
    fn shell_control_operators_all_block() {
        for command in [
            "echo a && echo b",
            "echo a || echo b",
            "echo a | grep a",
            "echo a; echo b",
            "echo < input",
            "echo > output",
            "echo $(date)",
            "echo `date`",
            "echo a &",
        ] {
            let decision = engine().evaluate(&shell_step(command));
            assert!(!decision.allowed, "should block: {command}");
        }
    }

    #[test]
    fn shell_line_break_blocks() {
        assert!(!engine().evaluate(&shell_step("echo a\necho b")).allowed);
        assert!(!engine().evaluate(&shell_step("echo a\recho b")).allowed);
    }

    #[test]
    fn shell_empty_command_blocks() {
        assert!(!engine().evaluate(&shell_step("")).allowed);
        assert!(!engine().evaluate(&shell_step("   ")).allowed);
    }

    #[test]
    fn shell_blocked_term_blocks() {
        assert!(!engine().evaluate(&shell_step("sudo echo hi")).allowed);
    }

    #[test]
    fn shell_prefix_must_end_on_token_boundary() {
        // "python --versionx" is a string prefix of nothing in the allow-list;
        // it must not ride on "python --version".
        assert!(!engine().evaluate(&shell_step("python --versionx")).allowed);

        let exact = engine().evaluate(&shell_step("python --version"));
        assert!(exact.allowed);
        assert!(exact.needs_approval, "shell is never auto-approved");
        assert_eq!(exact.risk, RiskLevel::Medium);

        assert!(engine().evaluate(&shell_step("echo hello world")).allowed);
    }

    #[test]
    fn shell_unlisted_prefix_blocks() {
        assert!(!engine().evaluate(&shell_step("curl http://example.com")).allowed);
    }
}
