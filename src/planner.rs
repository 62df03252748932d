//! Heuristic goal-text planner.
//!
//! Converts free text into an ordered plan of steps via simple, auditable
//! trigger phrases — deliberately not NLU. Each trigger contributes a step
//! independently, in encounter order, except Code mode which short-circuits
//! to a single code step. Every produced step is scored by the policy engine
//! before the plan is returned; blocked steps stay in the plan with an
//! annotated description so callers can see why they will not run.

use crate::config::{PlannerConfig, PolicyConfig};
use crate::policy::PolicyEngine;
use crate::types::{AssistantMode, JsonMap, Plan, PlanStatus, PlanStep, utc_now_iso};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

/// Lead-in phrases stripped from reminder notes.
const REMINDER_LEAD_INS: &[&str] = &["remind me to", "set reminder to", "reminder to"];

/// Heuristic planner. Cheap to clone; holds shared config and policy.
#[derive(Clone)]
pub struct Planner {
    config: Arc<PlannerConfig>,
    policy_config: Arc<PolicyConfig>,
    policy: PolicyEngine,
}

impl Planner {
    /// Create a planner over the given limits and safety rules.
    pub fn new(
        config: Arc<PlannerConfig>,
        policy_config: Arc<PolicyConfig>,
        policy: PolicyEngine,
    ) -> Self {
        Self {
            config,
            policy_config,
            policy,
        }
    }

    /// Convert a goal into a policy-scored plan of 1..=max_plan_steps steps.
    pub fn create_plan(&self, goal: &str, mode: AssistantMode) -> Plan {
        let mut steps = self.extract_steps(goal, mode);
        for step in &mut steps {
            let decision = self.policy.evaluate(step);
            step.risk = decision.risk;
            step.needs_approval = decision.needs_approval;
            if !decision.allowed {
                step.description = format!("{} [BLOCKED: {}]", step.description, decision.reason);
            }
        }
        steps.truncate(self.config.max_plan_steps);

        Plan {
            id: format!("plan_{}", short_id()),
            goal: goal.to_owned(),
            mode,
            status: PlanStatus::Draft,
            created_at: utc_now_iso(),
            steps,
        }
    }

    fn extract_steps(&self, goal: &str, mode: AssistantMode) -> Vec<PlanStep> {
        let text = goal.trim();
        let lowered = text.to_lowercase();
        let mut steps: Vec<PlanStep> = Vec::new();

        if mode == AssistantMode::Code {
            let mut args = JsonMap::new();
            args.insert("task".into(), json!(text));
            args.insert("language".into(), json!(infer_language(&lowered)));
            return vec![PlanStep::with_tool(
                "step_1",
                "Generate or explain code for the request",
                "code_agent",
                args,
            )];
        }

        if let Some(app_name) = self.extract_app_name(&lowered) {
            let mut args = JsonMap::new();
            args.insert("app_name".into(), json!(app_name));
            steps.push(PlanStep::with_tool(
                format!("step_{}", steps.len() + 1),
                format!("Open {app_name}"),
                "open_app",
                args,
            ));
        }

        if lowered.contains("remind") {
            let (note, due_at) = extract_reminder_payload(text, &lowered);
            let mut args = JsonMap::new();
            args.insert("action".into(), json!("set"));
            args.insert("note".into(), json!(note));
            args.insert("due_at".into(), json!(due_at));
            steps.push(PlanStep::with_tool(
                format!("step_{}", steps.len() + 1),
                "Create a reminder",
                "reminder",
                args,
            ));
        }

        if lowered.contains("list reminders") || lowered.contains("show reminders") {
            let mut args = JsonMap::new();
            args.insert("action".into(), json!("list"));
            steps.push(PlanStep::with_tool(
                format!("step_{}", steps.len() + 1),
                "List active reminders",
                "reminder",
                args,
            ));
        }

        if lowered.contains("play music") || lowered.starts_with("play ") {
            let mut args = JsonMap::new();
            args.insert("action".into(), json!("play"));
            args.insert("target".into(), json!(extract_media_target(text, &lowered)));
            steps.push(PlanStep::with_tool(
                format!("step_{}", steps.len() + 1),
                "Play requested media",
                "media_control",
                args,
            ));
        }

        if ["write code", "generate code", "create script"]
            .iter()
            .any(|token| lowered.contains(token))
        {
            let mut args = JsonMap::new();
            args.insert("task".into(), json!(text));
            args.insert("language".into(), json!(infer_language(&lowered)));
            steps.push(PlanStep::with_tool(
                format!("step_{}", steps.len() + 1),
                "Generate code output",
                "code_agent",
                args,
            ));
        }

        if let Some(command) = extract_shell_command(text, &lowered) {
            let mut args = JsonMap::new();
            args.insert("command".into(), json!(command));
            steps.push(PlanStep::with_tool(
                format!("step_{}", steps.len() + 1),
                "Run a safe shell command",
                "safe_shell",
                args,
            ));
        }

        if steps.is_empty() {
            steps.push(PlanStep::direct("step_1", "Respond directly with local model"));
        }
        steps
    }

    /// Find an app to open: allow-listed names first, then the word after
    /// "open " as a general fallback.
    fn extract_app_name(&self, lowered: &str) -> Option<String> {
        for app in self.policy_config.allowed_apps.keys() {
            if lowered.contains(&format!("open {app}")) || lowered == app {
                return Some(app.clone());
            }
        }

        let rest = if let Some(rest) = lowered.strip_prefix("open ") {
            rest
        } else if let Some(idx) = lowered.find(" open ") {
            &lowered[idx + " open ".len()..]
        } else {
            return None;
        };
        let candidate: String = rest
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '_' && c != '-')
            .to_owned();
        if candidate.is_empty() { None } else { Some(candidate) }
    }
}

fn short_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..10].to_owned()
}

/// Extract the reminder note (lead-in stripped) and an RFC 3339 due time
/// from an "in N minutes/hours" phrase, defaulting to now + 30 minutes.
fn extract_reminder_payload(text: &str, lowered: &str) -> (String, String) {
    let now = Utc::now();
    let mut due = now + Duration::minutes(30);

    let tokens: Vec<&str> = lowered.split_whitespace().collect();
    for window in tokens.windows(3) {
        if window[0] != "in" {
            continue;
        }
        let Ok(amount) = window[1].parse::<i64>() else {
            continue;
        };
        if window[2].starts_with("hour") {
            due = now + Duration::hours(amount);
            break;
        }
        if window[2].starts_with("minute") {
            due = now + Duration::minutes(amount);
            break;
        }
    }

    let mut note = text.to_owned();
    for lead_in in REMINDER_LEAD_INS {
        if let Some(idx) = lowered.find(lead_in) {
            note = text[idx + lead_in.len()..].trim().to_owned();
            break;
        }
    }
    if note.is_empty() {
        note = "Reminder".to_owned();
    }
    (note, due.to_rfc3339())
}

fn extract_media_target(text: &str, lowered: &str) -> String {
    if lowered.starts_with("play ") {
        let target = text[5..].trim();
        if !target.is_empty() {
            return target.to_owned();
        }
    }
    "music".to_owned()
}

fn extract_shell_command(text: &str, lowered: &str) -> Option<String> {
    for token in ["run command ", "execute command "] {
        if lowered.starts_with(token) {
            let command = text[token.len()..].trim();
            if !command.is_empty() {
                return Some(command.to_owned());
            }
        }
    }
    None
}

fn infer_language(lowered: &str) -> &'static str {
    if lowered.contains("python") {
        "python"
    } else if lowered.contains("javascript") || lowered.contains("node") {
        "javascript"
    } else if lowered.contains("java") {
        "java"
    } else {
        "text"
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::{PlannerConfig, PolicyConfig};

    fn planner() -> Planner {
        let policy_config = Arc::new(PolicyConfig::default());
        Planner::new(
            Arc::new(PlannerConfig::default()),
            Arc::clone(&policy_config),
            PolicyEngine::new(policy_config),
        )
    }

    #[test]
    fn open_allowlisted_app_produces_open_app_step() {
        let plan = planner().create_plan("open notepad", AssistantMode::Action);
        assert_eq!(plan.steps.len(), 1);
        let step = &plan.steps[0];
        assert_eq!(step.tool.as_deref(), Some("open_app"));
        assert_eq!(step.args["app_name"], "notepad");
        assert!(!step.needs_approval);
    }

    #[test]
    fn open_unknown_app_still_plans_but_blocked_annotation_applied() {
        let plan = planner().create_plan("open winamp", AssistantMode::Action);
        let step = &plan.steps[0];
        assert_eq!(step.tool.as_deref(), Some("open_app"));
        assert!(step.description.contains("[BLOCKED:"), "{}", step.description);
    }

    #[test]
    fn reminder_with_relative_due_time() {
        let before = Utc::now();
        let plan = planner().create_plan(
            "set reminder to drink water in 10 minutes",
            AssistantMode::Action,
        );
        let step = plan
            .steps
            .iter()
            .find(|s| s.tool.as_deref() == Some("reminder"))
            .expect("reminder step");
        assert_eq!(step.args["action"], "set");
        assert_eq!(step.args["note"], "drink water in 10 minutes");

        let due = chrono::DateTime::parse_from_rfc3339(step.args["due_at"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        let offset = due - before;
        assert!(offset >= Duration::minutes(9) && offset <= Duration::minutes(11));
    }

    #[test]
    fn reminder_in_hours() {
        let before = Utc::now();
        let plan = planner().create_plan("remind me to stretch in 2 hours", AssistantMode::Action);
        let step = &plan.steps[0];
        let due = chrono::DateTime::parse_from_rfc3339(step.args["due_at"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        assert!(due - before >= Duration::minutes(119));
    }

    #[test]
    fn reminder_default_due_is_thirty_minutes() {
        let before = Utc::now();
        let plan = planner().create_plan("remind me to call mum", AssistantMode::Action);
        let step = &plan.steps[0];
        let due = chrono::DateTime::parse_from_rfc3339(step.args["due_at"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        let offset = due - before;
        assert!(offset >= Duration::minutes(29) && offset <= Duration::minutes(31));
    }

    #[test]
    fn list_reminders_trigger() {
        let plan = planner().create_plan("show reminders", AssistantMode::Action);
        let step = plan
            .steps
            .iter()
            .find(|s| s.tool.as_deref() == Some("reminder") && s.args["action"] == "list")
            .expect("list step");
        assert!(!step.needs_approval);
    }

    #[test]
    fn play_prefix_extracts_media_target() {
        let plan = planner().create_plan("play lo-fi beats", AssistantMode::Action);
        let step = &plan.steps[0];
        assert_eq!(step.tool.as_deref(), Some("media_control"));
        assert_eq!(step.args["target"], "lo-fi beats");
    }

    #[test]
    fn code_mode_short_circuits_to_single_step() {
        let plan = planner().create_plan(
            "open notepad and play music and write code in python",
            AssistantMode::Code,
        );
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool.as_deref(), Some("code_agent"));
        assert_eq!(plan.steps[0].args["language"], "python");
    }

    #[test]
    fn run_command_prefix_creates_shell_step() {
        let plan = planner().create_plan("run command echo hello", AssistantMode::Action);
        let step = &plan.steps[0];
        assert_eq!(step.tool.as_deref(), Some("safe_shell"));
        assert_eq!(step.args["command"], "echo hello");
        assert!(step.needs_approval, "shell steps are approval-gated");
    }

    #[test]
    fn unmatched_goal_falls_back_to_direct_step() {
        let plan = planner().create_plan("what is the weather like", AssistantMode::Action);
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].tool.is_none());
    }

    #[test]
    fn multiple_triggers_stack_in_encounter_order() {
        let plan = planner().create_plan(
            "open notepad and remind me to hydrate and play music",
            AssistantMode::Action,
        );
        let tools: Vec<&str> = plan.steps.iter().filter_map(|s| s.tool.as_deref()).collect();
        assert_eq!(tools, vec!["open_app", "reminder", "media_control"]);
    }

    #[test]
    fn steps_beyond_cap_are_truncated() {
        let policy_config = Arc::new(PolicyConfig::default());
        let planner = Planner::new(
            Arc::new(PlannerConfig { max_plan_steps: 2 }),
            Arc::clone(&policy_config),
            PolicyEngine::new(policy_config),
        );
        let plan = planner.create_plan(
            "open notepad and remind me to hydrate and play music",
            AssistantMode::Action,
        );
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn language_inference_prefers_javascript_over_java() {
        assert_eq!(infer_language("write javascript"), "javascript");
        assert_eq!(infer_language("write java"), "java");
        assert_eq!(infer_language("write node script"), "javascript");
        assert_eq!(infer_language("write something"), "text");
    }
}
