//! Wisp: local-first AI assistant orchestration core.
//!
//! This crate turns a natural-language request (typed text or a transcribed
//! voice command) into a bounded, policy-checked execution plan, runs that
//! plan against a set of allow-listed tools, and streams progress as events.
//!
//! # Architecture
//!
//! The core is built from small components composed by the orchestrator:
//! - **EventBus**: bounded multi-subscriber pub/sub with drop-oldest overflow
//! - **PolicyEngine**: the single safety choke point before any tool runs
//! - **Planner**: heuristic goal-text → plan-steps conversion
//! - **ToolRegistry**: uniform tool lookup and invocation
//! - **HybridDispatcher**: local model first, cloud fallback with retry
//! - **Orchestrator**: plan/run lifecycle, voice sessions, background workers

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod policy;
pub mod storage;
pub mod tools;
pub mod types;
pub mod voice;

pub use config::AssistantConfig;
pub use error::{AssistantError, Result};
pub use events::{Event, EventBus, Subscription};
pub use orchestrator::Orchestrator;
pub use types::{AssistantMode, Plan, PlanStep, RiskLevel};
