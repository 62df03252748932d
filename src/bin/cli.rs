//! Minimal interactive host for the assistant core.
//!
//! Loads config, starts the background workers, and serves a stdin REPL.
//! Lines are processed in Action mode by default; prefix a line with
//! `chat:` or `code:` to switch modes for that line, `events` dumps buffered
//! events, `quit` exits.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wisp::types::AssistantMode;
use wisp::{AssistantConfig, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = AssistantConfig::default_config_path();
    let config = if config_path.exists() {
        AssistantConfig::from_file(&config_path)?
    } else {
        AssistantConfig::default()
    };

    let orchestrator = Orchestrator::new(config)?;
    orchestrator.start_background_workers().await;
    let events = orchestrator.events().subscribe();
    info!("assistant ready; type a request, or 'quit' to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
            break;
        }
        if line.eq_ignore_ascii_case("events") {
            for event in events.drain() {
                println!("{event}");
            }
            continue;
        }

        let (mode, text) = if let Some(rest) = line.strip_prefix("chat:") {
            (AssistantMode::Chat, rest.trim())
        } else if let Some(rest) = line.strip_prefix("code:") {
            (AssistantMode::Code, rest.trim())
        } else {
            (AssistantMode::Action, line)
        };

        match orchestrator.chat("cli", text, mode).await {
            Ok(outcome) => {
                println!("{}", outcome.reply);
                if let Some(plan) = outcome.plan {
                    for step in &plan.steps {
                        let gate = if step.needs_approval { " (needs approval)" } else { "" };
                        println!("  - [{}] {}{}", step.id, step.description, gate);
                    }
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    orchestrator.stop_background_workers().await;
    Ok(())
}
