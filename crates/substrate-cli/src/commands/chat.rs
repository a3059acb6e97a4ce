use futures::StreamExt;
use std::io::Write;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use substrate_config::ConfigLoader;
use substrate_core::SubstrateError;
use substrate_runtime::{Agent, ToolActivity, TurnEvent};

use super::truncate_output;

pub(super) async fn cmd_chat(
    loader: &ConfigLoader,
    session: Option<String>,
    model: Option<String>,
) -> substrate_core::Result<()> {
    let agent = Agent::from_config(loader.get()).await?;
    let started_model = agent.config().agent.model.clone();
    // Edits to agent.model in substrate.toml apply from the next turn on
    let _watcher = match loader.watch() {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "config hot-reload unavailable");
            None
        }
    };
    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let history = agent.sessions().acquire(&session_id).map(|s| s.messages.len())?;
    info!(session = %session_id, history, model = ?model, "chat session started");

    println!("Substrate Interactive Chat");
    println!("   session: {session_id}");
    if history > 0 {
        println!("   resumed with {history} messages");
    }
    println!("   Type 'exit' to quit, Ctrl+C to interrupt a reply");
    println!();

    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::BufReader::new(stdin).lines();

    loop {
        eprint!("\x1b[36myou>\x1b[0m ");
        std::io::stderr().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/exit") {
            break;
        }

        let turn_model = model.clone().or_else(|| {
            let current = loader.get().agent.model;
            (current != started_model).then_some(current)
        });
        let cancel = CancellationToken::new();
        let stream = agent.run_turn(&session_id, trimmed, turn_model.as_deref(), cancel.clone());
        futures::pin_mut!(stream);

        let mut got_text = false;
        loop {
            let event = tokio::select! {
                _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                    cancel.cancel();
                    continue;
                }
                event = stream.next() => event,
            };
            let Some(event) = event else { break };

            match event {
                TurnEvent::TextDelta(text) => {
                    if !got_text {
                        eprint!("\x1b[32msubstrate>\x1b[0m ");
                        got_text = true;
                    }
                    print!("{text}");
                    std::io::stdout().flush().ok();
                }
                TurnEvent::ToolActivity(ToolActivity::Started { tool_name, arguments, .. }) => {
                    if got_text {
                        println!();
                        got_text = false;
                    }
                    eprintln!(
                        "\x1b[33m🔧 {tool_name}\x1b[0m \x1b[90m{}\x1b[0m",
                        truncate_output(&arguments.to_string(), 120)
                    );
                }
                TurnEvent::ToolActivity(ToolActivity::Finished { tool_name, success, .. }) => {
                    if success {
                        eprintln!("\x1b[90m   ✓ {tool_name}\x1b[0m");
                    } else {
                        eprintln!("\x1b[31m   ✗ {tool_name} failed\x1b[0m");
                    }
                }
                TurnEvent::Final(message) => {
                    // Non-streaming turns deliver the whole reply here
                    if !got_text {
                        eprint!("\x1b[32msubstrate>\x1b[0m ");
                        print!("{}", message.text_content());
                    }
                    println!();
                }
                TurnEvent::Error(SubstrateError::Cancelled) => {
                    println!();
                    eprintln!("\x1b[90m(interrupted, nothing was saved)\x1b[0m");
                }
                TurnEvent::Error(e) => {
                    println!();
                    eprintln!("\x1b[31m❌ {e}\x1b[0m");
                }
            }
        }
        println!();
    }

    println!("👋 Goodbye!");
    Ok(())
}
