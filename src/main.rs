mod application;
mod config;
mod domain;
mod infrastructure;

use application::agent::{AgentEvent, AgentOptions, ChatOutcome, Conversation, EventSink, Orchestrator};
use application::registry::ToolRegistry;
use application::tooling::{ServerEvent, ServerManager};
use clap::Parser;
use config::AppConfig;
use infrastructure::model::OllamaClient;
use serde_json::json;
use std::error::Error;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Tool-using coding agent backed by capability servers and Ollama"
)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:11434")]
    ollama_url: String,
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_turns: Option<usize>,
    #[arg(long)]
    prompt_file: Option<String>,
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    info!("Starting tessera");
    let cli = Cli::parse();
    debug!(config = ?cli.config, model = ?cli.model, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let file_config = AppConfig::load(config_path)?;
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration from file");
    } else {
        info!("Loaded configuration using default path or defaults");
    }

    let registry = Arc::new(ToolRegistry::new());
    let manager = Arc::new(ServerManager::new(Arc::clone(&registry)));
    spawn_server_event_logger(&manager);

    info!(servers = file_config.servers.len(), "Connecting capability servers");
    manager.reload(&file_config.servers_by_name()).await;
    for state in manager.states() {
        info!(
            server = %state.name,
            status = ?state.status,
            tools = state.tool_count,
            "Server state after startup"
        );
    }

    let model = cli.model.clone().unwrap_or_else(|| file_config.model.clone());
    let mut options = AgentOptions::new(model)
        .with_max_turns(cli.max_turns.unwrap_or(file_config.max_turns));
    if let Some(prompt) = compose_operator_prompt(&cli, &file_config, &manager) {
        options = options.with_system_prompt(prompt);
    }

    debug!(ollama_url = %cli.ollama_url, "Creating Ollama provider");
    let provider = Arc::new(OllamaClient::new(cli.ollama_url.clone()));
    let orchestrator =
        Orchestrator::new(provider, Arc::clone(&registry), options).with_events(agent_event_sink());

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let prompt = load_prompt(&cli)?;
    let mut conversation = Conversation::new();
    let outcome = orchestrator.chat(&mut conversation, prompt, &cancel).await?;

    let output = match outcome {
        ChatOutcome::Answer { content, turns } => json!({
            "conversation_id": conversation.id,
            "content": content,
            "turns": turns,
        }),
        ChatOutcome::Cancelled => json!({
            "conversation_id": conversation.id,
            "cancelled": true,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    manager.shutdown().await;
    info!("Agent execution finished");
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling agent run");
            cancel.cancel();
        }
    });
}

fn spawn_server_event_logger(manager: &Arc<ServerManager>) {
    let events = manager.subscribe();
    tokio::spawn(async move {
        drain_server_events(events).await;
    });
}

/// Logs server events until the channel closes. A lagged receiver skips the
/// overwritten events and keeps listening rather than going silent.
async fn drain_server_events(mut events: broadcast::Receiver<ServerEvent>) -> usize {
    let mut seen = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                seen += 1;
                info!(
                    kind = ?event.kind,
                    server = %event.server,
                    detail = event.detail.as_deref().unwrap_or(""),
                    "Server event"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Server event stream lagged; resuming");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    seen
}

fn agent_event_sink() -> EventSink {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Thinking { turn } => debug!(turn, "Agent thinking"),
                AgentEvent::Thought { text } => info!(thought = %text, "Agent thought"),
                AgentEvent::ToolStart { name, .. } => info!(tool = %name, "Tool started"),
                AgentEvent::ToolEnd { name, success, .. } => {
                    info!(tool = %name, success, "Tool finished");
                }
            }
        }
    });
    EventSink::new(tx)
}

/// Merges the operator's system prompt with the usage guidance connected
/// servers advertised during their handshake.
fn compose_operator_prompt(
    cli: &Cli,
    config: &AppConfig,
    manager: &Arc<ServerManager>,
) -> Option<String> {
    let mut sections = Vec::new();
    if let Some(prompt) = cli.system.clone().or_else(|| config.system_prompt.clone()) {
        sections.push(prompt);
    }
    for state in manager.states() {
        if let Some(instructions) = &state.instructions {
            sections.push(format!("[{} server guidance] {}", state.name, instructions));
        }
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

fn load_prompt(cli: &Cli) -> Result<String, Box<dyn Error>> {
    if let Some(path) = &cli.prompt_file {
        info!(path = %path, "Loading prompt from file");
        let content = fs::read_to_string(path)?;
        return Ok(normalize_prompt(content));
    }

    if !cli.prompt.is_empty() {
        info!("Using prompt provided through CLI arguments");
        let joined = cli.prompt.join(" ");
        return Ok(normalize_prompt(joined));
    }

    if atty::isnt(atty::Stream::Stdin) {
        info!("Reading prompt from standard input");
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        return Ok(normalize_prompt(buffer));
    }

    warn!("Prompt not provided via arguments, file, or stdin");
    Err("prompt required via arguments, file, or stdin".into())
}

fn normalize_prompt(prompt: String) -> String {
    prompt.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::tooling::ServerEventKind;

    #[tokio::test]
    async fn event_logger_survives_a_lagged_receiver() {
        let (tx, rx) = broadcast::channel(1);
        let event = |kind| ServerEvent {
            kind,
            server: "files".to_string(),
            detail: None,
        };
        // Capacity one: the second send overwrites the first, so the receiver
        // wakes up to Lagged before it sees any event.
        tx.send(event(ServerEventKind::Connected)).expect("send");
        tx.send(event(ServerEventKind::ToolsUpdated)).expect("send");
        drop(tx);

        assert_eq!(drain_server_events(rx).await, 1);
    }
}
