//! CLI command execution.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};

use parley::protocol::ProtocolEvent;
use parley::timeline::{Message, Session, TimelineProjector, ToolStatus};
use parley::{Error, PoolEvent, SessionPool, SessionStatus, Settings, Source};

use super::args::{Cli, Commands};

/// Execute the CLI command.
pub async fn execute(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose);
    let settings = cli.settings()?;

    match cli.command {
        Commands::Chat { name } => chat(settings, name.as_deref().unwrap_or_default()).await,
        Commands::Probe { file } => probe(&settings, &file).await,
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// One line typed at the chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    New(Option<String>),
    Switch(String),
    Close(Option<String>),
    List,
    Health,
    Help,
    Quit,
    Send(String),
    Empty,
    Unknown(String),
}

fn parse_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Send(line.to_string());
    };

    let (verb, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(verb, rest)| (verb, rest.trim()));
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    match verb {
        "new" => ReplCommand::New(arg),
        "switch" => arg.map_or_else(|| ReplCommand::Unknown(line.to_string()), ReplCommand::Switch),
        "close" => ReplCommand::Close(arg),
        "list" => ReplCommand::List,
        "health" => ReplCommand::Health,
        "help" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        _ => ReplCommand::Unknown(line.to_string()),
    }
}

const HELP: &str = "\
Commands:
  /new [name]          Open another session
  /switch <id-prefix>  Make a session active
  /close [id-prefix]   Close a session (default: the active one)
  /list                List sessions
  /health              Session liveness and recent diagnostics
  /quit                Close everything and exit
Anything else is sent to the active session.";

async fn chat(settings: Settings, first_name: &str) -> Result<()> {
    let pool = Arc::new(SessionPool::new(settings));
    let printer = tokio::spawn(print_events(pool.subscribe()));

    let first = pool.create(first_name).await?;
    println!("Session {} ({}) ready. /help for commands.", first.short_id(), first.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match parse_line(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::Quit => break,
            ReplCommand::Unknown(input) => println!("Unknown command: {input} (try /help)"),
            ReplCommand::New(name) => match pool.create(name.as_deref().unwrap_or_default()).await {
                Ok(session) => {
                    pool.switch(&session.id).await?;
                    println!("Session {} ({}) ready.", session.short_id(), session.name);
                }
                Err(err) => println!("Error: {err}"),
            },
            ReplCommand::Switch(prefix) => match pool.resolve(&prefix).await {
                Ok(id) => {
                    pool.switch(&id).await?;
                    println!("Switched to {}", &id[..8.min(id.len())]);
                }
                Err(err) => println!("Error: {err}"),
            },
            ReplCommand::Close(prefix) => {
                let target = match prefix {
                    Some(prefix) => pool.resolve(&prefix).await,
                    None => pool.active().await.ok_or_else(|| Error::NotFound("active session".into())),
                };
                match target {
                    Ok(id) => {
                        pool.close(&id).await?;
                        println!("Closed {}", &id[..8.min(id.len())]);
                    }
                    Err(err) => println!("Error: {err}"),
                }
            }
            ReplCommand::List => {
                let active = pool.active().await;
                for session in pool.list().await {
                    let marker = if active.as_deref() == Some(session.id.as_str()) { "*" } else { " " };
                    println!(
                        "{marker} {} {:<20} {:<6} {} messages",
                        session.short_id(),
                        session.name,
                        session.status,
                        session.timeline.len()
                    );
                }
            }
            ReplCommand::Health => print!("{}", pool.health().await),
            ReplCommand::Send(text) => {
                let Some(id) = pool.active().await else {
                    println!("No active session. Use /new to open one.");
                    continue;
                };
                match pool.send(&id, &text).await {
                    Ok(outcome) => debug!(events = outcome.events, "send finished"),
                    Err(Error::ContextLimit(_)) => {}
                    Err(err) => println!("Error: {err}"),
                }
            }
        }
    }

    pool.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_events(events: tokio::sync::broadcast::Receiver<PoolEvent>) {
    let mut events = BroadcastStream::new(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if let Some(line) = describe_event(&event) {
                    println!("{line}");
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
            }
        }
    }
}

/// Terminal line for an event. The log source mirrors the live stream, so
/// only stream messages are printed.
fn describe_event(event: &PoolEvent) -> Option<String> {
    match event {
        PoolEvent::MessageReceived {
            source: Source::Stream,
            message,
            ..
        } => match message {
            Message::User { .. } | Message::Service { .. } => None,
            other => Some(render_message(other)),
        },
        PoolEvent::SessionStatusChanged {
            session_id,
            status: SessionStatus::Error,
        } => Some(format!("[{}] session is in error; send again to retry", &session_id[..8.min(session_id.len())])),
        _ => None,
    }
}

fn render_message(message: &Message) -> String {
    match message {
        Message::User { text, .. } => format!("> {text}"),
        Message::AssistantText { text, .. } => text.clone(),
        Message::ToolCall(tool) => match tool.status {
            ToolStatus::Pending | ToolStatus::Running => format!("  [{}] running", tool.name),
            ToolStatus::Completed | ToolStatus::Error => {
                let verdict = if tool.status == ToolStatus::Error { "failed" } else { "done" };
                let timing = tool
                    .duration_ms()
                    .map(|ms| format!(" in {ms}ms"))
                    .unwrap_or_default();
                let mut line = format!("  [{}] {verdict}{timing}", tool.name);
                if let Some(result) = &tool.result {
                    for result_line in result.lines() {
                        line.push_str("\n    ");
                        line.push_str(result_line);
                    }
                }
                line
            }
        },
        Message::Service { info, .. } => {
            let mut line = format!(
                "  ({}; context {} tokens, cache {})",
                info.status,
                info.usage.context_tokens(),
                info.usage.cache_tokens()
            );
            if let Some(cost) = info.cost_usd {
                line.insert_str(line.len() - 1, &format!(", ${cost:.4}"));
            }
            line
        }
    }
}

/// Replay a captured stream through the projector.
async fn probe(settings: &Settings, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let session = replay(settings, &content);

    for message in &session.timeline {
        println!("{}", render_message(message));
    }
    if let Some(token) = &session.resume_token {
        println!("resume token: {token}");
    }
    Ok(())
}

fn replay(settings: &Settings, content: &str) -> Session {
    let projector = TimelineProjector::new(settings);
    let mut session = Session::new(
        "probe".into(),
        "probe".into(),
        settings.working_dir.clone(),
    );
    projector.begin_invocation(&mut session);

    let mut terminal = None;
    for (index, line) in content.lines().enumerate() {
        match ProtocolEvent::parse(line) {
            Ok(Some(event)) => {
                projector.apply(&mut session, &event);
                if let ProtocolEvent::Result(result) = event {
                    terminal = Some(result);
                }
            }
            Ok(None) => {}
            Err(err) => debug!(line = index + 1, %err, "skipping unparseable line"),
        }
    }
    projector.finish_invocation(&mut session, terminal.as_ref(), false);
    session
}
