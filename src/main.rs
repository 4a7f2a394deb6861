//! chat-relay: drive chat sessions from the terminal
//!
//! Commands read from stdin:
//!   /open <id>     navigate to a stored chat
//!   /attach <path> stage an image for the next message
//!   /detach        clear the staged attachment
//!   /quit          exit
//! Any other line is sent as a message.

use chat_relay::config::{ClientConfig, ConfigError};
use chat_relay::llm::{GeminiService, LoggingModel};
use chat_relay::runtime::{SessionEvent, SessionHandle, SessionManager};
use chat_relay::sync::HttpChatStore;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Input<'a> {
    Open(&'a str),
    Attach(&'a str),
    Detach,
    Quit,
    Message(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let (command, arg) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(c, a)| (c, a.trim()));
    match command {
        "/open" if !arg.is_empty() => Input::Open(arg),
        "/attach" if !arg.is_empty() => Input::Attach(arg),
        "/detach" => Input::Detach,
        "/quit" => Input::Quit,
        _ => Input::Message(line),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ClientConfig::from_env();
    config.validate()?;

    let gemini = GeminiService::new(&config.gemini()?)?;
    tracing::info!(model = %config.gemini_model, "Model service initialized");
    let model = Arc::new(LoggingModel::new(Arc::new(gemini)));

    let api_url = config
        .api_url
        .as_deref()
        .ok_or(ConfigError::Missing("CHAT_API_URL"))?;
    let store = Arc::new(HttpChatStore::new(api_url, config.session_cookie.clone())?);
    let manager = SessionManager::new(model, store, config.attachment_host()?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut current: Option<SessionHandle> = None;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_input(line) {
            Input::Open(id) => match manager.navigate(id).await {
                Ok(handle) => {
                    for turn in handle.view().turns {
                        println!("> {}\n{}\n", turn.question, turn.answer);
                    }
                    tokio::spawn(render(handle.subscribe()));
                    if let Err(e) = handle.activate().await {
                        eprintln!("Could not replay stored question: {e}");
                    }
                    current = Some(handle);
                }
                Err(e) => eprintln!("{e}"),
            },
            Input::Attach(path) => match manager.stager().stage_path(Path::new(path)).await {
                Ok(attempt) => eprintln!("Uploading {path} (attempt {attempt})"),
                Err(e) => eprintln!("{e}"),
            },
            Input::Detach => manager.stager().reset(),
            Input::Quit => break,
            Input::Message(text) => match &current {
                Some(handle) => {
                    if let Err(e) = handle.submit(text).await {
                        eprintln!("{e}");
                    }
                }
                None => eprintln!("Open a chat first with /open <id>"),
            },
        }
    }

    manager.close().await;
    Ok(())
}

/// Print streamed answers for one session until it closes
async fn render(mut events: broadcast::Receiver<SessionEvent>) {
    let mut printed = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Renderer fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            SessionEvent::AnswerProgress { text, .. } => {
                print!("{}", text.get(printed..).unwrap_or_default());
                printed = text.len();
                let _ = std::io::stdout().flush();
            }
            SessionEvent::TurnAppended { .. } => {
                println!("\n");
                printed = 0;
            }
            SessionEvent::TurnFailed { failure, .. } => {
                println!();
                eprintln!("{failure}");
                printed = 0;
            }
            SessionEvent::PersistFailed { error, .. } => {
                eprintln!("Answer kept locally but not saved: {error}");
            }
            SessionEvent::Closed => break,
            _ => {}
        }
    }
}
