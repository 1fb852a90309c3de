//! tether - talk to a coding agent from the terminal.
//!
//! Each stdin line is sent as a prompt. `/stop` (or Ctrl-C) stops the running
//! turn, `/quit` or EOF exits once the turn is over.

mod cli;
mod logging;
mod render;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_api::{ConversationEvent, Role};
use tether_session::{Coordinator, NullSink, SqliteStore, TranscriptSink};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::cli::Args;
use crate::logging::setup_logging;
use crate::render::Renderer;

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Prompt(String),
    Stop,
    Quit,
    Empty,
}

impl Input {
    fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Input::Empty,
            "/stop" => Input::Stop,
            "/quit" | "/exit" => Input::Quit,
            text => Input::Prompt(text.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let store = if args.no_store {
        None
    } else {
        let path = args.db_path()?;
        Some(Arc::new(SqliteStore::open(&path).with_context(|| {
            format!("Failed to open transcript store at {}", path.display())
        })?))
    };

    if args.list {
        let store = store.context("--list needs the transcript store")?;
        for conversation in store.list_conversations()? {
            println!(
                "{}\t{} entries\t{}",
                conversation.id,
                conversation.entry_count,
                conversation.updated_at.format("%Y-%m-%d %H:%M")
            );
        }
        return Ok(());
    }

    let id = args.conversation_id();
    let stored_resume_id = match (&store, &args.conversation) {
        (Some(store), Some(_)) => store.load_resume_id(&id)?,
        _ => None,
    };
    let config = args.conversation_config(args.working_directory()?, stored_resume_id);

    let mut stdout = Renderer::new(std::io::stdout());
    if args.history {
        if let Some(store) = &store {
            for entry in store.load_transcript(&id)? {
                stdout.entry(&entry)?;
            }
        }
    }

    let sink: Arc<dyn TranscriptSink> = match &store {
        Some(store) => store.clone(),
        None => Arc::new(NullSink),
    };
    let (mut coordinator, mut events) = Coordinator::new(args.backend(), sink);
    coordinator.open(id.clone(), config).await;
    info!(
        conversation = %id,
        program = %coordinator.backend().program.display(),
        "Opened conversation"
    );
    eprintln!("conversation {id} (/stop, /quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut quitting = false;

    loop {
        tokio::select! {
            line = lines.next_line(), if !quitting => {
                match line?.as_deref().map(Input::parse) {
                    Some(Input::Prompt(text)) => {
                        if let Err(e) = coordinator.send(&id, text).await {
                            warn!(conversation = %id, error = %e, "Failed to send prompt");
                        }
                    }
                    Some(Input::Stop) => {
                        coordinator.stop(&id).await?;
                    }
                    Some(Input::Empty) => {}
                    Some(Input::Quit) | None => quitting = true,
                }
            }
            Some(event) = events.recv() => {
                log_usage(&event);
                stdout.render(&event)?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if !coordinator.stop(&id).await? {
                    quitting = true;
                }
            }
        }

        if quitting && !coordinator.is_live(&id) {
            break;
        }
    }

    coordinator.shutdown().await;
    while let Ok(event) = events.try_recv() {
        stdout.render(&event)?;
    }
    Ok(())
}

/// Token totals go to the log, not the transcript.
fn log_usage(event: &ConversationEvent) {
    if let ConversationEvent::Entry { conversation, entry } = event {
        if let (Role::Assistant, false, Some(usage)) = (entry.role, entry.is_partial, &entry.usage) {
            debug!(
                conversation = %conversation,
                message = %entry.id,
                tokens = usage.total(),
                "Assistant message finished"
            );
        }
    }
}
