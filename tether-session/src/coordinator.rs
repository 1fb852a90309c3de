//! The application-facing façade over all conversations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tether_api::{ConversationConfig, ConversationEvent, ConversationId, ProcessId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::conversation::{Command, Conversation};
use crate::error::SessionError;
use crate::sink::TranscriptSink;

struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owns one worker per conversation and at most one agent process each.
///
/// Every transcript entry (partial and final), lifecycle change and
/// diagnostic is published on the receiver returned by [`Coordinator::new`],
/// in emission order per conversation. Final entries and captured resume ids
/// also go to the sink.
pub struct Coordinator {
    backend: Arc<Backend>,
    sink: Arc<dyn TranscriptSink>,
    events: mpsc::UnboundedSender<ConversationEvent>,
    workers: HashMap<ConversationId, Worker>,
    /// Process ids are unique across conversations.
    process_ids: Arc<AtomicU64>,
}

impl Coordinator {
    pub fn new(
        backend: Backend,
        sink: Arc<dyn TranscriptSink>,
    ) -> (Self, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            backend: Arc::new(backend),
            sink,
            events,
            workers: HashMap::new(),
            process_ids: Arc::new(AtomicU64::new(1)),
        };
        (coordinator, rx)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Register a conversation, or replace the configuration of an open one.
    pub async fn open(&mut self, id: ConversationId, config: ConversationConfig) {
        if let Some(worker) = self.workers.get(&id) {
            if !worker.task.is_finished() {
                let (reply, rx) = oneshot::channel();
                if worker.commands.send(Command::Configure { config: config.clone(), reply }).is_ok()
                    && rx.await.is_ok()
                {
                    return;
                }
            }
            // Worker died; start over below.
            self.workers.remove(&id);
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let live = Arc::new(AtomicBool::new(false));
        let conversation = Conversation::new(
            id.clone(),
            Arc::clone(&self.backend),
            config,
            self.events.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&live),
            Arc::clone(&self.process_ids),
        );
        let task = tokio::spawn(conversation.run(rx));
        debug!(conversation = %id, "Opened conversation");

        self.workers.insert(id, Worker { commands, live, task });
    }

    /// Replace the configuration used for subsequent sends.
    pub async fn configure(
        &self,
        id: &ConversationId,
        config: ConversationConfig,
    ) -> Result<(), SessionError> {
        self.request(id, |reply| Command::Configure { config, reply }).await
    }

    /// Current configuration, including any captured resume id.
    pub async fn config(&self, id: &ConversationId) -> Result<ConversationConfig, SessionError> {
        self.request(id, |reply| Command::Config { reply }).await
    }

    /// Start a turn. Any live process for the conversation is killed first.
    pub async fn send(
        &self,
        id: &ConversationId,
        text: impl Into<String>,
    ) -> Result<ProcessId, SessionError> {
        let text = text.into();
        self.request(id, |reply| Command::Send { text, reply }).await?
    }

    /// Kill the live process. Returns whether there was one.
    pub async fn stop(&self, id: &ConversationId) -> Result<bool, SessionError> {
        self.request(id, |reply| Command::Stop { reply }).await
    }

    /// Whether a process is currently live for `id`.
    pub fn is_live(&self, id: &ConversationId) -> bool {
        self.workers
            .get(id)
            .is_some_and(|w| w.live.load(Ordering::SeqCst))
    }

    /// Stop the conversation's process and forget it.
    pub async fn close(&mut self, id: &ConversationId) -> Result<(), SessionError> {
        self.request(id, |reply| Command::Close { reply }).await?;
        if let Some(worker) = self.workers.remove(id) {
            if let Err(e) = worker.task.await {
                warn!(conversation = %id, error = %e, "Conversation worker failed");
            }
        }
        Ok(())
    }

    /// Close every conversation.
    pub async fn shutdown(&mut self) {
        let ids: Vec<_> = self.workers.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                debug!(conversation = %id, error = %e, "Close during shutdown failed");
                self.workers.remove(&id);
            }
        }
    }

    pub fn conversations(&self) -> impl Iterator<Item = &ConversationId> {
        self.workers.keys()
    }

    async fn request<T>(
        &self,
        id: &ConversationId,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| SessionError::UnknownConversation(id.clone()))?;

        let (reply, rx) = oneshot::channel();
        worker
            .commands
            .send(command(reply))
            .map_err(|_| SessionError::WorkerGone(id.clone()))?;
        rx.await.map_err(|_| SessionError::WorkerGone(id.clone()))
    }
}
