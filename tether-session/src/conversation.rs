//! Per-conversation worker.
//!
//! One task per conversation owns the configuration, the stream pipeline and
//! the current process handle. Commands and process output are handled in a
//! single loop, so "kill the old process, then spawn the new one" can never
//! interleave with output processing: by the time a new process exists, the
//! old one has been reaped and its remaining output consumed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tether_api::{ConversationConfig, ConversationEvent, ConversationId, ProcessId, TranscriptEntry};
use tether_stream::{Emission, Output, Pipeline};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::{Backend, build_invocation};
use crate::error::SessionError;
use crate::sink::TranscriptSink;
use crate::supervisor::{self, ProcessHandle, ProcessOutput};

pub(crate) enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<ProcessId, SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Configure {
        config: ConversationConfig,
        reply: oneshot::Sender<()>,
    },
    Config {
        reply: oneshot::Sender<ConversationConfig>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum Step {
    Command(Option<Command>),
    Output(Option<ProcessOutput>),
}

pub(crate) struct Conversation {
    id: ConversationId,
    backend: Arc<Backend>,
    config: ConversationConfig,
    pipeline: Pipeline,
    current: Option<ProcessHandle>,
    events: mpsc::UnboundedSender<ConversationEvent>,
    sink: Arc<dyn TranscriptSink>,
    live: Arc<AtomicBool>,
    process_ids: Arc<AtomicU64>,
}

impl Conversation {
    pub(crate) fn new(
        id: ConversationId,
        backend: Arc<Backend>,
        config: ConversationConfig,
        events: mpsc::UnboundedSender<ConversationEvent>,
        sink: Arc<dyn TranscriptSink>,
        live: Arc<AtomicBool>,
        process_ids: Arc<AtomicU64>,
    ) -> Self {
        let pipeline = Pipeline::new(backend.echo);
        Self {
            id,
            backend,
            config,
            pipeline,
            current: None,
            events,
            sink,
            live,
            process_ids,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                output = next_output(&mut self.current) => Step::Output(output),
            };

            match step {
                Step::Command(Some(command)) => {
                    if !self.handle(command).await {
                        break;
                    }
                }
                // Coordinator dropped
                Step::Command(None) => break,
                Step::Output(Some(ProcessOutput::Chunk(text))) => self.process_chunk(&text).await,
                Step::Output(Some(ProcessOutput::Exited { code, stderr })) => {
                    self.finish(code, &stderr).await
                }
                Step::Output(None) => self.finish(None, "").await,
            }
        }

        self.kill_current().await;
        debug!(conversation = %self.id, "Conversation worker stopped");
    }

    /// Returns false when the worker should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Send { text, reply } => {
                let result = self.start_turn(&text).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let was_live = self.current.is_some();
                self.kill_current().await;
                let _ = reply.send(was_live);
            }
            Command::Configure { config, reply } => {
                self.config = config;
                let _ = reply.send(());
            }
            Command::Config { reply } => {
                let _ = reply.send(self.config.clone());
            }
            Command::Close { reply } => {
                self.kill_current().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn start_turn(&mut self, text: &str) -> Result<ProcessId, SessionError> {
        self.kill_current().await;
        self.pipeline.reset();

        let process = ProcessId(self.process_ids.fetch_add(1, Ordering::Relaxed));
        let invocation = build_invocation(&self.backend, &self.config, text);
        debug!(conversation = %self.id, process = %process, args = ?invocation.args, "Starting turn");

        let handle = match supervisor::spawn(&invocation, process) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(conversation = %self.id, error = %e, "Failed to start agent");
                return Err(e);
            }
        };

        self.current = Some(handle);
        self.live.store(true, Ordering::SeqCst);
        self.publish(ConversationEvent::ProcessStarted {
            conversation: self.id.clone(),
            process,
        });
        Ok(process)
    }

    /// Kill the live process, if any. Output it had already written is still
    /// processed; half-built entries are dropped.
    async fn kill_current(&mut self) {
        let Some(handle) = self.current.take() else {
            return;
        };
        let process = handle.id();

        for output in handle.kill().await {
            if let ProcessOutput::Chunk(text) = output {
                self.process_chunk(&text).await;
            }
        }

        info!(conversation = %self.id, process = %process, "Killed agent process");
        self.live.store(false, Ordering::SeqCst);
        self.publish(ConversationEvent::ProcessKilled {
            conversation: self.id.clone(),
            process,
        });
    }

    /// The live process exited on its own.
    async fn finish(&mut self, code: Option<i32>, stderr: &str) {
        let Some(handle) = self.current.take() else {
            return;
        };
        let process = handle.id();

        for output in self.pipeline.flush() {
            self.dispatch(output).await;
        }

        if code != Some(0) && !self.pipeline.reconciler().turn_finished() {
            let mut text = match code {
                Some(code) => format!("Agent exited with status {code}"),
                None => "Agent was terminated".to_string(),
            };
            let stderr = stderr.trim();
            if !stderr.is_empty() {
                text.push_str(": ");
                text.push_str(stderr);
            }
            self.dispatch(Output::Emission(Emission::Entry(TranscriptEntry::system_error(text))))
                .await;
        }

        self.live.store(false, Ordering::SeqCst);
        self.publish(ConversationEvent::ProcessExited {
            conversation: self.id.clone(),
            process,
            code,
        });
    }

    async fn process_chunk(&mut self, text: &str) {
        for output in self.pipeline.feed(text) {
            self.dispatch(output).await;
        }
    }

    async fn dispatch(&mut self, output: Output) {
        match output {
            Output::Emission(Emission::Entry(entry)) => {
                if entry.is_final() {
                    let record = entry.clone();
                    self.persist("entry", move |sink, id| sink.record_entry(id, &record))
                        .await;
                }
                self.publish(ConversationEvent::Entry {
                    conversation: self.id.clone(),
                    entry,
                });
            }
            Output::Emission(Emission::SessionCaptured { resume_id, model }) => {
                self.config.resume_id = Some(resume_id.clone());
                if let Some(model) = model {
                    self.config.model.get_or_insert(model);
                }
                let captured = resume_id.clone();
                self.persist("resume id", move |sink, id| sink.record_resume_id(id, &captured))
                    .await;
                self.publish(ConversationEvent::ResumeCaptured {
                    conversation: self.id.clone(),
                    resume_id,
                });
            }
            Output::Diagnostic(diagnostic) => self.publish(ConversationEvent::Diagnostic {
                conversation: self.id.clone(),
                diagnostic,
            }),
        }
    }

    /// Run a sink write on the blocking pool. Writes for one conversation
    /// still happen one at a time, in emission order.
    async fn persist<F>(&self, what: &'static str, write: F)
    where
        F: FnOnce(&dyn TranscriptSink, &ConversationId) -> anyhow::Result<()> + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        let id = self.id.clone();
        match tokio::task::spawn_blocking(move || write(sink.as_ref(), &id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(conversation = %self.id, error = %e, "Failed to record {what}")
            }
            Err(e) => {
                warn!(conversation = %self.id, error = %e, "Transcript write task failed")
            }
        }
    }

    fn publish(&self, event: ConversationEvent) {
        // Observers going away doesn't stop the conversation.
        let _ = self.events.send(event);
    }
}

async fn next_output(current: &mut Option<ProcessHandle>) -> Option<ProcessOutput> {
    match current {
        Some(handle) => handle.recv().await,
        None => std::future::pending().await,
    }
}
