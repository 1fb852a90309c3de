//! Tether Session - agent subprocesses and the conversations that own them.
//!
//! This crate contains:
//! - Backend argument vectors (prompt, resume id, model, permission policy)
//! - The process supervisor (spawn, stream stdout, interrupt)
//! - Per-conversation workers that feed output through [`tether_stream::Pipeline`]
//! - The [`Coordinator`] façade (at most one live process per conversation)
//! - Transcript sinks, including a SQLite-backed store

pub mod backend;
pub mod coordinator;
pub mod sink;
pub mod store;
pub mod supervisor;

mod conversation;
mod error;

pub use backend::{Backend, Invocation, READ_ONLY_TOOLS, build_invocation};
pub use coordinator::Coordinator;
pub use error::SessionError;
pub use sink::{MemorySink, NullSink, TranscriptSink};
pub use store::{SqliteStore, StoredConversation};
pub use supervisor::{ProcessHandle, ProcessOutput, spawn};
