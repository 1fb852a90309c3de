//! Session error types.

use tether_api::ConversationId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    #[error("conversation worker for {0} has stopped")]
    WorkerGone(ConversationId),
}
