//! Where finalized transcript entries go.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, anyhow};
use tether_api::{ConversationId, TranscriptEntry};

/// Persistence collaborator of a coordinator.
///
/// Only final entries (`is_partial == false`) are recorded. Calls run on
/// Tokio's blocking pool, one at a time per conversation, so implementations
/// may do synchronous I/O.
pub trait TranscriptSink: Send + Sync {
    fn record_entry(&self, conversation: &ConversationId, entry: &TranscriptEntry) -> Result<()>;

    fn record_resume_id(&self, conversation: &ConversationId, resume_id: &str) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TranscriptSink for NullSink {
    fn record_entry(&self, _: &ConversationId, _: &TranscriptEntry) -> Result<()> {
        Ok(())
    }

    fn record_resume_id(&self, _: &ConversationId, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Keeps entries in memory, replacing by id like a store would.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(ConversationId, TranscriptEntry)>>,
    resume_ids: Mutex<HashMap<ConversationId, String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Final entries of one conversation, in first-recorded order.
    pub fn transcript(&self, conversation: &ConversationId) -> Vec<TranscriptEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(c, _)| c == conversation)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn resume_id(&self, conversation: &ConversationId) -> Option<String> {
        self.resume_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TranscriptSink for MemorySink {
    fn record_entry(&self, conversation: &ConversationId, entry: &TranscriptEntry) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("transcript buffer poisoned"))?;
        match entries
            .iter_mut()
            .find(|(c, e)| c == conversation && e.id == entry.id)
        {
            Some(slot) => slot.1 = entry.clone(),
            None => entries.push((conversation.clone(), entry.clone())),
        }
        Ok(())
    }

    fn record_resume_id(&self, conversation: &ConversationId, resume_id: &str) -> Result<()> {
        self.resume_ids
            .lock()
            .map_err(|_| anyhow!("resume id map poisoned"))?
            .insert(conversation.clone(), resume_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_api::Role;

    #[test]
    fn test_memory_sink_replaces_by_id() {
        let sink = MemorySink::new();
        let a = ConversationId::from("a");
        let b = ConversationId::from("b");

        sink.record_entry(&a, &TranscriptEntry::new("m1", Role::Assistant, "first"))
            .unwrap();
        sink.record_entry(&b, &TranscriptEntry::new("m1", Role::Assistant, "other"))
            .unwrap();
        sink.record_entry(&a, &TranscriptEntry::new("m1", Role::Assistant, "second"))
            .unwrap();

        let transcript = sink.transcript(&a);
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].content, "second");
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_memory_sink_resume_ids() {
        let sink = MemorySink::new();
        let a = ConversationId::from("a");
        assert_eq!(sink.resume_id(&a), None);
        sink.record_resume_id(&a, "s1").unwrap();
        sink.record_resume_id(&a, "s2").unwrap();
        assert_eq!(sink.resume_id(&a).as_deref(), Some("s2"));
        assert!(NullSink.record_resume_id(&a, "x").is_ok());
    }
}
