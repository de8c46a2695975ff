//! Persisted conversation history, one transcript per context key.
//!
//! A context key partitions history by (backend, platform conversation,
//! optional sub-key) so switching models never mixes incompatible
//! transcripts. Appends are budget-truncated at write time: stored
//! history never exceeds the model's context limit.
//!
//! Appends are read-modify-write without a cross-job lock. The origin
//! platform opens at most one job per conversation at a time, which
//! makes each context key effectively single-writer; concurrent jobs
//! deliberately sharing a key can interleave their appends.

use std::sync::Arc;

use crate::context::truncate_history;
use crate::error::StoreError;
use crate::llm::ChatMessage;
use crate::store::{Keyspace, KvStore};

/// Conversation history store over the shared key-value store.
pub struct HistoryStore {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Load the transcript for a context key, oldest first.
    pub async fn load(&self, context_key: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let raw = self.store.get(&self.keys.context(context_key)).await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Append one completed (human, assistant) turn, truncating the
    /// stored transcript to `limit` units.
    pub async fn append_turn(
        &self,
        context_key: &str,
        human: &str,
        assistant: &str,
        limit: usize,
    ) -> Result<(), StoreError> {
        let mut transcript = self.load(context_key).await?;
        transcript.push(ChatMessage::human(human));
        transcript.push(ChatMessage::assistant(assistant));
        let transcript = truncate_history(transcript, limit);
        let raw = serde_json::to_string(&transcript)?;
        self.store
            .set(&self.keys.context(context_key), &raw, None)
            .await
    }

    /// Drop the transcript entirely (reset command, end-of-dialogue).
    pub async fn clear(&self, context_key: &str) -> Result<(), StoreError> {
        self.store.delete(&self.keys.context(context_key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::store::MemoryStore;

    fn history() -> HistoryStore {
        HistoryStore::new(Arc::new(MemoryStore::new()), Keyspace::new("test"))
    }

    #[tokio::test]
    async fn append_and_load_round_trip() {
        let history = history();
        history.append_turn("c1", "hi", "hello there", 100).await.unwrap();
        let transcript = history.load("c1").await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::Human);
        assert_eq!(transcript[1].content, "hello there");
    }

    #[tokio::test]
    async fn write_time_truncation_bounds_storage() {
        let history = history();
        for i in 0..20 {
            history
                .append_turn("c1", &format!("question number {i}"), "short answer", 12)
                .await
                .unwrap();
        }
        let transcript = history.load("c1").await.unwrap();
        assert!(crate::context::transcript_units(&transcript) <= 12);
        // Newest turn survives.
        assert_eq!(transcript.last().unwrap().content, "short answer");
    }

    #[tokio::test]
    async fn clear_removes_transcript() {
        let history = history();
        history.append_turn("c1", "hi", "yo", 100).await.unwrap();
        history.clear("c1").await.unwrap();
        assert!(history.load("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_partition_by_context() {
        let history = history();
        history.append_turn("a", "hi", "yo", 100).await.unwrap();
        assert!(history.load("b").await.unwrap().is_empty());
    }
}
