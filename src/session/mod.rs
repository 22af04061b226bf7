//! Session registry - per-conversation state and durable chat history.
//!
//! The registry exclusively owns the id→session mapping. Conversation turn
//! logs live only in memory; the durable document holds the exchange history
//! (timestamps, user message, assistant response, message id) and is
//! overwritten wholesale after every mutation, so an acknowledged write
//! survives a crash immediately after.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::llm::ConversationTurn;

/// One completed user/assistant exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub timestamp: DateTime<Utc>,
    pub user_message: String,
    pub assistant_response: String,
    pub message_id: String,
}

/// Durable per-conversation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    /// Full turn log for the model. In-memory only; rebuilt empty on restart.
    #[serde(skip)]
    pub turns: Vec<ConversationTurn>,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_activity: now,
            message_count: 0,
            exchanges: Vec::new(),
            turns: Vec::new(),
        }
    }
}

/// Summary row for conversation listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub preview: String,
}

/// Registry of all conversations, with optional file persistence.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    /// One lock per conversation id; a chat run holds it for the whole
    /// request so same-id runs are serialized while other ids proceed freely.
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    history_path: Option<PathBuf>,
}

impl SessionRegistry {
    /// In-memory registry without persistence.
    pub fn new_memory() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            history_path: None,
        }
    }

    /// Registry backed by a JSON history document, loaded at startup.
    ///
    /// A missing or unreadable document starts an empty registry; it is
    /// never a startup failure.
    pub async fn restore(path: PathBuf) -> Self {
        let sessions = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, Session>>(&raw) {
                Ok(loaded) => {
                    let total: usize = loaded.values().map(|s| s.exchanges.len()).sum();
                    tracing::info!(
                        sessions = loaded.len(),
                        exchanges = total,
                        "chat history loaded from {}",
                        path.display()
                    );
                    loaded
                }
                Err(e) => {
                    tracing::warn!("chat history at {} is corrupt ({}), starting empty", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => {
                tracing::info!("no chat history at {}, starting empty", path.display());
                HashMap::new()
            }
        };

        Self {
            sessions: RwLock::new(sessions),
            run_locks: Mutex::new(HashMap::new()),
            history_path: Some(path),
        }
    }

    /// The per-conversation run lock. Callers hold it across a whole chat
    /// run; two concurrent runs on one id never interleave turn appends.
    pub async fn run_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Create the session if it does not exist yet. Persists on creation.
    pub async fn get_or_create(&self, id: &str) -> Session {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                return session.clone();
            }
        }

        let session = Session::new();
        {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(id) {
                return existing.clone();
            }
            sessions.insert(id.to_string(), session.clone());
            tracing::info!("created new chat session: {}", id);
        }
        self.persist().await;
        session
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Snapshot of the conversation turn log. Call under the run lock.
    pub async fn turns(&self, id: &str) -> Vec<ConversationTurn> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|s| s.turns.clone())
            .unwrap_or_default()
    }

    /// Commit one completed run: write back the turn log, append the
    /// exchange, bump counters, persist. Returns the new message id.
    ///
    /// Call under the run lock; the turn log handle must not outlive it.
    pub async fn complete_exchange(
        &self,
        id: &str,
        turns: Vec<ConversationTurn>,
        user_message: &str,
        assistant_response: &str,
    ) -> String {
        let message_id = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.entry(id.to_string()).or_insert_with(Session::new);

            let timestamp = Utc::now();
            session.message_count += 1;
            session.last_activity = timestamp;
            session.turns = turns;

            let message_id = format!("{}_{}", id, session.message_count);
            session.exchanges.push(Exchange {
                timestamp,
                user_message: user_message.to_string(),
                assistant_response: assistant_response.to_string(),
                message_id: message_id.clone(),
            });
            message_id
        };
        self.persist().await;
        message_id
    }

    /// Remove one conversation. Deleting an unknown id is not an error.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        self.run_locks.lock().await.remove(id);
        if removed {
            tracing::info!("cleared conversation {}", id);
            self.persist().await;
        }
        removed
    }

    /// All conversations, most recent activity first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|(id, session)| SessionSummary {
                conversation_id: id.clone(),
                created_at: session.created_at,
                last_activity: session.last_activity,
                message_count: session.message_count,
                preview: preview_of(session),
            })
            .collect();
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        summaries
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn total_messages(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.exchanges.len())
            .sum()
    }

    pub fn history_path(&self) -> Option<&PathBuf> {
        self.history_path.as_ref()
    }

    /// Overwrite the whole history document with the current session set.
    async fn persist(&self) {
        let Some(path) = &self.history_path else {
            return;
        };

        let snapshot = self.sessions.read().await.clone();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(raw) => {
                if let Err(e) = tokio::fs::write(path, raw).await {
                    tracing::error!("failed to save chat history to {}: {}", path.display(), e);
                } else {
                    tracing::debug!(
                        sessions = snapshot.len(),
                        "chat history saved to {}",
                        path.display()
                    );
                }
            }
            Err(e) => tracing::error!("failed to serialize chat history: {}", e),
        }
    }
}

fn preview_of(session: &Session) -> String {
    match session.exchanges.last() {
        Some(exchange) => {
            let text = &exchange.user_message;
            if text.chars().count() > 100 {
                format!("{}...", text.chars().take(100).collect::<String>())
            } else {
                text.clone()
            }
        }
        None => "No messages".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_and_retrieve() {
        let registry = SessionRegistry::new_memory();
        registry.get_or_create("conv-1").await;

        let session = registry.get("conv-1").await.unwrap();
        assert_eq!(session.message_count, 0);
        assert!(session.exchanges.is_empty());
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn message_ids_are_monotonic_per_session() {
        let registry = SessionRegistry::new_memory();
        registry.get_or_create("conv-1").await;

        let first = registry
            .complete_exchange("conv-1", Vec::new(), "hello", "hi")
            .await;
        let second = registry
            .complete_exchange("conv-1", Vec::new(), "again", "yes")
            .await;

        assert_eq!(first, "conv-1_1");
        assert_eq!(second, "conv-1_2");
        assert_eq!(registry.get("conv-1").await.unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let registry = SessionRegistry::new_memory();
        registry.get_or_create("conv-1").await;

        assert!(registry.delete("conv-1").await);
        assert!(!registry.delete("conv-1").await);
    }

    #[tokio::test]
    async fn list_orders_by_recency() {
        let registry = SessionRegistry::new_memory();
        registry.get_or_create("older").await;
        registry.get_or_create("newer").await;
        registry
            .complete_exchange("older", Vec::new(), "first", "ok")
            .await;
        registry
            .complete_exchange("newer", Vec::new(), "second", "ok")
            .await;

        let summaries = registry.list().await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].conversation_id, "newer");
        assert_eq!(summaries[0].preview, "second");
        assert_eq!(summaries[1].conversation_id, "older");
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat_history.json");

        {
            let registry = SessionRegistry::restore(path.clone()).await;
            registry.get_or_create("conv-1").await;
            registry
                .complete_exchange("conv-1", Vec::new(), "hello", "hi there")
                .await;
        }

        let reloaded = SessionRegistry::restore(path).await;
        let session = reloaded.get("conv-1").await.unwrap();
        assert_eq!(session.message_count, 1);
        assert_eq!(session.exchanges.len(), 1);
        assert_eq!(session.exchanges[0].user_message, "hello");
        assert_eq!(session.exchanges[0].message_id, "conv-1_1");
        // Turn logs are in-memory only.
        assert!(session.turns.is_empty());
    }

    #[tokio::test]
    async fn corrupt_history_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat_history.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let registry = SessionRegistry::restore(path).await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn missing_history_starts_empty() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::restore(dir.path().join("absent.json")).await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn same_id_runs_are_serialized() {
        let registry = Arc::new(SessionRegistry::new_memory());
        registry.get_or_create("shared").await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let lock = registry.run_lock("shared").await;
                let _guard = lock.lock().await;

                // Snapshot, "run", write back; interleaving would lose turns.
                let mut turns = registry.turns("shared").await;
                turns.push(ConversationTurn::User {
                    text: format!("message {}", i),
                });
                tokio::task::yield_now().await;
                turns.push(ConversationTurn::Assistant {
                    content: vec![crate::llm::ContentBlock::Text {
                        text: format!("reply {}", i),
                    }],
                });
                registry
                    .complete_exchange("shared", turns, &format!("message {}", i), "reply")
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let session = registry.get("shared").await.unwrap();
        // Every run's pair survived: nothing was lost to interleaving.
        assert_eq!(session.turns.len(), 16);
        assert_eq!(session.message_count, 8);
        for pair in session.turns.chunks(2) {
            assert!(matches!(pair[0], ConversationTurn::User { .. }));
            assert!(matches!(pair[1], ConversationTurn::Assistant { .. }));
        }
    }
}
