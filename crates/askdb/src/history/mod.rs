//! Semantic-history retrieval and capture.
//!
//! Retrieval blends three sources: the session's recent tail, the
//! nearest indexed messages for the (user, agent) pair, and the last
//! user/assistant interaction, which is always kept on top. Every entry
//! point is total: a vector failure downgrades to lexical search, a
//! lexical failure yields an empty list and a warning.

pub mod embedder;
pub mod embedding_store;

pub use embedder::{
    spawn_embedding_worker, Embedder, EmbeddingJob, EmbeddingSender, HttpEmbedder,
};
pub use embedding_store::{cosine_similarity, EmbeddingStats, EmbeddingStore, EMBEDDING_DIM};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::CoreResult;
use crate::store::{MessageRecord, MetaStore};

/// How many similar messages the vector search asks for.
const SIMILAR_TOP_K: usize = 10;
/// How many trailing session messages are always considered.
const RECENT_N: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalSource {
    Recent,
    Similar,
    Lexical,
    LastInteraction,
}

#[derive(Debug, Clone)]
pub struct RetrievedMessage {
    pub message: MessageRecord,
    pub score: f32,
    pub source: RetrievalSource,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub max_messages: usize,
    pub similarity_threshold: f32,
    pub model_version: String,
}

impl HistoryConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            enabled: cfg.history_enabled,
            max_messages: cfg.history_max_messages,
            similarity_threshold: cfg.history_similarity_threshold,
            model_version: cfg.embedding_model.clone(),
        }
    }
}

pub struct HistoryService {
    store: Arc<MetaStore>,
    embeddings: Arc<EmbeddingStore>,
    embedder: Arc<dyn Embedder>,
    embed_tx: EmbeddingSender,
    cfg: HistoryConfig,
}

impl HistoryService {
    pub fn new(
        store: Arc<MetaStore>,
        embeddings: Arc<EmbeddingStore>,
        embedder: Arc<dyn Embedder>,
        embed_tx: EmbeddingSender,
        cfg: HistoryConfig,
    ) -> Self {
        Self { store, embeddings, embedder, embed_tx, cfg }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Persists one user/assistant exchange and queues embedding jobs
    /// for both messages.
    pub fn capture(
        &self,
        chat_session_id: i64,
        run_id: Option<i64>,
        user_text: &str,
        assistant_text: &str,
        sql_query: Option<&str>,
    ) -> CoreResult<(i64, i64)> {
        let (user_msg, assistant_msg) = self.store.sessions.capture_exchange(
            chat_session_id,
            run_id,
            user_text,
            assistant_text,
            sql_query,
        )?;
        for message_id in [user_msg, assistant_msg] {
            if self.embed_tx.send(EmbeddingJob { message_id }).is_err() {
                warn!("Embedding queue closed, message {} stays lexical-only", message_id);
            }
        }
        Ok((user_msg, assistant_msg))
    }

    /// Last `n` messages of a session, in order.
    pub fn recent(&self, chat_session_id: i64, n: usize) -> CoreResult<Vec<MessageRecord>> {
        self.store.sessions.recent_messages(chat_session_id, n)
    }

    /// Collects context for a new question. Total: any failure inside
    /// degrades rather than propagating.
    pub async fn relevant(
        &self,
        user_id: i64,
        agent_id: i64,
        query_text: &str,
        chat_session_id: Option<i64>,
    ) -> Vec<RetrievedMessage> {
        if !self.cfg.enabled {
            return Vec::new();
        }
        let mut collected: Vec<RetrievedMessage> = Vec::new();

        if let Some(session_id) = chat_session_id {
            match self.store.sessions.recent_messages(session_id, RECENT_N) {
                Ok(messages) => collected.extend(messages.into_iter().map(|message| {
                    RetrievedMessage { message, score: 0.9, source: RetrievalSource::Recent }
                })),
                Err(e) => warn!("Recent-message fetch failed: {}", e),
            }
        }

        match self.similar(user_id, agent_id, query_text).await {
            Ok(similar) => collected.extend(similar),
            Err(e) => {
                warn!("Semantic search failed, falling back to lexical: {}", e);
                collected.extend(self.lexical(user_id, agent_id, query_text));
            }
        }

        // The most recent interaction always outranks similarity hits.
        if let Some(session_id) = chat_session_id {
            match self.store.sessions.recent_messages(session_id, 2) {
                Ok(pair) => {
                    let mut score = 1.1;
                    for message in pair {
                        collected.push(RetrievedMessage {
                            message,
                            score,
                            source: RetrievalSource::LastInteraction,
                        });
                        score = 1.05;
                    }
                }
                Err(e) => warn!("Last-interaction fetch failed: {}", e),
            }
        }

        let ranked = dedupe_and_rank(collected, self.cfg.max_messages);
        debug!("History retrieval produced {} messages", ranked.len());
        ranked
    }

    async fn similar(
        &self,
        user_id: i64,
        agent_id: i64,
        query_text: &str,
    ) -> CoreResult<Vec<RetrievedMessage>> {
        let query_vector = self
            .embedder
            .embed(vec![query_text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| crate::error::CoreError::Model("embedder returned no vectors".into()))?;

        // The index is global; intersect with the messages this user
        // actually exchanged with this agent.
        let allowed: HashSet<i64> =
            self.store.sessions.embedded_message_ids(user_id, agent_id)?.into_iter().collect();
        if allowed.is_empty() {
            return Ok(Vec::new());
        }

        let scored = self.embeddings.find_similar(
            &query_vector,
            &self.cfg.model_version,
            SIMILAR_TOP_K * 4,
            self.cfg.similarity_threshold,
        )?;
        let scored: Vec<(i64, f32)> = scored
            .into_iter()
            .filter(|(id, _)| allowed.contains(id))
            .take(SIMILAR_TOP_K)
            .collect();

        let by_id: HashMap<i64, f32> = scored.iter().cloned().collect();
        let ids: Vec<i64> = scored.iter().map(|(id, _)| *id).collect();
        let messages = self.store.sessions.messages_by_ids(&ids)?;
        Ok(messages
            .into_iter()
            .map(|message| {
                let score = by_id.get(&message.id).copied().unwrap_or(0.0);
                RetrievedMessage { message, score, source: RetrievalSource::Similar }
            })
            .collect())
    }

    /// Token-overlap ranking over the recent message pool. Never errors;
    /// a store failure logs and returns nothing.
    fn lexical(&self, user_id: i64, agent_id: i64, query_text: &str) -> Vec<RetrievedMessage> {
        let candidates = match self.store.sessions.lexical_candidates(user_id, agent_id) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Lexical fallback failed: {}", e);
                return Vec::new();
            }
        };
        let query_tokens = tokenize(query_text);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<RetrievedMessage> = candidates
            .into_iter()
            .filter_map(|message| {
                let score = token_overlap(&query_tokens, &tokenize(&message.content));
                if score > 0.0 {
                    Some(RetrievedMessage { message, score, source: RetrievalSource::Lexical })
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(SIMILAR_TOP_K);
        scored
    }

    /// Renders the retrieved set as the bounded text block that goes
    /// into the prompt. Format is load-bearing: the SQL generator sees
    /// exactly this.
    pub fn render(&self, retrieved: &[RetrievedMessage]) -> String {
        if retrieved.is_empty() {
            return String::new();
        }
        let mut recent_lines = Vec::new();
        let mut similar_lines = Vec::new();

        for item in retrieved {
            let when = item.message.created_at.format("%Y-%m-%d %H:%M");
            let mut line = format!("[{} {}] {}", when, item.message.role, item.message.content);
            if let Some(sql) = &item.message.sql_query {
                line.push_str(&format!(" (SQL: {})", sql));
            }
            match item.source {
                RetrievalSource::Similar | RetrievalSource::Lexical => similar_lines.push(line),
                RetrievalSource::Recent | RetrievalSource::LastInteraction => {
                    recent_lines.push(line)
                }
            }
        }

        let mut block = String::new();
        if !recent_lines.is_empty() {
            block.push_str("RECENT MESSAGES:\n");
            block.push_str(&recent_lines.join("\n"));
        }
        if !similar_lines.is_empty() {
            if !block.is_empty() {
                block.push_str("\n\n");
            }
            block.push_str("SIMILAR CONVERSATIONS:\n");
            block.push_str(&similar_lines.join("\n"));
        }
        block
    }
}

fn dedupe_and_rank(collected: Vec<RetrievedMessage>, limit: usize) -> Vec<RetrievedMessage> {
    let mut best: HashMap<i64, RetrievedMessage> = HashMap::new();
    for item in collected {
        match best.get(&item.message.id) {
            Some(existing) if existing.score >= item.score => {}
            _ => {
                best.insert(item.message.id, item);
            }
        }
    }
    let mut ranked: Vec<RetrievedMessage> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.message.sequence_order.cmp(&a.message.sequence_order))
    });
    ranked.truncate(limit);
    ranked
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(String::from)
        .collect()
}

fn token_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f32 / a.len().max(b.len()) as f32
}

#[cfg(test)]
mod tests {
    use super::embedder::test_support::StubEmbedder;
    use super::*;
    use crate::store::agents::test_fixtures::seed_user_agent;
    use tokio::sync::mpsc;

    fn service(
        store: Arc<MetaStore>,
        embedder: Arc<dyn Embedder>,
        enabled: bool,
    ) -> (HistoryService, mpsc::UnboundedReceiver<EmbeddingJob>) {
        let embeddings = Arc::new(EmbeddingStore::new(store.pool()));
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = HistoryConfig {
            enabled,
            max_messages: 15,
            similarity_threshold: 0.3,
            model_version: "m1".into(),
        };
        (HistoryService::new(store, embeddings, embedder, tx, cfg), rx)
    }

    #[tokio::test]
    async fn test_capture_enqueues_two_embedding_jobs() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        let (svc, mut rx) = service(store, Arc::new(StubEmbedder::new()), true);

        let (user_msg, assistant_msg) =
            svc.capture(session.id, None, "q", "a", Some("SELECT 1")).unwrap();

        assert_eq!(rx.recv().await.unwrap().message_id, user_msg);
        assert_eq!(rx.recv().await.unwrap().message_id, assistant_msg);
    }

    #[tokio::test]
    async fn test_relevant_disabled_returns_empty() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let (svc, _rx) = service(store, Arc::new(StubEmbedder::new()), false);

        assert!(svc.relevant(user_id, agent_id, "anything", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_relevant_includes_recent_and_last_interaction() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        let (svc, _rx) = service(store.clone(), Arc::new(StubEmbedder::new()), true);
        svc.capture(session.id, None, "top 5 customers by revenue", "Here they are", None)
            .unwrap();

        let retrieved = svc.relevant(user_id, agent_id, "and by volume?", Some(session.id)).await;
        assert!(!retrieved.is_empty());
        // The last interaction leads the ranking.
        assert_eq!(retrieved[0].source, RetrievalSource::LastInteraction);
        // No duplicates despite recent + last-interaction overlap.
        let mut ids: Vec<i64> = retrieved.iter().map(|r| r.message.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), retrieved.len());
    }

    #[tokio::test]
    async fn test_relevant_total_when_embedder_unreachable() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        let (svc, _rx) = service(store.clone(), Arc::new(StubEmbedder::failing()), true);
        svc.capture(session.id, None, "revenue by region last month", "table attached", None)
            .unwrap();

        // Never panics or errors; lexical fallback still finds overlap.
        let retrieved = svc.relevant(user_id, agent_id, "revenue by region", Some(session.id)).await;
        assert!(!retrieved.is_empty());
        assert!(retrieved
            .iter()
            .any(|r| matches!(r.source, RetrievalSource::Lexical | RetrievalSource::Recent
                | RetrievalSource::LastInteraction)));
    }

    #[tokio::test]
    async fn test_relevant_empty_store_returns_empty_list() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let (svc, _rx) = service(store, Arc::new(StubEmbedder::failing()), true);

        let retrieved = svc.relevant(user_id, agent_id, "anything at all", None).await;
        assert!(retrieved.is_empty());
    }

    #[tokio::test]
    async fn test_render_sections_and_sql() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        let (svc, _rx) = service(store.clone(), Arc::new(StubEmbedder::new()), true);
        svc.capture(session.id, None, "how many orders?", "42 orders", Some("SELECT COUNT(*) FROM orders"))
            .unwrap();

        let retrieved = svc.relevant(user_id, agent_id, "how many orders?", Some(session.id)).await;
        let block = svc.render(&retrieved);
        assert!(block.contains("RECENT MESSAGES:"));
        assert!(block.contains("42 orders"));
        assert!(block.contains("SELECT COUNT(*) FROM orders"));
    }

    #[test]
    fn test_render_empty_is_empty() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (svc, _rx) = service(store, Arc::new(StubEmbedder::new()), true);
        assert_eq!(svc.render(&[]), "");
    }

    #[test]
    fn test_dedupe_keeps_best_score_and_caps() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        let (user_msg, _) =
            store.sessions.capture_exchange(session.id, None, "q", "a", None).unwrap();
        let message = store.sessions.get_message(user_msg).unwrap().unwrap();

        let collected = vec![
            RetrievedMessage { message: message.clone(), score: 0.4, source: RetrievalSource::Similar },
            RetrievedMessage { message, score: 0.9, source: RetrievalSource::Recent },
        ];
        let ranked = dedupe_and_rank(collected, 15);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score, 0.9);
    }

    #[test]
    fn test_token_overlap() {
        let a = tokenize("top customers by revenue");
        let b = tokenize("revenue for top customers");
        let c = tokenize("completely unrelated words");
        assert!(token_overlap(&a, &b) > 0.5);
        assert_eq!(token_overlap(&a, &c), 0.0);
    }
}
