//! Embedding generation: the HTTP client for the external embedder and
//! the background job that vectorises captured messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::history::embedding_store::{EmbeddingStore, EMBEDDING_DIM};
use crate::store::MetaStore;

/// Transient-failure retry budget for one embedding job.
const EMBED_RETRIES: usize = 2;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> CoreResult<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/v1/embeddings` client.
pub struct HttpEmbedder {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            base_url,
            api_key,
            model,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: Vec<String>) -> CoreResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding {} text(s)", texts.len());
        let request = EmbeddingRequest { model: &self.model, input: texts };

        let mut builder = self
            .http_client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::Model(format!("embedding request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Model(format!("embedder returned {}: {}", status, body)));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Model(format!("embedding parse failed: {}", e)))?;
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        for vector in &vectors {
            if vector.len() != EMBEDDING_DIM {
                return Err(CoreError::Model(format!(
                    "embedder returned dimension {} (expected {})",
                    vector.len(),
                    EMBEDDING_DIM
                )));
            }
        }
        Ok(vectors)
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub message_id: i64,
}

pub type EmbeddingSender = mpsc::UnboundedSender<EmbeddingJob>;

/// Spawns the drain task that turns captured messages into vectors.
/// Failures leave the message lexically searchable, nothing more.
pub fn spawn_embedding_worker(
    store: Arc<MetaStore>,
    embeddings: Arc<EmbeddingStore>,
    embedder: Arc<dyn Embedder>,
    model_version: String,
) -> (EmbeddingSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<EmbeddingJob>();

    let handle = tokio::spawn(async move {
        info!("Embedding worker started (model {})", model_version);
        while let Some(job) = rx.recv().await {
            if let Err(e) =
                generate(&store, &embeddings, embedder.as_ref(), &model_version, job.message_id)
                    .await
            {
                warn!(
                    "Embedding for message {} failed permanently: {}. \
                     Message remains searchable lexically.",
                    job.message_id, e
                );
            }
        }
        info!("Embedding worker stopped");
    });

    (tx, handle)
}

async fn generate(
    store: &MetaStore,
    embeddings: &EmbeddingStore,
    embedder: &dyn Embedder,
    model_version: &str,
    message_id: i64,
) -> CoreResult<()> {
    let message = store
        .sessions
        .get_message(message_id)?
        .ok_or(CoreError::NotFound { category: "message", id: message_id.to_string() })?;

    let mut last_err = CoreError::Internal("unreachable".into());
    for attempt in 0..=EMBED_RETRIES {
        match embedder.embed(vec![message.content.clone()]).await {
            Ok(vectors) => {
                let vector = vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| CoreError::Model("embedder returned no vectors".into()))?;
                embeddings.store_embedding(message_id, &vector, model_version)?;
                debug!("Embedded message {} (attempt {})", message_id, attempt + 1);
                return Ok(());
            }
            Err(e) => {
                last_err = e;
                if attempt < EMBED_RETRIES {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        200 * (attempt as u64 + 1),
                    ))
                    .await;
                }
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic embedder: hashes tokens into a fixed-dimension
    /// bag-of-words vector, so similar texts get similar vectors.
    pub struct StubEmbedder {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl StubEmbedder {
        pub fn new() -> Self {
            Self { calls: AtomicUsize::new(0), fail: false }
        }

        pub fn failing() -> Self {
            Self { calls: AtomicUsize::new(0), fail: true }
        }

        pub fn vectorize(text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; EMBEDDING_DIM];
            for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
                if token.is_empty() {
                    continue;
                }
                let mut hash: usize = 5381;
                for b in token.bytes() {
                    hash = hash.wrapping_mul(33).wrapping_add(b as usize);
                }
                v[hash % EMBEDDING_DIM] += 1.0;
            }
            v
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: Vec<String>) -> CoreResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CoreError::Model("stub embedder down".into()));
            }
            Ok(texts.iter().map(|t| Self::vectorize(t)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubEmbedder;
    use super::*;
    use crate::store::agents::test_fixtures::seed_user_agent;

    fn seeded() -> (Arc<MetaStore>, Arc<EmbeddingStore>, i64) {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let embeddings = Arc::new(EmbeddingStore::new(store.pool()));
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        let (user_msg, _) =
            store.sessions.capture_exchange(session.id, None, "top customers", "list", None).unwrap();
        (store, embeddings, user_msg)
    }

    #[tokio::test]
    async fn test_generate_stores_vector() {
        let (store, embeddings, message_id) = seeded();
        let embedder = StubEmbedder::new();

        generate(&store, &embeddings, &embedder, "m1", message_id).await.unwrap();
        assert!(embeddings.has_embedding(message_id).unwrap());
    }

    #[tokio::test]
    async fn test_generate_retries_then_gives_up() {
        let (store, embeddings, message_id) = seeded();
        let embedder = StubEmbedder::failing();

        let result = generate(&store, &embeddings, &embedder, "m1", message_id).await;
        assert!(result.is_err());
        // Initial attempt plus EMBED_RETRIES retries.
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), EMBED_RETRIES + 1);
        assert!(!embeddings.has_embedding(message_id).unwrap());
    }

    #[tokio::test]
    async fn test_worker_drains_jobs() {
        let (store, embeddings, message_id) = seeded();
        let embedder = Arc::new(StubEmbedder::new());
        let (tx, handle) =
            spawn_embedding_worker(store, embeddings.clone(), embedder, "m1".into());

        tx.send(EmbeddingJob { message_id }).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(embeddings.has_embedding(message_id).unwrap());
    }

    #[test]
    fn test_stub_vectorizer_is_deterministic_and_similar() {
        use crate::history::embedding_store::cosine_similarity;
        let a = StubEmbedder::vectorize("top 5 customers by revenue");
        let b = StubEmbedder::vectorize("top customers by revenue please");
        let c = StubEmbedder::vectorize("weather in tokyo");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }
}
