//! Embedding storage and similarity lookup with ANN indexing.
//!
//! Vectors persist as bincode BLOBs keyed by message id; an in-memory
//! HNSW index serves searches, with a linear scan fallback whenever the
//! index is unavailable.

use chrono::Utc;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::store::{now_rfc3339, DbPool};

/// Vector width produced by the external embedder.
pub const EMBEDDING_DIM: usize = 1536;

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingStats {
    pub total_embeddings: usize,
    pub dimension: usize,
    pub index_type: String,
}

pub struct EmbeddingStore {
    pool: DbPool,
    ann_index: RwLock<Option<HNSWIndex<f32, i64>>>,
    embedding_cache: RwLock<HashMap<i64, Vec<f32>>>,
}

impl EmbeddingStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            ann_index: RwLock::new(None),
            embedding_cache: RwLock::new(HashMap::new()),
        }
    }

    fn conn(&self) -> CoreResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        self.pool.get().map_err(CoreError::from)
    }

    /// Loads every stored vector for the model into a fresh HNSW index.
    pub fn initialize_index(&self, model: &str) -> CoreResult<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, embedding FROM message_embeddings WHERE model_version = ?1",
        )?;
        let mut rows = stmt.query([model])?;

        let hnsw_params = HNSWParams {
            n_neighbor: 16,
            ef_build: 100,
            ef_search: 50,
            ..Default::default()
        };
        let mut index = HNSWIndex::<f32, i64>::new(EMBEDDING_DIM, &hnsw_params);

        let mut cache = self.embedding_cache.write().unwrap();
        cache.clear();
        while let Some(row) = rows.next()? {
            let message_id: i64 = row.get(0)?;
            let embedding_bytes: Vec<u8> = row.get(1)?;
            let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
                .map_err(|e| CoreError::Internal(format!("embedding deserialize: {}", e)))?;
            let _ = index.add(&embedding, message_id);
            cache.insert(message_id, embedding);
        }

        index
            .build(Metric::CosineSimilarity)
            .map_err(|e| CoreError::Internal(format!("index build: {}", e)))?;
        *self.ann_index.write().unwrap() = Some(index);
        info!("Embedding index initialized with {} vectors", cache.len());
        Ok(())
    }

    pub fn store_embedding(
        &self,
        message_id: i64,
        embedding: &[f32],
        model: &str,
    ) -> CoreResult<()> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(CoreError::Internal(format!(
                "embedding dimension {} != {}",
                embedding.len(),
                EMBEDDING_DIM
            )));
        }
        let embedding_bytes = bincode::serialize(embedding)
            .map_err(|e| CoreError::Internal(format!("embedding serialize: {}", e)))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO message_embeddings
             (message_id, embedding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, embedding_bytes, model, now_rfc3339()],
        )?;

        let mut cache = self.embedding_cache.write().unwrap();
        cache.insert(message_id, embedding.to_vec());
        if let Some(ref mut index) = *self.ann_index.write().unwrap() {
            let _ = index.add(embedding, message_id);
            index
                .build(Metric::CosineSimilarity)
                .map_err(|e| CoreError::Internal(format!("index rebuild: {}", e)))?;
        }
        Ok(())
    }

    pub fn has_embedding(&self, message_id: i64) -> CoreResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM message_embeddings WHERE message_id = ?1",
            [message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Top scored message ids above the threshold, best first. Falls
    /// back to a linear scan of the table when no index is built.
    pub fn find_similar(
        &self,
        query_embedding: &[f32],
        model: &str,
        limit: usize,
        similarity_threshold: f32,
    ) -> CoreResult<Vec<(i64, f32)>> {
        {
            let index_guard = self.ann_index.read().unwrap();
            if let Some(index) = &*index_guard {
                let ids = index.search(query_embedding, limit);
                let cache = self.embedding_cache.read().unwrap();
                let mut scored: Vec<(i64, f32)> = ids
                    .iter()
                    .filter_map(|id| {
                        cache.get(id).map(|e| (*id, cosine_similarity(query_embedding, e)))
                    })
                    .filter(|(_, sim)| *sim >= similarity_threshold)
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                return Ok(scored);
            }
        }
        warn!("Embedding index not built, using linear scan");
        self.find_similar_linear(query_embedding, model, limit, similarity_threshold)
    }

    fn find_similar_linear(
        &self,
        query_embedding: &[f32],
        model: &str,
        limit: usize,
        similarity_threshold: f32,
    ) -> CoreResult<Vec<(i64, f32)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, embedding FROM message_embeddings WHERE model_version = ?1",
        )?;
        let mut rows = stmt.query([model])?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let message_id: i64 = row.get(0)?;
            let embedding_bytes: Vec<u8> = row.get(1)?;
            let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
                .map_err(|e| CoreError::Internal(format!("embedding deserialize: {}", e)))?;
            let sim = cosine_similarity(query_embedding, &embedding);
            if sim >= similarity_threshold {
                matches.push((message_id, sim));
            }
        }
        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        Ok(matches)
    }

    pub fn get_stats(&self) -> CoreResult<EmbeddingStats> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM message_embeddings", [], |row| row.get(0))?;
        let index_type = if self.ann_index.read().unwrap().is_some() {
            "HNSW".to_string()
        } else {
            "Linear".to_string()
        };
        Ok(EmbeddingStats {
            total_embeddings: count as usize,
            dimension: EMBEDDING_DIM,
            index_type,
        })
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
