//! Per-agent answer cache keyed by question fingerprint.
//!
//! The fingerprint folds in the agent's schema snapshot version, so a
//! schema change makes every old key unreachable even before the
//! wholesale invalidation hook fires.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::metrics;

#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub formatted_response: String,
    pub sql_query: Option<String>,
    stored_at: Instant,
}

struct AgentCache {
    entries: HashMap<String, CachedAnswer>,
    // Recency order, oldest first. Touched keys get re-pushed; stale
    // occurrences are skipped during eviction.
    order: VecDeque<String>,
}

impl AgentCache {
    fn new() -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new() }
    }
}

pub struct ResponseCache {
    agents: Mutex<HashMap<i64, AgentCache>>,
    capacity: usize,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { agents: Mutex::new(HashMap::new()), capacity: capacity.max(1), ttl }
    }

    /// Stable key over the normalised question, the agent, and its
    /// schema snapshot version.
    pub fn fingerprint(question: &str, agent_id: i64, schema_version: i64) -> String {
        let normalised = normalise_question(question);
        let mut hasher = Sha256::new();
        hasher.update(normalised.as_bytes());
        hasher.update([0]);
        hasher.update(agent_id.to_le_bytes());
        hasher.update([0]);
        hasher.update(schema_version.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, agent_id: i64, fingerprint: &str) -> Option<CachedAnswer> {
        let mut agents = self.agents.lock().unwrap();
        let cache = agents.get_mut(&agent_id)?;
        let hit = match cache.entries.get(fingerprint) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.clone()),
            Some(_) => {
                cache.entries.remove(fingerprint);
                None
            }
            None => None,
        };
        if hit.is_some() {
            cache.order.push_back(fingerprint.to_string());
            metrics::inc_cache("hit");
        } else {
            metrics::inc_cache("miss");
        }
        hit
    }

    pub fn put(
        &self,
        agent_id: i64,
        fingerprint: String,
        formatted_response: String,
        sql_query: Option<String>,
    ) {
        let mut agents = self.agents.lock().unwrap();
        let cache = agents.entry(agent_id).or_insert_with(AgentCache::new);
        cache.entries.insert(
            fingerprint.clone(),
            CachedAnswer { formatted_response, sql_query, stored_at: Instant::now() },
        );
        cache.order.push_back(fingerprint);

        while cache.entries.len() > self.capacity {
            match cache.order.pop_front() {
                Some(oldest) => {
                    // Skip stale recency entries for keys that were
                    // touched again later.
                    if !cache.order.contains(&oldest) {
                        cache.entries.remove(&oldest);
                        debug!("Cache evicted entry for agent {}", agent_id);
                    }
                }
                None => break,
            }
        }
    }

    /// Wholesale invalidation, wired to agent/connection mutations.
    pub fn invalidate_agent(&self, agent_id: i64) {
        let mut agents = self.agents.lock().unwrap();
        if agents.remove(&agent_id).is_some() {
            info!("Answer cache invalidated for agent {}", agent_id);
        }
    }

    pub fn len(&self, agent_id: i64) -> usize {
        self.agents.lock().unwrap().get(&agent_id).map(|c| c.entries.len()).unwrap_or(0)
    }
}

/// Lowercase, trim, and collapse internal whitespace runs.
pub fn normalise_question(question: &str) -> String {
    question.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}
