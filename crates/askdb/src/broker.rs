//! Durable job queue between the run controller and the worker pool.
//!
//! Jobs live in the metadata database. A pull claims a job for the
//! visibility window; a worker that dies mid-run simply lets the window
//! lapse and the job is handed to someone else. Delivery is therefore
//! at-least-once, and the run store's guarded terminal write is what
//! makes that safe.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::metrics;
use crate::store::{now_rfc3339, DbPool};

/// Claims beyond this count mean the job is poisoned; it gets swept to
/// the dead set instead of redelivered.
const MAX_ATTEMPTS: i64 = 3;

/// How long `enqueue` waits for the queue to drain before reporting
/// saturation to the caller.
const ENQUEUE_WAIT: Duration = Duration::from_secs(2);

/// The envelope between controller and workers. Everything else is
/// rehydrated from the database by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub run_id: i64,
    pub user_id: i64,
    pub agent_id: i64,
    pub chat_session_id: Option<i64>,
    pub question: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub payload: JobPayload,
    pub attempts: i64,
}

pub struct Broker {
    pool: DbPool,
    capacity: usize,
    notify: Notify,
}

impl Broker {
    pub fn new(pool: DbPool, capacity: usize) -> Self {
        Self { pool, capacity: capacity.max(1), notify: Notify::new() }
    }

    fn conn(&self) -> CoreResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        self.pool.get().map_err(CoreError::from)
    }

    /// Unacked jobs, claimed or not.
    pub fn depth(&self) -> CoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM jobs WHERE acked = FALSE", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Publishes a job, blocking a bounded time when the queue is full.
    /// Saturation after the wait surfaces as a transient error for the
    /// caller to retry.
    pub async fn enqueue(&self, payload: &JobPayload) -> CoreResult<i64> {
        let deadline = tokio::time::Instant::now() + ENQUEUE_WAIT;
        while self.depth()? >= self.capacity {
            if tokio::time::Instant::now() >= deadline {
                warn!("Job queue saturated ({} jobs), rejecting enqueue", self.capacity);
                return Err(CoreError::BrokerSaturated);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let body = serde_json::to_string(payload)
            .map_err(|e| CoreError::Internal(format!("job serialize: {}", e)))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (run_id, payload, enqueued_at) VALUES (?1, ?2, ?3)",
            params![payload.run_id, body, now_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        metrics::inc_queue();
        self.notify.notify_one();
        debug!("Enqueued job {} for run {}", id, payload.run_id);
        Ok(id)
    }

    /// Claims the oldest ready job for `visibility`, bumping its attempt
    /// counter. Returns `None` when nothing is ready.
    pub fn pull(&self, worker_id: &str, visibility: Duration) -> CoreResult<Option<Job>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = now_rfc3339();

        let candidate: Option<(i64, String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, payload, attempts FROM jobs
                 WHERE acked = FALSE
                   AND (locked_until IS NULL OR locked_until <= ?1)
                   AND attempts < ?2
                 ORDER BY id LIMIT 1",
            )?;
            let mut rows = stmt.query(params![now, MAX_ATTEMPTS])?;
            match rows.next()? {
                Some(row) => Some((row.get(0)?, row.get(1)?, row.get(2)?)),
                None => None,
            }
        };

        let Some((id, body, attempts)) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        // Redeliveries back off exponentially: the second claim holds
        // the lock twice as long, the third four times.
        let backoff = visibility * (1u32 << (attempts.clamp(0, 4) as u32));
        let locked_until = (Utc::now()
            + chrono::Duration::from_std(backoff)
                .unwrap_or_else(|_| chrono::Duration::seconds(150)))
        .to_rfc3339();
        tx.execute(
            "UPDATE jobs SET attempts = attempts + 1, locked_by = ?1, locked_until = ?2
             WHERE id = ?3",
            params![worker_id, locked_until, id],
        )?;
        tx.commit()?;

        let payload: JobPayload = serde_json::from_str(&body)
            .map_err(|e| CoreError::Internal(format!("job deserialize: {}", e)))?;
        debug!("Worker {} claimed job {} (attempt {})", worker_id, id, attempts + 1);
        Ok(Some(Job { id, payload, attempts: attempts + 1 }))
    }

    pub fn ack(&self, job_id: i64) -> CoreResult<()> {
        let conn = self.conn()?;
        let updated =
            conn.execute("UPDATE jobs SET acked = TRUE WHERE id = ?1 AND acked = FALSE", [job_id])?;
        if updated > 0 {
            metrics::dec_queue();
        }
        debug!("Acked job {}", job_id);
        Ok(())
    }

    /// Acks poisoned jobs (attempt budget spent, lock lapsed) and
    /// returns their run ids so the caller can fail the runs.
    pub fn sweep_dead(&self) -> CoreResult<Vec<i64>> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let dead: Vec<(i64, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT id, run_id FROM jobs
                 WHERE acked = FALSE AND attempts >= ?1
                   AND (locked_until IS NULL OR locked_until <= ?2)",
            )?;
            let rows = stmt.query_map(params![MAX_ATTEMPTS, now], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut run_ids = Vec::new();
        for (job_id, run_id) in dead {
            warn!("Job {} exhausted its {} attempts, dead-lettering run {}", job_id, MAX_ATTEMPTS, run_id);
            conn.execute("UPDATE jobs SET acked = TRUE WHERE id = ?1", [job_id])?;
            metrics::dec_queue();
            run_ids.push(run_id);
        }
        Ok(run_ids)
    }

    /// Parks the caller until an enqueue fires or the timeout lapses.
    pub async fn wait_for_job(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetaStore;

    fn payload(run_id: i64) -> JobPayload {
        JobPayload {
            run_id,
            user_id: 1,
            agent_id: 1,
            chat_session_id: None,
            question: "q?".into(),
            enqueued_at: Utc::now(),
        }
    }

    fn broker_with_store(capacity: usize) -> (Broker, MetaStore) {
        let store = MetaStore::new_in_memory().unwrap();
        // Runs referenced by jobs must exist for the foreign key.
        let (user_id, _, agent_id) =
            crate::store::agents::test_fixtures::seed_user_agent(&store);
        for _ in 0..8 {
            store.runs.create(agent_id, user_id, None, "q?").unwrap();
        }
        (Broker::new(store.pool(), capacity), store)
    }

    #[tokio::test]
    async fn test_enqueue_pull_ack_round_trip() {
        let (broker, _store) = broker_with_store(10);
        broker.enqueue(&payload(1)).await.unwrap();

        let job = broker.pull("w1", Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(job.payload.run_id, 1);
        assert_eq!(job.payload.question, "q?");
        assert_eq!(job.attempts, 1);

        broker.ack(job.id).unwrap();
        assert_eq!(broker.depth().unwrap(), 0);
        assert!(broker.pull("w1", Duration::from_secs(60)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claimed_job_is_invisible_to_other_workers() {
        let (broker, _store) = broker_with_store(10);
        broker.enqueue(&payload(1)).await.unwrap();

        let job = broker.pull("w1", Duration::from_secs(60)).unwrap();
        assert!(job.is_some());
        assert!(broker.pull("w2", Duration::from_secs(60)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_claim_is_redelivered() {
        let (broker, _store) = broker_with_store(10);
        broker.enqueue(&payload(1)).await.unwrap();

        // Zero-length visibility simulates a worker that died mid-run.
        let first = broker.pull("w1", Duration::from_secs(0)).unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = broker.pull("w2", Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (broker, _store) = broker_with_store(10);
        for run_id in 1..=3 {
            broker.enqueue(&payload(run_id)).await.unwrap();
        }
        for expected in 1..=3 {
            let job = broker.pull("w1", Duration::from_secs(60)).unwrap().unwrap();
            assert_eq!(job.payload.run_id, expected);
            broker.ack(job.id).unwrap();
        }
    }

    #[tokio::test]
    async fn test_saturation_rejects_with_transient_error() {
        let (broker, _store) = broker_with_store(2);
        broker.enqueue(&payload(1)).await.unwrap();
        broker.enqueue(&payload(2)).await.unwrap();

        let err = broker.enqueue(&payload(3)).await.unwrap_err();
        assert!(matches!(err, CoreError::BrokerSaturated));
        assert_eq!(broker.depth().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_attempt_budget_dead_letters() {
        let (broker, _store) = broker_with_store(10);
        broker.enqueue(&payload(5)).await.unwrap();

        for _ in 0..MAX_ATTEMPTS {
            let job = broker.pull("w1", Duration::from_secs(0)).unwrap();
            assert!(job.is_some());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Budget spent: no more deliveries, sweep reports the run.
        assert!(broker.pull("w1", Duration::from_secs(60)).unwrap().is_none());
        let dead = broker.sweep_dead().unwrap();
        assert_eq!(dead, vec![5]);
        assert_eq!(broker.depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_ignores_live_claims() {
        let (broker, _store) = broker_with_store(10);
        broker.enqueue(&payload(1)).await.unwrap();
        broker.pull("w1", Duration::from_secs(60)).unwrap().unwrap();
        assert!(broker.sweep_dead().unwrap().is_empty());
    }
}
