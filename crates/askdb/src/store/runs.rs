//! Run records and their state machine.
//!
//! Terminal writes are guarded upserts keyed on the run id: once a run
//! is terminal, re-delivered completions are no-ops, which is what makes
//! at-least-once delivery safe.

use rusqlite::{params, Row};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::store::schema::{Run, RunStatus};
use crate::store::{now_rfc3339, parse_datetime_or_now, parse_datetime_safe, DbPool, Pagination};

pub struct RunStore {
    pool: DbPool,
}

/// Optional filters for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilters {
    pub agent_id: Option<i64>,
    pub chat_session_id: Option<i64>,
    pub status: Option<RunStatus>,
}

/// A successful completion payload.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub sql_used: Option<String>,
    pub result_data: String,
    pub execution_ms: i64,
    pub result_rows_count: i64,
}

impl RunStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> CoreResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        self.pool.get().map_err(CoreError::from)
    }

    pub fn create(
        &self,
        agent_id: i64,
        user_id: i64,
        chat_session_id: Option<i64>,
        question: &str,
    ) -> CoreResult<Run> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (agent_id, user_id, chat_session_id, question, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5)",
            params![agent_id, user_id, chat_session_id, question, now_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        self.get(id)?
            .ok_or_else(|| CoreError::Internal("run vanished after insert".into()))
    }

    pub fn get(&self, id: i64) -> CoreResult<Option<Run>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_RUN))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_run(row)?)),
            None => Ok(None),
        }
    }

    pub fn set_task_id(&self, run_id: i64, task_id: &str) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE runs SET task_id = ?1 WHERE id = ?2", params![task_id, run_id])?;
        Ok(())
    }

    /// queued → running. Re-delivery may see the run already `running`;
    /// that counts as picked. Terminal runs refuse.
    pub fn mark_running(&self, run_id: i64) -> CoreResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = 'running' WHERE id = ?1 AND status IN ('queued', 'running')",
            [run_id],
        )?;
        Ok(updated > 0)
    }

    /// Terminal success write. Returns false when the run was already
    /// terminal (idempotent re-delivery).
    pub fn finalize_success(&self, run_id: i64, outcome: &RunOutcome) -> CoreResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = 'success', sql_used = ?1, result_data = ?2,
                    execution_ms = ?3, result_rows_count = ?4, error_kind = NULL,
                    finished_at = ?5
             WHERE id = ?6 AND status IN ('queued', 'running')",
            params![
                outcome.sql_used,
                outcome.result_data,
                outcome.execution_ms,
                outcome.result_rows_count,
                now_rfc3339(),
                run_id
            ],
        )?;
        if updated == 0 {
            warn!("Run {} already terminal, success write skipped", run_id);
        }
        Ok(updated > 0)
    }

    /// Terminal failure write; `result_data` stays empty by contract.
    pub fn finalize_failure(&self, run_id: i64, kind: ErrorKind) -> CoreResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = 'failure', error_kind = ?1, finished_at = ?2
             WHERE id = ?3 AND status IN ('queued', 'running')",
            params![kind.as_str(), now_rfc3339(), run_id],
        )?;
        if updated == 0 {
            warn!("Run {} already terminal, failure write skipped", run_id);
        }
        Ok(updated > 0)
    }

    /// Cancellation reaches only queued runs; anything in flight keeps
    /// going until natural termination.
    pub fn cancel(&self, run_id: i64) -> CoreResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = 'cancelled', finished_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![now_rfc3339(), run_id],
        )?;
        debug!("Cancel run {}: {}", run_id, if updated > 0 { "ok" } else { "not queued" });
        Ok(updated > 0)
    }

    pub fn list(
        &self,
        user_id: i64,
        filters: &RunFilters,
        page: u32,
        per_page: u32,
    ) -> CoreResult<(Vec<Run>, Pagination)> {
        let mut clauses = vec!["user_id = ?1".to_string()];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id)];

        if let Some(agent_id) = filters.agent_id {
            values.push(Box::new(agent_id));
            clauses.push(format!("agent_id = ?{}", values.len()));
        }
        if let Some(session_id) = filters.chat_session_id {
            values.push(Box::new(session_id));
            clauses.push(format!("chat_session_id = ?{}", values.len()));
        }
        if let Some(status) = filters.status {
            values.push(Box::new(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        let where_clause = clauses.join(" AND ");

        let conn = self.conn()?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM runs WHERE {}", where_clause),
            rusqlite::params_from_iter(param_refs.iter()),
            |row| row.get(0),
        )?;
        let pagination = Pagination::build(page, per_page, total as u64);

        let query = format!(
            "{} WHERE {} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            SELECT_RUN,
            where_clause,
            pagination.per_page,
            pagination.offset()
        );
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(param_refs.iter()))?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            runs.push(row_to_run(row)?);
        }
        Ok((runs, pagination))
    }

    // ===== validation harness =====

    pub fn record_validation(
        &self,
        run_id: i64,
        judge_model: &str,
        score: f64,
        verdict: &str,
        explanation: &str,
    ) -> CoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO validations (run_id, judge_model, score, verdict, explanation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run_id, judge_model, score, verdict, explanation, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

const SELECT_RUN: &str = "SELECT id, agent_id, user_id, chat_session_id, question, task_id,
        status, sql_used, result_data, execution_ms, result_rows_count,
        error_kind, created_at, finished_at FROM runs";

fn row_to_run(row: &Row) -> CoreResult<Run> {
    let status: String = row.get(6)?;
    let finished_at: Option<String> = row.get(13)?;
    Ok(Run {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        user_id: row.get(2)?,
        chat_session_id: row.get(3)?,
        question: row.get(4)?,
        task_id: row.get(5)?,
        status: RunStatus::parse(&status)?,
        sql_used: row.get(7)?,
        result_data: row.get(8)?,
        execution_ms: row.get(9)?,
        result_rows_count: row.get(10)?,
        error_kind: row.get(11)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(12)?),
        finished_at: finished_at.as_deref().and_then(parse_datetime_safe),
    })
}
