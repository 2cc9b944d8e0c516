//! Run controller: the contract the API facade consumes.
//!
//! Creating a run always attaches a chat session: a recent active one
//! for the same (user, agent) pair when available, a fresh one with a
//! time-stamped title otherwise. It then inserts the queued record and
//! publishes the job.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{Broker, JobPayload};
use crate::cache::ResponseCache;
use crate::error::{CoreError, CoreResult};
use crate::store::{MetaStore, Pagination, Run, RunFilters};

pub struct RunController {
    store: Arc<MetaStore>,
    broker: Arc<Broker>,
    cache: Arc<ResponseCache>,
}

impl RunController {
    pub fn new(store: Arc<MetaStore>, broker: Arc<Broker>, cache: Arc<ResponseCache>) -> Self {
        Self { store, broker, cache }
    }

    pub async fn create_run(
        &self,
        user_id: i64,
        agent_id: i64,
        question: &str,
        chat_session_id: Option<i64>,
    ) -> CoreResult<Run> {
        let question = question.trim();
        if question.is_empty() {
            return Err(CoreError::InvalidInput("question is empty".into()));
        }
        if !self.store.agents.user_owns_agent(user_id, agent_id)? {
            return Err(CoreError::InvalidInput("unknown agent or not owner".into()));
        }

        let session_id = match chat_session_id {
            Some(id) => {
                if !self.store.sessions.session_owned_by(id, user_id)? {
                    return Err(CoreError::InvalidInput("unknown chat session".into()));
                }
                self.store.sessions.touch(id)?;
                id
            }
            None => self.attach_session(user_id, agent_id)?,
        };

        let run = self.store.runs.create(agent_id, user_id, Some(session_id), question)?;
        let payload = JobPayload {
            run_id: run.id,
            user_id,
            agent_id,
            chat_session_id: Some(session_id),
            question: question.to_string(),
            enqueued_at: Utc::now(),
        };

        match self.broker.enqueue(&payload).await {
            Ok(job_id) => {
                self.store.runs.set_task_id(run.id, &format!("job-{}", job_id))?;
            }
            Err(e) => {
                // The queued record must not linger with no job behind it.
                warn!("Enqueue for run {} failed: {}", run.id, e);
                self.store.runs.cancel(run.id)?;
                return Err(e);
            }
        }

        info!("Run {} queued for agent {} (session {})", run.id, agent_id, session_id);
        self.store
            .runs
            .get(run.id)?
            .ok_or_else(|| CoreError::Internal("run vanished after enqueue".into()))
    }

    fn attach_session(&self, user_id: i64, agent_id: i64) -> CoreResult<i64> {
        if let Some(existing) = self.store.sessions.find_reusable(user_id, agent_id)? {
            self.store.sessions.touch(existing)?;
            return Ok(existing);
        }
        let title = format!("Conversation {}", Utc::now().format("%Y-%m-%d %H:%M"));
        Ok(self.store.sessions.create_session(user_id, agent_id, &title)?.id)
    }

    /// Current state, ownership-filtered: callers never see runs that
    /// are not theirs.
    pub fn get_run(&self, user_id: i64, run_id: i64) -> CoreResult<Option<Run>> {
        Ok(self.store.runs.get(run_id)?.filter(|run| run.user_id == user_id))
    }

    pub fn list_runs(
        &self,
        user_id: i64,
        filters: &RunFilters,
        page: u32,
        per_page: u32,
    ) -> CoreResult<(Vec<Run>, Pagination)> {
        self.store.runs.list(user_id, filters, page, per_page)
    }

    /// Cancels a queued run. In-flight runs are left to finish.
    pub fn cancel_run(&self, user_id: i64, run_id: i64) -> CoreResult<bool> {
        match self.get_run(user_id, run_id)? {
            Some(_) => self.store.runs.cancel(run_id),
            None => Err(CoreError::NotFound { category: "run", id: run_id.to_string() }),
        }
    }

    /// Mutation hook for the facade: a connection change invalidates the
    /// answer caches and schema versions of every agent bound to it.
    pub fn on_connection_mutated(&self, connection_id: i64) -> CoreResult<()> {
        for agent_id in self.store.agents.agents_for_connection(connection_id)? {
            self.store.agents.bump_schema_version(agent_id)?;
            self.cache.invalidate_agent(agent_id);
        }
        Ok(())
    }

    /// Mutation hook for the facade: table-scope changes invalidate the
    /// agent's cached answers.
    pub fn on_agent_tables_mutated(&self, agent_id: i64, included_tables: &str) -> CoreResult<()> {
        self.store.agents.update_included_tables(agent_id, included_tables)?;
        self.cache.invalidate_agent(agent_id);
        Ok(())
    }
}
