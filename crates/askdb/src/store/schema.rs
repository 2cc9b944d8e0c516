//! Metadata database schema: the relational entities behind agents,
//! sessions, runs, and the durable job queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ConnectionKind;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub display_name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: i64,
    pub owner_user_id: i64,
    pub kind: ConnectionKind,
    pub payload: Value,
    /// Bumped on every payload mutation; engine registry keys embed it
    /// so stale engines are never resolved.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: i64,
    pub owner_user_id: i64,
    pub name: String,
    pub connection_id: i64,
    pub model_id: String,
    pub top_k: i64,
    pub included_tables: String,
    pub advanced: bool,
    pub processing_enabled: bool,
    pub refinement_enabled: bool,
    pub single_table_mode: bool,
    pub selected_table: Option<String>,
    /// Schema snapshot version; part of every cache fingerprint.
    pub schema_version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "archived" { SessionStatus::Archived } else { SessionStatus::Active }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: i64,
    pub user_id: i64,
    pub agent_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub total_messages: i64,
    pub status: SessionStatus,
    pub context_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub chat_session_id: i64,
    pub run_id: Option<i64>,
    pub role: String,
    pub content: String,
    pub sql_query: Option<String>,
    pub sequence_order: i64,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

/// Run lifecycle. `Cancelled` is only reachable from `Queued`; the
/// other terminals come from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failure" => Ok(RunStatus::Failure),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(CoreError::Internal(format!("unknown run status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failure | RunStatus::Cancelled)
    }

    /// The allowed transition set of the run state machine.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Queued, RunStatus::Running)
                | (RunStatus::Queued, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::Success)
                | (RunStatus::Running, RunStatus::Failure)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub agent_id: i64,
    pub user_id: i64,
    pub chat_session_id: Option<i64>,
    pub question: String,
    pub task_id: Option<String>,
    pub status: RunStatus,
    pub sql_used: Option<String>,
    pub result_data: Option<String>,
    pub execution_ms: Option<i64>,
    pub result_rows_count: Option<i64>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub const SCHEMA_SQL: &str = "
-- Users (created by the API facade, read-only for the core)
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    display_name TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMP NOT NULL
);
-- Database connections
CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_user_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (owner_user_id) REFERENCES users(id) ON DELETE CASCADE
);
-- Agents bind a connection to a model and behaviour flags
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    connection_id INTEGER NOT NULL,
    model_id TEXT NOT NULL,
    top_k INTEGER NOT NULL DEFAULT 10,
    included_tables TEXT NOT NULL DEFAULT '*',
    advanced BOOLEAN NOT NULL DEFAULT FALSE,
    processing_enabled BOOLEAN NOT NULL DEFAULT FALSE,
    refinement_enabled BOOLEAN NOT NULL DEFAULT FALSE,
    single_table_mode BOOLEAN NOT NULL DEFAULT FALSE,
    selected_table TEXT,
    schema_version INTEGER NOT NULL DEFAULT 1,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (owner_user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (connection_id) REFERENCES connections(id)
);
-- Chat sessions
CREATE TABLE IF NOT EXISTS chat_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    agent_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    last_activity TIMESTAMP NOT NULL,
    total_messages INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    context_summary TEXT,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (agent_id) REFERENCES agents(id) ON DELETE CASCADE
);
-- Messages; sequence_order is dense per session starting at 1
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_session_id INTEGER NOT NULL,
    run_id INTEGER,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    sql_query TEXT,
    sequence_order INTEGER NOT NULL,
    created_at TIMESTAMP NOT NULL,
    metadata TEXT,
    FOREIGN KEY (chat_session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE,
    UNIQUE(chat_session_id, sequence_order)
);
-- Message embeddings (bincode f32 vectors, one per message)
CREATE TABLE IF NOT EXISTS message_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL UNIQUE,
    embedding BLOB NOT NULL,
    model_version TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
-- Runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    chat_session_id INTEGER,
    question TEXT NOT NULL,
    task_id TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    sql_used TEXT,
    result_data TEXT,
    execution_ms INTEGER,
    result_rows_count INTEGER,
    error_kind TEXT,
    created_at TIMESTAMP NOT NULL,
    finished_at TIMESTAMP,
    FOREIGN KEY (agent_id) REFERENCES agents(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (chat_session_id) REFERENCES chat_sessions(id)
);
-- Durable job queue between the run controller and workers
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TIMESTAMP NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    locked_by TEXT,
    locked_until TIMESTAMP,
    acked BOOLEAN NOT NULL DEFAULT FALSE,
    FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
);
-- Judge scores from the validation harness
CREATE TABLE IF NOT EXISTS validations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    judge_model TEXT NOT NULL,
    score REAL NOT NULL,
    verdict TEXT NOT NULL,
    explanation TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
);
-- Indexes
CREATE INDEX IF NOT EXISTS idx_connections_owner ON connections (owner_user_id);
CREATE INDEX IF NOT EXISTS idx_agents_owner ON agents (owner_user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_user_agent ON chat_sessions (user_id, agent_id);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (chat_session_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_message ON message_embeddings (message_id);
CREATE INDEX IF NOT EXISTS idx_runs_user_created ON runs (user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_agent ON runs (agent_id);
CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs (acked, locked_until);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failure,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::parse("exploded").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failure.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failure));
    }

    #[test]
    fn test_forbidden_transitions() {
        // Cancelled is only reachable from queued.
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        // Terminal states never move.
        for terminal in [RunStatus::Success, RunStatus::Failure, RunStatus::Cancelled] {
            for next in [
                RunStatus::Queued,
                RunStatus::Running,
                RunStatus::Success,
                RunStatus::Failure,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Success));
    }

    #[test]
    fn test_session_status_parse() {
        assert_eq!(SessionStatus::parse("archived"), SessionStatus::Archived);
        assert_eq!(SessionStatus::parse("active"), SessionStatus::Active);
        assert_eq!(SessionStatus::parse("garbage"), SessionStatus::Active);
    }
}
