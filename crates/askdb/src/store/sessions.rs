//! Chat sessions and their ordered messages.
//!
//! `capture_exchange` is the single writer of message rows. It runs in
//! an immediate transaction so concurrent runs on the same session
//! serialise there, keeping `sequence_order` dense and gap-free.

use chrono::{Duration, Utc};
use rusqlite::{params, Row};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::store::schema::{ChatSession, MessageRecord, SessionStatus};
use crate::store::{now_rfc3339, parse_datetime_or_now, DbPool, Pagination};

/// Window within which an active session for the same (user, agent)
/// pair is reused instead of synthesising a new one.
const SESSION_REUSE_HOURS: i64 = 24;

/// Pool size for the lexical fallback scan.
const LEXICAL_SCAN_LIMIT: i64 = 500;

pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> CoreResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        self.pool.get().map_err(CoreError::from)
    }

    pub fn create_session(
        &self,
        user_id: i64,
        agent_id: i64,
        title: &str,
    ) -> CoreResult<ChatSession> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO chat_sessions
             (user_id, agent_id, title, created_at, last_activity, total_messages, status)
             VALUES (?1, ?2, ?3, ?4, ?4, 0, 'active')",
            params![user_id, agent_id, title, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Created chat session {} for user {} agent {}", id, user_id, agent_id);
        self.get_session(id)?
            .ok_or_else(|| CoreError::Internal("session vanished after insert".into()))
    }

    pub fn get_session(&self, id: i64) -> CoreResult<Option<ChatSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, agent_id, title, created_at, last_activity,
                    total_messages, status, context_summary
             FROM chat_sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    /// An active session for the pair, touched within the reuse window,
    /// newest first.
    pub fn find_reusable(&self, user_id: i64, agent_id: i64) -> CoreResult<Option<i64>> {
        let cutoff = (Utc::now() - Duration::hours(SESSION_REUSE_HOURS)).to_rfc3339();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM chat_sessions
             WHERE user_id = ?1 AND agent_id = ?2 AND status = 'active'
               AND last_activity > ?3
             ORDER BY last_activity DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![user_id, agent_id, cutoff])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn touch(&self, session_id: i64) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE chat_sessions SET last_activity = ?1 WHERE id = ?2",
            params![now_rfc3339(), session_id],
        )?;
        Ok(())
    }

    pub fn update_session(
        &self,
        session_id: i64,
        title: Option<&str>,
        status: Option<SessionStatus>,
    ) -> CoreResult<()> {
        let conn = self.conn()?;
        if let Some(title) = title {
            conn.execute(
                "UPDATE chat_sessions SET title = ?1 WHERE id = ?2",
                params![title, session_id],
            )?;
        }
        if let Some(status) = status {
            conn.execute(
                "UPDATE chat_sessions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), session_id],
            )?;
        }
        Ok(())
    }

    pub fn delete_session(&self, session_id: i64) -> CoreResult<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM chat_sessions WHERE id = ?1", [session_id])? > 0)
    }

    pub fn session_owned_by(&self, session_id: i64, user_id: i64) -> CoreResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_sessions WHERE id = ?1 AND user_id = ?2",
            params![session_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_for_agent(
        &self,
        agent_id: i64,
        user_id: i64,
        page: u32,
        per_page: u32,
    ) -> CoreResult<(Vec<ChatSession>, Pagination)> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_sessions WHERE agent_id = ?1 AND user_id = ?2",
            params![agent_id, user_id],
            |row| row.get(0),
        )?;
        let pagination = Pagination::build(page, per_page, total as u64);

        let mut stmt = conn.prepare(
            "SELECT id, user_id, agent_id, title, created_at, last_activity,
                    total_messages, status, context_summary
             FROM chat_sessions WHERE agent_id = ?1 AND user_id = ?2
             ORDER BY last_activity DESC LIMIT ?3 OFFSET ?4",
        )?;
        let mut rows = stmt.query(params![
            agent_id,
            user_id,
            pagination.per_page as i64,
            pagination.offset() as i64
        ])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
        Ok((sessions, pagination))
    }

    // ===== messages =====

    /// Writes one user/assistant exchange. The immediate transaction
    /// takes the write lock before reading the current max sequence, so
    /// two concurrent captures cannot read the same max.
    pub fn capture_exchange(
        &self,
        chat_session_id: i64,
        run_id: Option<i64>,
        user_text: &str,
        assistant_text: &str,
        sql_query: Option<&str>,
    ) -> CoreResult<(i64, i64)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let max_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_order), 0) FROM messages WHERE chat_session_id = ?1",
            [chat_session_id],
            |row| row.get(0),
        )?;

        let now = now_rfc3339();
        tx.execute(
            "INSERT INTO messages
             (chat_session_id, run_id, role, content, sql_query, sequence_order, created_at)
             VALUES (?1, ?2, 'user', ?3, NULL, ?4, ?5)",
            params![chat_session_id, run_id, user_text, max_seq + 1, now],
        )?;
        let user_msg_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO messages
             (chat_session_id, run_id, role, content, sql_query, sequence_order, created_at)
             VALUES (?1, ?2, 'assistant', ?3, ?4, ?5, ?6)",
            params![chat_session_id, run_id, assistant_text, sql_query, max_seq + 2, now],
        )?;
        let assistant_msg_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE chat_sessions
             SET total_messages = total_messages + 2, last_activity = ?1
             WHERE id = ?2",
            params![now, chat_session_id],
        )?;

        tx.commit()?;
        debug!(
            "Captured exchange on session {} (seq {}, {})",
            chat_session_id,
            max_seq + 1,
            max_seq + 2
        );
        Ok((user_msg_id, assistant_msg_id))
    }

    /// Last `n` messages of a session, returned in sequence order.
    pub fn recent_messages(&self, chat_session_id: i64, n: usize) -> CoreResult<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_session_id, run_id, role, content, sql_query,
                    sequence_order, created_at, metadata
             FROM messages WHERE chat_session_id = ?1
             ORDER BY sequence_order DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![chat_session_id, n as i64])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Paginated listing, newest page first.
    pub fn list_messages(
        &self,
        chat_session_id: i64,
        page: u32,
        per_page: u32,
    ) -> CoreResult<(Vec<MessageRecord>, Pagination)> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_session_id = ?1",
            [chat_session_id],
            |row| row.get(0),
        )?;
        let pagination = Pagination::build(page, per_page, total as u64);

        let mut stmt = conn.prepare(
            "SELECT id, chat_session_id, run_id, role, content, sql_query,
                    sequence_order, created_at, metadata
             FROM messages WHERE chat_session_id = ?1
             ORDER BY sequence_order DESC LIMIT ?2 OFFSET ?3",
        )?;
        let mut rows = stmt.query(params![
            chat_session_id,
            pagination.per_page as i64,
            pagination.offset() as i64
        ])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok((messages, pagination))
    }

    pub fn get_message(&self, id: i64) -> CoreResult<Option<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_session_id, run_id, role, content, sql_query,
                    sequence_order, created_at, metadata
             FROM messages WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_message(row)?)),
            None => Ok(None),
        }
    }

    pub fn messages_by_ids(&self, ids: &[i64]) -> CoreResult<Vec<MessageRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let query = format!(
            "SELECT id, chat_session_id, run_id, role, content, sql_query,
                    sequence_order, created_at, metadata
             FROM messages WHERE id IN ({})",
            placeholders
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(ids))?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    /// Recent message pool for the lexical fallback: every message in
    /// any of the user's sessions with this agent, newest first.
    pub fn lexical_candidates(
        &self,
        user_id: i64,
        agent_id: i64,
    ) -> CoreResult<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.chat_session_id, m.run_id, m.role, m.content, m.sql_query,
                    m.sequence_order, m.created_at, m.metadata
             FROM messages m
             JOIN chat_sessions s ON m.chat_session_id = s.id
             WHERE s.user_id = ?1 AND s.agent_id = ?2
             ORDER BY m.created_at DESC, m.id DESC LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![user_id, agent_id, LEXICAL_SCAN_LIMIT])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    /// Message ids eligible for similarity search: all of the user's
    /// messages with this agent that already have an embedding.
    pub fn embedded_message_ids(&self, user_id: i64, agent_id: i64) -> CoreResult<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id FROM messages m
             JOIN chat_sessions s ON m.chat_session_id = s.id
             JOIN message_embeddings e ON e.message_id = m.id
             WHERE s.user_id = ?1 AND s.agent_id = ?2",
        )?;
        let ids = stmt
            .query_map(params![user_id, agent_id], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

fn row_to_session(row: &Row) -> CoreResult<ChatSession> {
    let status: String = row.get(7)?;
    Ok(ChatSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        agent_id: row.get(2)?,
        title: row.get(3)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(4)?),
        last_activity: parse_datetime_or_now(&row.get::<_, String>(5)?),
        total_messages: row.get(6)?,
        status: SessionStatus::parse(&status),
        context_summary: row.get(8)?,
    })
}

fn row_to_message(row: &Row) -> CoreResult<MessageRecord> {
    let metadata: Option<String> = row.get(8)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        chat_session_id: row.get(1)?,
        run_id: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        sql_query: row.get(5)?,
        sequence_order: row.get(6)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(7)?),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::agents::test_fixtures::seed_user_agent;
    use crate::store::MetaStore;

    #[test]
    fn test_capture_assigns_dense_sequence() {
        let store = MetaStore::new_in_memory().unwrap();
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();

        store
            .sessions
            .capture_exchange(session.id, None, "q1", "a1", Some("SELECT 1"))
            .unwrap();
        store.sessions.capture_exchange(session.id, None, "q2", "a2", None).unwrap();

        let messages = store.sessions.recent_messages(session.id, 10).unwrap();
        let orders: Vec<i64> = messages.iter().map(|m| m.sequence_order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4]);

        let refreshed = store.sessions.get_session(session.id).unwrap().unwrap();
        assert_eq!(refreshed.total_messages, 4);
        assert!(refreshed.last_activity >= refreshed.created_at);
    }

    #[test]
    fn test_capture_round_trip_content_and_order() {
        let store = MetaStore::new_in_memory().unwrap();
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();

        store
            .sessions
            .capture_exchange(session.id, Some(7), "how many orders?", "There are 42.", Some("SELECT COUNT(*) FROM orders"))
            .unwrap();

        let last_two = store.sessions.recent_messages(session.id, 2).unwrap();
        assert_eq!(last_two[0].role, "user");
        assert_eq!(last_two[0].content, "how many orders?");
        assert!(last_two[0].sql_query.is_none());
        assert_eq!(last_two[1].role, "assistant");
        assert_eq!(last_two[1].content, "There are 42.");
        assert_eq!(last_two[1].sql_query.as_deref(), Some("SELECT COUNT(*) FROM orders"));
        assert_eq!(last_two[1].run_id, Some(7));
    }

    #[test]
    fn test_sql_query_only_on_assistant_messages() {
        let store = MetaStore::new_in_memory().unwrap();
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        store
            .sessions
            .capture_exchange(session.id, None, "q", "a", Some("SELECT 1"))
            .unwrap();

        for message in store.sessions.recent_messages(session.id, 10).unwrap() {
            if message.sql_query.is_some() {
                assert_eq!(message.role, "assistant");
            }
        }
    }

    #[test]
    fn test_find_reusable_returns_recent_active_session() {
        let store = MetaStore::new_in_memory().unwrap();
        let (user_id, _, agent_id) = seed_user_agent(&store);

        assert!(store.sessions.find_reusable(user_id, agent_id).unwrap().is_none());
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        assert_eq!(store.sessions.find_reusable(user_id, agent_id).unwrap(), Some(session.id));

        store
            .sessions
            .update_session(session.id, None, Some(SessionStatus::Archived))
            .unwrap();
        assert!(store.sessions.find_reusable(user_id, agent_id).unwrap().is_none());
    }

    #[test]
    fn test_list_messages_newest_page_first() {
        let store = MetaStore::new_in_memory().unwrap();
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        for i in 0..3 {
            store
                .sessions
                .capture_exchange(session.id, None, &format!("q{}", i), &format!("a{}", i), None)
                .unwrap();
        }

        let (page1, pagination) = store.sessions.list_messages(session.id, 1, 4).unwrap();
        assert_eq!(pagination.total_items, 6);
        assert_eq!(pagination.total_pages, 2);
        assert!(pagination.has_next);
        assert_eq!(page1[0].sequence_order, 6);

        let (page2, _) = store.sessions.list_messages(session.id, 2, 4).unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].sequence_order, 2);
    }

    #[test]
    fn test_lexical_candidates_scoped_to_user_and_agent() {
        let store = MetaStore::new_in_memory().unwrap();
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        store.sessions.capture_exchange(session.id, None, "mine", "yes", None).unwrap();

        let (other_user, _, other_agent) = seed_user_agent(&store);
        let other_session =
            store.sessions.create_session(other_user, other_agent, "t2").unwrap();
        store
            .sessions
            .capture_exchange(other_session.id, None, "theirs", "no", None)
            .unwrap();

        let candidates = store.sessions.lexical_candidates(user_id, agent_id).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|m| m.chat_session_id == session.id));
    }

    #[test]
    fn test_concurrent_captures_keep_sequence_dense() {
        // File-backed store so two threads hold real, separate
        // connections and contend on the write lock.
        let path = std::env::temp_dir().join(format!(
            "askdb-seq-test-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let store = std::sync::Arc::new(MetaStore::new(path.to_str().unwrap()).unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();

        let mut handles = Vec::new();
        for t in 0..4 {
            let store = store.clone();
            let session_id = session.id;
            handles.push(std::thread::spawn(move || {
                for i in 0..5 {
                    store
                        .sessions
                        .capture_exchange(
                            session_id,
                            None,
                            &format!("q{}-{}", t, i),
                            &format!("a{}-{}", t, i),
                            None,
                        )
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let messages = store.sessions.recent_messages(session.id, 100).unwrap();
        let orders: Vec<i64> = messages.iter().map(|m| m.sequence_order).collect();
        let expected: Vec<i64> = (1..=40).collect();
        assert_eq!(orders, expected);
        let refreshed = store.sessions.get_session(session.id).unwrap().unwrap();
        assert_eq!(refreshed.total_messages, 40);

        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_delete_session_cascades_messages() {
        let store = MetaStore::new_in_memory().unwrap();
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let session = store.sessions.create_session(user_id, agent_id, "t").unwrap();
        let (user_msg, _) =
            store.sessions.capture_exchange(session.id, None, "q", "a", None).unwrap();

        assert!(store.sessions.delete_session(session.id).unwrap());
        assert!(store.sessions.get_message(user_msg).unwrap().is_none());
    }
}
