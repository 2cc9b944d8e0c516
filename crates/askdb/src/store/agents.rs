//! Users, connections, and agents. The API facade owns their CRUD; the
//! core needs ownership checks, payload access, and the mutation hooks
//! that bump versions for cache and engine invalidation.

use rusqlite::{params, Row};
use serde_json::Value;
use tracing::info;

use crate::connection::ConnectionKind;
use crate::error::{CoreError, CoreResult};
use crate::store::schema::{AgentRecord, ConnectionRecord, User};
use crate::store::{now_rfc3339, parse_datetime_or_now, DbPool};

pub struct AgentStore {
    pool: DbPool,
}

/// Agent creation parameters, facade-shaped.
#[derive(Debug, Clone)]
pub struct NewAgent {
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
}

impl Default for NewAgent {
    fn default() -> Self {
        Self {
            name: "agent".to_string(),
            connection_id: 0,
            model_id: "gpt-4o-mini".to_string(),
            top_k: 10,
            included_tables: "*".to_string(),
            advanced: false,
            processing_enabled: false,
            refinement_enabled: false,
            single_table_mode: false,
            selected_table: None,
        }
    }
}

impl AgentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> CoreResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        self.pool.get().map_err(CoreError::from)
    }

    // ===== users =====

    pub fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        display_name: &str,
    ) -> CoreResult<User> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO users (email, password_hash, display_name, active, created_at)
             VALUES (?1, ?2, ?3, TRUE, ?4)",
            params![email, password_hash, display_name, now],
        )?;
        let id = conn.last_insert_rowid();
        self.get_user(id)?
            .ok_or_else(|| CoreError::Internal("user vanished after insert".into()))
    }

    pub fn get_user(&self, id: i64) -> CoreResult<Option<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, email, password_hash, display_name, active, created_at
             FROM users WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_user(row)?)),
            None => Ok(None),
        }
    }

    // ===== connections =====

    pub fn create_connection(
        &self,
        owner_user_id: i64,
        kind: ConnectionKind,
        payload: &Value,
    ) -> CoreResult<ConnectionRecord> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO connections (owner_user_id, kind, payload, version, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![owner_user_id, kind.as_str(), payload.to_string(), now],
        )?;
        let id = conn.last_insert_rowid();
        self.get_connection(id)?
            .ok_or_else(|| CoreError::Internal("connection vanished after insert".into()))
    }

    pub fn get_connection(&self, id: i64) -> CoreResult<Option<ConnectionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_user_id, kind, payload, version, created_at
             FROM connections WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_connection(row)?)),
            None => Ok(None),
        }
    }

    /// Replaces the payload and bumps the version, orphaning any pooled
    /// engines keyed on the previous version. Callers must also
    /// invalidate the agents' answer caches.
    pub fn update_connection_payload(
        &self,
        id: i64,
        kind: ConnectionKind,
        payload: &Value,
    ) -> CoreResult<ConnectionRecord> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE connections SET kind = ?1, payload = ?2, version = version + 1 WHERE id = ?3",
            params![kind.as_str(), payload.to_string(), id],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound { category: "connection", id: id.to_string() });
        }
        info!("Connection {} mutated, version bumped", id);
        self.get_connection(id)?
            .ok_or_else(|| CoreError::Internal("connection vanished after update".into()))
    }

    pub fn delete_connection(&self, id: i64) -> CoreResult<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM connections WHERE id = ?1", [id])? > 0)
    }

    // ===== agents =====

    pub fn create_agent(&self, owner_user_id: i64, new_agent: NewAgent) -> CoreResult<AgentRecord> {
        if new_agent.top_k < 1 {
            return Err(CoreError::InvalidInput("top_k must be >= 1".into()));
        }
        if new_agent.single_table_mode && new_agent.selected_table.as_deref().unwrap_or("").is_empty() {
            return Err(CoreError::InvalidInput(
                "single_table_mode requires selected_table".into(),
            ));
        }
        let connection = self
            .get_connection(new_agent.connection_id)?
            .ok_or(CoreError::NotFound { category: "connection", id: new_agent.connection_id.to_string() })?;
        if connection.owner_user_id != owner_user_id {
            return Err(CoreError::InvalidInput("connection not owned by user".into()));
        }

        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO agents
             (owner_user_id, name, connection_id, model_id, top_k, included_tables,
              advanced, processing_enabled, refinement_enabled, single_table_mode,
              selected_table, schema_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12)",
            params![
                owner_user_id,
                new_agent.name,
                new_agent.connection_id,
                new_agent.model_id,
                new_agent.top_k,
                new_agent.included_tables,
                new_agent.advanced,
                new_agent.processing_enabled,
                new_agent.refinement_enabled,
                new_agent.single_table_mode,
                new_agent.selected_table,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.get_agent(id)?
            .ok_or_else(|| CoreError::Internal("agent vanished after insert".into()))
    }

    pub fn get_agent(&self, id: i64) -> CoreResult<Option<AgentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_user_id, name, connection_id, model_id, top_k, included_tables,
                    advanced, processing_enabled, refinement_enabled, single_table_mode,
                    selected_table, schema_version, created_at
             FROM agents WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_agent(row)?)),
            None => Ok(None),
        }
    }

    pub fn user_owns_agent(&self, user_id: i64, agent_id: i64) -> CoreResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE id = ?1 AND owner_user_id = ?2",
            params![agent_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Bumps the schema snapshot version, which changes every cache
    /// fingerprint computed for the agent from now on.
    pub fn bump_schema_version(&self, agent_id: i64) -> CoreResult<i64> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE agents SET schema_version = schema_version + 1 WHERE id = ?1",
            [agent_id],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound { category: "agent", id: agent_id.to_string() });
        }
        let version: i64 = conn.query_row(
            "SELECT schema_version FROM agents WHERE id = ?1",
            [agent_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Table-scope mutation; bumps the schema version so stale cached
    /// answers can never match again.
    pub fn update_included_tables(&self, agent_id: i64, included: &str) -> CoreResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE agents SET included_tables = ?1, schema_version = schema_version + 1
             WHERE id = ?2",
            params![included, agent_id],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound { category: "agent", id: agent_id.to_string() });
        }
        Ok(())
    }

    pub fn agents_for_connection(&self, connection_id: i64) -> CoreResult<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM agents WHERE connection_id = ?1")?;
        let ids = stmt
            .query_map([connection_id], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

fn row_to_user(row: &Row) -> CoreResult<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        display_name: row.get(3)?,
        active: row.get(4)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(5)?),
    })
}

fn row_to_connection(row: &Row) -> CoreResult<ConnectionRecord> {
    let kind_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    Ok(ConnectionRecord {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        kind: ConnectionKind::parse(&kind_str)?,
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| CoreError::Db(format!("payload JSON: {}", e)))?,
        version: row.get(4)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(5)?),
    })
}

fn row_to_agent(row: &Row) -> CoreResult<AgentRecord> {
    Ok(AgentRecord {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        name: row.get(2)?,
        connection_id: row.get(3)?,
        model_id: row.get(4)?,
        top_k: row.get(5)?,
        included_tables: row.get(6)?,
        advanced: row.get(7)?,
        processing_enabled: row.get(8)?,
        refinement_enabled: row.get(9)?,
        single_table_mode: row.get(10)?,
        selected_table: row.get(11)?,
        schema_version: row.get(12)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(13)?),
    })
}
