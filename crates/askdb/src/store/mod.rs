//! Metadata store: SQLite-backed persistence for users, connections,
//! agents, chat sessions, messages, runs, and the job queue.

pub mod agents;
pub mod runs;
pub mod schema;
pub mod sessions;

pub use agents::{AgentStore, NewAgent};
pub use runs::{RunFilters, RunOutcome, RunStore};
pub use schema::*;
pub use sessions::SessionStore;

use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::CoreResult;

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;

pub struct MetaStore {
    pub agents: AgentStore,
    pub sessions: SessionStore,
    pub runs: RunStore,
    pool: DbPool,
}

impl MetaStore {
    pub fn new(database_url: &str) -> CoreResult<Self> {
        if database_url == ":memory:" {
            return Self::new_in_memory();
        }
        let db_path = Path::new(database_url);
        info!("Opening metadata database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::CoreError::Db(e.to_string()))?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| crate::error::CoreError::Db(format!("pool: {}", e)))?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }

        info!("Metadata database initialized");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// In-memory store for tests. A single pooled connection keeps every
    /// store looking at the same database.
    pub fn new_in_memory() -> CoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| crate::error::CoreError::Db(format!("pool: {}", e)))?;
        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: DbPool) -> Self {
        Self {
            agents: AgentStore::new(pool.clone()),
            sessions: SessionStore::new(pool.clone()),
            runs: RunStore::new(pool.clone()),
            pool,
        }
    }

    /// Shared pool for collaborators that keep their own statements
    /// (broker, embedding store).
    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

pub(crate) fn parse_datetime_or_now(datetime_str: &str) -> DateTime<Utc> {
    parse_datetime_safe(datetime_str).unwrap_or_else(|| {
        tracing::warn!("Failed to parse timestamp: {}", datetime_str);
        Utc::now()
    })
}

/// Shared pagination maths for list endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn build(page: u32, per_page: u32, total_items: u64) -> Self {
        let per_page = per_page.clamp(1, 100);
        let page = page.max(1);
        let total_pages = total_items.div_ceil(per_page as u64).max(1);
        Self {
            page,
            per_page,
            total_items,
            total_pages,
            has_next: (page as u64) < total_pages,
            has_prev: page > 1,
        }
    }

    pub fn offset(&self) -> u32 {
        (self.page - 1) * self.per_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime_rfc3339() {
        let dt = parse_datetime_safe("2026-01-15T10:30:00+00:00").unwrap();
        assert_eq!(dt.timezone(), Utc);
    }

    #[test]
    fn test_parse_datetime_naive_formats() {
        assert!(parse_datetime_safe("2026-01-15 10:30:00").is_some());
        assert!(parse_datetime_safe("2026-01-15 10:30:00.123").is_some());
        assert!(parse_datetime_safe("not a date").is_none());
    }

    #[test]
    fn test_pagination_build() {
        let p = Pagination::build(2, 10, 35);
        assert_eq!(p.total_pages, 4);
        assert!(p.has_next);
        assert!(p.has_prev);
        assert_eq!(p.offset(), 10);
    }

    #[test]
    fn test_pagination_clamps_per_page() {
        let p = Pagination::build(1, 500, 10);
        assert_eq!(p.per_page, 100);
        let p = Pagination::build(0, 0, 0);
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, 1);
        assert_eq!(p.total_pages, 1);
        assert!(!p.has_next);
    }

    #[test]
    fn test_store_opens_in_memory() {
        let store = MetaStore::new_in_memory().unwrap();
        let conn = store.pool().get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
