//! Embedded SQLite engine for uploaded datasets.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::connection::{ColumnInfo, Rows};
use crate::error::{CoreError, CoreResult};

#[derive(Debug)]
pub struct SqliteEngine {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteEngine {
    /// Opens the dataset file under the shared datasets directory. The
    /// dataset id is a bare name; path traversal is rejected.
    pub fn open(datasets_dir: &Path, dataset_id: &str) -> CoreResult<Self> {
        if dataset_id.contains('/') || dataset_id.contains("..") {
            return Err(CoreError::InvalidInput(format!("invalid dataset id: {}", dataset_id)));
        }
        let db_path = datasets_dir.join(format!("{}.db", dataset_id));
        if !db_path.exists() {
            return Err(CoreError::Connect(format!("dataset not found: {}", dataset_id)));
        }

        let manager = SqliteConnectionManager::file(&db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| CoreError::Connect(format!("sqlite pool: {}", e)))?;

        debug!("sqlite engine opened: {}", db_path.display());
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> CoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| CoreError::Connect(format!("sqlite pool: {}", e)))?;
        Ok(Self { pool })
    }

    fn conn(&self) -> CoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(CoreError::from)
    }

    pub fn list_tables(&self) -> CoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    pub fn columns(&self, table: &str) -> CoreResult<Vec<ColumnInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnInfo { name: row.get(0)?, data_type: row.get(1)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if columns.is_empty() {
            return Err(CoreError::Schema(format!("table not found: {}", table)));
        }
        Ok(columns)
    }

    pub fn execute(&self, sql: &str) -> CoreResult<Rows> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| CoreError::Query(e.to_string()))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let column_count = columns.len();

        let mut result = Rows { columns, rows: Vec::new() };
        let mut rows = stmt.query([]).map_err(|e| CoreError::Query(e.to_string()))?;
        while let Some(row) = rows.next().map_err(|e| CoreError::Query(e.to_string()))? {
            let mut out = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = match row.get_ref(i)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) => Value::from(v),
                    ValueRef::Real(v) => Value::from(v),
                    ValueRef::Text(v) => Value::String(String::from_utf8_lossy(v).into_owned()),
                    ValueRef::Blob(v) => Value::String(format!("<{} bytes>", v.len())),
                };
                out.push(value);
            }
            result.rows.push(out);
        }
        Ok(result)
    }
}
