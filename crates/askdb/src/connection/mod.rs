//! Per-connection database abstraction.
//!
//! One `Engine` per (connection id, version), pooled in the object
//! registry. Metadata is never fetched through driver-level reflection:
//! each dialect issues its own catalog statements (`sqlite_master`,
//! `information_schema`, `system.tables`), because ClickHouse has no
//! `information_schema` and a reflective driver call against it fails
//! with "Unknown table expression identifier" noise.

pub mod clickhouse;
pub mod postgres;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Supported target database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Sqlite,
    Postgres,
    ClickHouse,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Sqlite => "sqlite",
            ConnectionKind::Postgres => "postgres",
            ConnectionKind::ClickHouse => "clickhouse",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "sqlite" => Ok(ConnectionKind::Sqlite),
            "postgres" => Ok(ConnectionKind::Postgres),
            "clickhouse" => Ok(ConnectionKind::ClickHouse),
            other => Err(CoreError::InvalidInput(format!("unknown connection kind: {}", other))),
        }
    }

    /// Identifier quote character for interpolated table names.
    pub fn quote_char(&self) -> char {
        match self {
            ConnectionKind::ClickHouse => '`',
            ConnectionKind::Postgres | ConnectionKind::Sqlite => '"',
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific connection payloads, exactly one shape per kind.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ConnectionPayload {
    Sqlite {
        dataset_id: String,
    },
    Postgres {
        host: String,
        port: u16,
        database: String,
        username: String,
        password: String,
    },
    ClickHouse {
        host: String,
        /// Defaults to 8123, or 8443 when `secure` is set. An explicit
        /// port is always respected; `secure` never switches it.
        port: Option<u16>,
        database: String,
        username: String,
        password: String,
        secure: bool,
    },
}

impl ConnectionPayload {
    /// Deserialises the shape the `kind` dictates. The kind is stored
    /// next to the payload, so the payload itself is not self-tagging.
    pub fn parse(kind: ConnectionKind, raw: &Value) -> CoreResult<Self> {
        fn bad(e: impl std::fmt::Display) -> CoreError {
            CoreError::InvalidInput(format!("bad connection payload: {}", e))
        }

        match kind {
            ConnectionKind::Sqlite => {
                #[derive(Deserialize)]
                struct Payload {
                    dataset_id: String,
                }
                let p: Payload = serde_json::from_value(raw.clone()).map_err(bad)?;
                Ok(ConnectionPayload::Sqlite { dataset_id: p.dataset_id })
            }
            ConnectionKind::Postgres => {
                #[derive(Deserialize)]
                struct Payload {
                    host: String,
                    #[serde(default = "Payload::default_port")]
                    port: u16,
                    database: String,
                    username: String,
                    password: String,
                }
                impl Payload {
                    fn default_port() -> u16 {
                        5432
                    }
                }
                let p: Payload = serde_json::from_value(raw.clone()).map_err(bad)?;
                Ok(ConnectionPayload::Postgres {
                    host: p.host,
                    port: p.port,
                    database: p.database,
                    username: p.username,
                    password: p.password,
                })
            }
            ConnectionKind::ClickHouse => {
                #[derive(Deserialize)]
                struct Payload {
                    host: String,
                    #[serde(default)]
                    port: Option<u16>,
                    database: String,
                    username: String,
                    password: String,
                    #[serde(default)]
                    secure: bool,
                }
                let p: Payload = serde_json::from_value(raw.clone()).map_err(bad)?;
                Ok(ConnectionPayload::ClickHouse {
                    host: p.host,
                    port: p.port,
                    database: p.database,
                    username: p.username,
                    password: p.password,
                    secure: p.secure,
                })
            }
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            ConnectionPayload::Sqlite { .. } => ConnectionKind::Sqlite,
            ConnectionPayload::Postgres { .. } => ConnectionKind::Postgres,
            ConnectionPayload::ClickHouse { .. } => ConnectionKind::ClickHouse,
        }
    }
}

/// Column name + dialect type, as reported by the catalog queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// A bounded, fully materialised result set. Execution never streams;
/// the row cap is applied before rows reach the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// Plain-text rendering used inside prompts (header row, then one
    /// pipe-separated line per row).
    pub fn render_text(&self) -> String {
        let mut out = self.columns.join(" | ");
        for row in &self.rows {
            out.push('\n');
            let cells: Vec<String> = row
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    Value::Null => "NULL".to_string(),
                    other => other.to_string(),
                })
                .collect();
            out.push_str(&cells.join(" | "));
        }
        out
    }
}

/// Quotes an identifier with the dialect quote character, doubling any
/// embedded quotes.
pub fn quote_ident(kind: ConnectionKind, ident: &str) -> String {
    let q = kind.quote_char();
    let escaped = ident.replace(q, &format!("{}{}", q, q));
    format!("{}{}{}", q, escaped, q)
}

/// Filters table names against an agent's `included_tables` setting:
/// `*` keeps everything, otherwise a comma-separated list of names where
/// each entry may carry `*` wildcards.
pub fn filter_tables(tables: Vec<String>, included: &str) -> Vec<String> {
    let included = included.trim();
    if included.is_empty() || included == "*" {
        return tables;
    }
    let patterns: Vec<regex::Regex> = included
        .split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            let escaped = regex::escape(p).replace("\\*", ".*");
            regex::Regex::new(&format!("^{}$", escaped)).ok()
        })
        .collect();
    tables
        .into_iter()
        .filter(|t| patterns.iter().any(|re| re.is_match(t)))
        .collect()
}

/// Outcome of a connection probe; `message` carries masked DSNs only.
/// The wire field for the kind keeps the legacy name the frontend
/// already parses.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub valid: bool,
    pub message: String,
    #[serde(rename = "tipo")]
    pub kind: ConnectionKind,
}

/// One open engine. Dialect differences stay behind this enum; the
/// pipeline only ever sees `Rows` and table/column names.
pub enum Engine {
    Sqlite(sqlite::SqliteEngine),
    Postgres(postgres::PostgresEngine),
    ClickHouse(clickhouse::ClickHouseEngine),
}

impl Engine {
    /// Opens an engine for the payload, bounded by `connect_timeout`.
    pub async fn open(
        payload: &ConnectionPayload,
        datasets_dir: &Path,
        connect_timeout: Duration,
    ) -> CoreResult<Engine> {
        let opened = tokio::time::timeout(connect_timeout, async {
            match payload {
                ConnectionPayload::Sqlite { dataset_id } => {
                    sqlite::SqliteEngine::open(datasets_dir, dataset_id).map(Engine::Sqlite)
                }
                ConnectionPayload::Postgres { host, port, database, username, password } => {
                    postgres::PostgresEngine::open(host, *port, database, username, password)
                        .await
                        .map(Engine::Postgres)
                }
                ConnectionPayload::ClickHouse {
                    host,
                    port,
                    database,
                    username,
                    password,
                    secure,
                } => clickhouse::ClickHouseEngine::open(
                    host, *port, database, username, password, *secure,
                )
                .await
                .map(Engine::ClickHouse),
            }
        })
        .await;

        match opened {
            Ok(result) => result,
            Err(_) => Err(CoreError::Connect(format!(
                "handshake did not complete within {:?}",
                connect_timeout
            ))),
        }
    }

    pub fn dialect(&self) -> ConnectionKind {
        match self {
            Engine::Sqlite(_) => ConnectionKind::Sqlite,
            Engine::Postgres(_) => ConnectionKind::Postgres,
            Engine::ClickHouse(_) => ConnectionKind::ClickHouse,
        }
    }

    pub fn quote_ident(&self, ident: &str) -> String {
        quote_ident(self.dialect(), ident)
    }

    pub async fn list_tables(&self) -> CoreResult<Vec<String>> {
        match self {
            Engine::Sqlite(e) => e.list_tables(),
            Engine::Postgres(e) => e.list_tables().await,
            Engine::ClickHouse(e) => e.list_tables().await,
        }
    }

    pub async fn columns(&self, table: &str) -> CoreResult<Vec<ColumnInfo>> {
        match self {
            Engine::Sqlite(e) => e.columns(table),
            Engine::Postgres(e) => e.columns(table).await,
            Engine::ClickHouse(e) => e.columns(table).await,
        }
    }

    pub async fn sample(&self, table: &str, n: usize) -> CoreResult<Rows> {
        let sql = format!("SELECT * FROM {} LIMIT {}", self.quote_ident(table), n);
        self.execute(&sql, Some(n)).await
    }

    pub async fn execute(&self, sql: &str, limit_rows: Option<usize>) -> CoreResult<Rows> {
        let mut rows = match self {
            Engine::Sqlite(e) => e.execute(sql)?,
            Engine::Postgres(e) => e.execute(sql).await?,
            Engine::ClickHouse(e) => e.execute(sql).await?,
        };
        if let Some(limit) = limit_rows {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    /// Opens and issues a trivial statement, reporting a masked outcome.
    pub async fn probe(
        payload: &ConnectionPayload,
        datasets_dir: &Path,
        connect_timeout: Duration,
    ) -> ProbeResult {
        let kind = payload.kind();
        match Engine::open(payload, datasets_dir, connect_timeout).await {
            Ok(engine) => match engine.execute("SELECT 1", Some(1)).await {
                Ok(_) => ProbeResult {
                    valid: true,
                    message: format!("{} connection ok", kind),
                    kind,
                },
                Err(e) => ProbeResult { valid: false, message: e.to_string(), kind },
            },
            Err(e) => ProbeResult { valid: false, message: e.to_string(), kind },
        }
    }
}
