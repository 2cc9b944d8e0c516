//! PostgreSQL engine over tokio-postgres.
//!
//! Generated SQL goes through the simple query protocol so arbitrary
//! column types come back as text without per-type decoding.

use serde_json::Value;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::connection::{ColumnInfo, Rows};
use crate::error::{mask_dsn, CoreError, CoreResult};

pub struct PostgresEngine {
    client: Client,
    schema: String,
}

impl PostgresEngine {
    pub async fn open(
        host: &str,
        port: u16,
        database: &str,
        username: &str,
        password: &str,
    ) -> CoreResult<Self> {
        let dsn = format!(
            "postgresql://{}:{}@{}:{}/{}",
            username, password, host, port, database
        );
        let masked = mask_dsn(&dsn);

        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .dbname(database)
            .user(username)
            .password(password);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| CoreError::Connect(format!("{}: {}", masked, e)))?;

        // The connection future drives the socket; it ends when the
        // client is dropped.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("postgres connection closed: {}", e);
            }
        });

        let schema = client
            .query_one("SELECT current_schema()", &[])
            .await
            .map_err(|e| CoreError::Connect(format!("{}: {}", masked, e)))?
            .get::<_, String>(0);

        debug!("postgres engine opened: {} (schema {})", masked, schema);
        Ok(Self { client, schema })
    }

    pub async fn list_tables(&self) -> CoreResult<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[&self.schema],
            )
            .await
            .map_err(|e| CoreError::Schema(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    pub async fn columns(&self, table: &str) -> CoreResult<Vec<ColumnInfo>> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&self.schema, &table],
            )
            .await
            .map_err(|e| CoreError::Schema(e.to_string()))?;
        if rows.is_empty() {
            return Err(CoreError::Schema(format!("table not found: {}", table)));
        }
        Ok(rows
            .iter()
            .map(|r| ColumnInfo { name: r.get(0), data_type: r.get(1) })
            .collect())
    }

    pub async fn execute(&self, sql: &str) -> CoreResult<Rows> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| CoreError::Query(e.to_string()))?;

        let mut result = Rows::default();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if result.columns.is_empty() {
                    result.columns =
                        row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let values = (0..row.len())
                    .map(|i| text_to_json(row.get(i)))
                    .collect();
                result.rows.push(values);
            }
        }
        Ok(result)
    }
}

/// Simple-protocol cells arrive as text; recover JSON numbers and
/// booleans where the text is unambiguous.
fn text_to_json(cell: Option<&str>) -> Value {
    match cell {
        None => Value::Null,
        Some("t") => Value::Bool(true),
        Some("f") => Value::Bool(false),
        Some(text) => {
            // Leading zeroes mean an identifier-like value (postal codes,
            // account numbers), not a number.
            let zero_padded = text.len() > 1 && text.starts_with('0') && !text.starts_with("0.");
            if !zero_padded {
                if let Ok(n) = text.parse::<i64>() {
                    return Value::from(n);
                }
                if let Ok(n) = text.parse::<f64>() {
                    return Value::from(n);
                }
            }
            Value::String(text.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_to_json_scalars() {
        assert_eq!(text_to_json(None), Value::Null);
        assert_eq!(text_to_json(Some("t")), Value::Bool(true));
        assert_eq!(text_to_json(Some("f")), Value::Bool(false));
        assert_eq!(text_to_json(Some("42")), Value::from(42));
        assert_eq!(text_to_json(Some("4.5")), Value::from(4.5));
        assert_eq!(text_to_json(Some("hello")), Value::from("hello"));
    }

    #[test]
    fn test_text_to_json_keeps_leading_zero_strings() {
        assert_eq!(text_to_json(Some("007")), Value::from("007"));
        assert_eq!(text_to_json(Some("0.5")), Value::from(0.5));
        assert_eq!(text_to_json(Some("0")), Value::from(0));
    }
}
