//! Postgres [`RowStore`] adapter.
//!
//! NOTE: All statements are built at runtime with quoted identifiers because the
//! table and column names come from schema discovery, not from compile-time
//! knowledge. Rows travel as JSONB (`to_jsonb` out, `jsonb_populate_record` in)
//! so values keep the column types Postgres already knows.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, info, warn};

use crate::store::{value_text, Filter, Query, Row, RowStore, StoreError};

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/portal".to_string()),
            max_connections: std::env::var("DATABASE_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// sqlx-backed row store.
#[derive(Clone)]
pub struct PgRowStore {
    pool: PgPool,
}

impl PgRowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool using `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        info!(
            "Connecting to database: {}",
            mask_database_url(&config.database_url)
        );

        let mut options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout);
        if let Some(idle) = config.idle_timeout {
            options = options.idle_timeout(idle);
        }

        let pool = options
            .connect(&config.database_url)
            .await
            .inspect_err(|e| warn!("Failed to connect to database: {}", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Quote an identifier for interpolation into SQL.
fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render `filters` as a WHERE clause over alias `t`, binding from `$first`.
fn where_clause(filters: &[Filter], first: usize) -> (String, Vec<Option<String>>) {
    if filters.is_empty() {
        return (String::new(), Vec::new());
    }
    let mut parts = Vec::with_capacity(filters.len());
    let mut binds = Vec::new();
    for filter in filters {
        match filter {
            Filter::Eq { column, value } => {
                binds.push(value_text(value));
                parts.push(format!(
                    "t.{}::text = ${}",
                    ident(column),
                    first + binds.len() - 1
                ));
            }
            Filter::NotNull { column } => parts.push(format!("t.{} IS NOT NULL", ident(column))),
        }
    }
    (format!(" WHERE {}", parts.join(" AND ")), binds)
}

fn column_list(row: &Row) -> (String, String) {
    let cols: Vec<String> = row.keys().map(|c| ident(c)).collect();
    let picks: Vec<String> = row.keys().map(|c| format!("r.{}", ident(c))).collect();
    (cols.join(", "), picks.join(", "))
}

/// Extract the first double-quoted token from a Postgres error message.
fn quoted_name(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let end = start + message[start..].find('"')?;
    Some(message[start..end].to_string())
}

fn map_err(table: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        let message = db.message().to_string();
        match db.code().as_deref() {
            Some("42P01") => {
                return StoreError::MissingTable {
                    table: table.to_string(),
                }
            }
            Some("42703") => {
                return StoreError::MissingColumn {
                    table: table.to_string(),
                    column: quoted_name(&message).unwrap_or(message),
                }
            }
            Some("23505") => {
                return StoreError::Conflict {
                    table: table.to_string(),
                    detail: message,
                }
            }
            _ => {}
        }
    }
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError> {
        let (clause, binds) = where_clause(&query.filters, 1);
        let mut sql = format!("SELECT to_jsonb(t) FROM {} AS t{}", ident(table), clause);
        if let Some(order) = &query.order_by {
            sql.push_str(&format!(" ORDER BY t.{}", ident(order)));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        debug!(%sql, "row store select");

        let mut q = sqlx::query_scalar::<_, Value>(&sql);
        for bind in binds {
            q = q.bind(bind);
        }
        let values = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err(table, e))?;
        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    async fn insert(&self, table: &str, row: &Row) -> Result<Row, StoreError> {
        let sql = if row.is_empty() {
            format!(
                "INSERT INTO {t} AS t DEFAULT VALUES RETURNING to_jsonb(t)",
                t = ident(table)
            )
        } else {
            let (cols, picks) = column_list(row);
            format!(
                "INSERT INTO {t} AS t ({cols}) SELECT {picks} \
                 FROM jsonb_populate_record(NULL::{t}, $1) AS r RETURNING to_jsonb(t)",
                t = ident(table)
            )
        };
        debug!(%sql, "row store insert");

        let value = sqlx::query_scalar::<_, Value>(&sql)
            .bind(Value::Object(row.clone()))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_err(table, e))?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Backend(format!(
                "insert into {table} returned non-object {other}"
            ))),
        }
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Row,
    ) -> Result<u64, StoreError> {
        if patch.is_empty() {
            return Ok(0);
        }
        let sets: Vec<String> = patch
            .keys()
            .map(|c| format!("{col} = r.{col}", col = ident(c)))
            .collect();
        let (clause, binds) = where_clause(filters, 2);
        let sql = format!(
            "UPDATE {t} AS t SET {sets} FROM jsonb_populate_record(NULL::{t}, $1) AS r{clause}",
            t = ident(table),
            sets = sets.join(", "),
        );
        debug!(%sql, "row store update");

        let mut q = sqlx::query(&sql).bind(Value::Object(patch.clone()));
        for bind in binds {
            q = q.bind(bind);
        }
        let result = q
            .execute(&self.pool)
            .await
            .map_err(|e| map_err(table, e))?;
        Ok(result.rows_affected())
    }

    async fn upsert(
        &self,
        table: &str,
        row: &Row,
        conflict: &[&str],
        insert_only: &[&str],
    ) -> Result<Row, StoreError> {
        let (cols, picks) = column_list(row);
        let target: Vec<String> = conflict.iter().map(|c| ident(c)).collect();
        let mut updates: Vec<String> = row
            .keys()
            .filter(|c| !conflict.contains(&c.as_str()) && !insert_only.contains(&c.as_str()))
            .map(|c| format!("{col} = EXCLUDED.{col}", col = ident(c)))
            .collect();
        if updates.is_empty() {
            // DO NOTHING would suppress RETURNING on conflict.
            updates = target
                .iter()
                .map(|col| format!("{col} = EXCLUDED.{col}"))
                .collect();
        }
        let sql = format!(
            "INSERT INTO {t} AS t ({cols}) SELECT {picks} \
             FROM jsonb_populate_record(NULL::{t}, $1) AS r \
             ON CONFLICT ({target}) DO UPDATE SET {updates} RETURNING to_jsonb(t)",
            t = ident(table),
            target = target.join(", "),
            updates = updates.join(", "),
        );
        debug!(%sql, "row store upsert");

        let value = sqlx::query_scalar::<_, Value>(&sql)
            .bind(Value::Object(row.clone()))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_err(table, e))?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Backend(format!(
                "upsert into {table} returned non-object {other}"
            ))),
        }
    }
}

/// Mask the password component of a database URL for logging.
fn mask_database_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        let mut masked = parsed.clone();
        if parsed.password().is_some() {
            let _ = masked.set_password(Some("***"));
        }
        masked.to_string()
    } else {
        // Unparseable: keep only the ends
        let head = url.get(..10);
        let tail = url.len().checked_sub(10).and_then(|i| url.get(i..));
        match (head, tail) {
            (Some(head), Some(tail)) if url.len() > 20 => format!("{head}***{tail}"),
            _ => "***".to_string(),
        }
    }
}
