//! Prompt table access. `PgPromptStore` holds one connection and one
//! transaction for the lifetime of a stage.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pdl_core::{DatasetRow, PromptRecord, TableName, CATEGORY_MAX_LEN};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to postgres at {host}:{port}/{database}: {source}")]
    Connect {
        host: String,
        port: u16,
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} on table {table}: {source}")]
    Query {
        operation: &'static str,
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} of the run transaction: {source}")]
    Transaction {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("store session is closed")]
    Closed,
}

/// Postgres coordinates, in the positional order `[host, database, user, password, port]`.
#[derive(Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectionParams {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            user: user.into(),
            password: password.into(),
            port,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// `POSTGRES_HOST`, `POSTGRES_DB`, `POSTGRES_USER`, `POSTGRES_PWD`, `POSTGRES_PORT`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let port = match lookup("POSTGRES_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("parsing POSTGRES_PORT={raw:?}"))?,
            None => 5432,
        };
        Ok(Self::new(
            var("POSTGRES_HOST", "postgres"),
            var("POSTGRES_DB", "airflow"),
            var("POSTGRES_USER", "airflow"),
            var("POSTGRES_PWD", "airflow"),
            port,
        ))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
    }
}

/// Operations the writer and verifier need from a prompt table.
///
/// All calls made between two `commit`/`rollback` calls belong to one
/// transaction and see each other's writes.
#[async_trait]
pub trait PromptStore: Send {
    /// `CREATE TABLE IF NOT EXISTS`; an existing table is not an error.
    async fn create_table(&mut self, table: &TableName) -> Result<(), StoreError>;
    async fn count_prompt(&mut self, table: &TableName, prompt: &str) -> Result<i64, StoreError>;
    async fn insert_prompt(&mut self, table: &TableName, row: &DatasetRow) -> Result<(), StoreError>;
    async fn fetch_all(&mut self, table: &TableName) -> Result<Vec<PromptRecord>, StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
    /// Release the connection. Uncommitted work is discarded.
    async fn close(&mut self);
}

pub fn create_table_sql(table: &TableName) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (id SERIAL PRIMARY KEY, prompt TEXT, category VARCHAR({CATEGORY_MAX_LEN}))"
    )
}

pub fn count_prompt_sql(table: &TableName) -> String {
    format!("SELECT COUNT(*) FROM {table} WHERE prompt = $1")
}

pub fn insert_prompt_sql(table: &TableName) -> String {
    format!("INSERT INTO {table} (prompt, category) VALUES ($1, $2)")
}

pub fn select_all_sql(table: &TableName) -> String {
    format!("SELECT id, prompt, category FROM {table}")
}

pub struct PgPromptStore {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgPromptStore {
    /// Open a single-connection pool and begin the run transaction.
    pub async fn connect(params: &ConnectionParams) -> Result<Self, StoreError> {
        let connect_err = |source: sqlx::Error| StoreError::Connect {
            host: params.host.clone(),
            port: params.port,
            database: params.database.clone(),
            source,
        };

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(params.connect_timeout)
            .connect_with(params.connect_options())
            .await
            .map_err(connect_err)?;
        let tx = pool.begin().await.map_err(connect_err)?;

        info!(host = %params.host, database = %params.database, "postgres server connection is successful");
        Ok(Self { pool, tx: Some(tx) })
    }

    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Closed)
    }
}

fn query_err(operation: &'static str, table: &TableName) -> impl FnOnce(sqlx::Error) -> StoreError {
    let table = table.to_string();
    move |source| StoreError::Query {
        operation,
        table,
        source,
    }
}

#[async_trait]
impl PromptStore for PgPromptStore {
    async fn create_table(&mut self, table: &TableName) -> Result<(), StoreError> {
        let tx = self.tx()?;
        // Savepoint keeps the run transaction usable when creation fails.
        let mut savepoint = Connection::begin(&mut **tx)
            .await
            .map_err(query_err("create table", table))?;
        sqlx::query(&create_table_sql(table))
            .execute(&mut *savepoint)
            .await
            .map_err(query_err("create table", table))?;
        savepoint
            .commit()
            .await
            .map_err(query_err("create table", table))?;
        info!(%table, "table is ready");
        Ok(())
    }

    async fn count_prompt(&mut self, table: &TableName, prompt: &str) -> Result<i64, StoreError> {
        let tx = self.tx()?;
        sqlx::query_scalar::<_, i64>(&count_prompt_sql(table))
            .bind(prompt)
            .fetch_one(&mut **tx)
            .await
            .map_err(query_err("count prompt", table))
    }

    async fn insert_prompt(&mut self, table: &TableName, row: &DatasetRow) -> Result<(), StoreError> {
        let tx = self.tx()?;
        sqlx::query(&insert_prompt_sql(table))
            .bind(&row.prompt)
            .bind(row.category.as_deref())
            .execute(&mut **tx)
            .await
            .map_err(query_err("insert prompt", table))?;
        Ok(())
    }

    async fn fetch_all(&mut self, table: &TableName) -> Result<Vec<PromptRecord>, StoreError> {
        let tx = self.tx()?;
        let mut savepoint = Connection::begin(&mut **tx)
            .await
            .map_err(query_err("select rows", table))?;
        let rows = sqlx::query(&select_all_sql(table))
            .fetch_all(&mut *savepoint)
            .await
            .map_err(query_err("select rows", table))?;
        savepoint
            .commit()
            .await
            .map_err(query_err("select rows", table))?;

        rows.into_iter()
            .map(|row| {
                Ok(PromptRecord {
                    id: row.try_get("id")?,
                    prompt: row.try_get("prompt")?,
                    category: row.try_get("category")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(query_err("decode rows", table))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Closed)?;
        tx.commit()
            .await
            .map_err(|source| StoreError::Transaction {
                operation: "commit",
                source,
            })
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(|source| StoreError::Transaction {
                operation: "rollback",
                source,
            }),
            None => Ok(()),
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.rollback().await {
            warn!(error = %err, "rollback on close failed");
        }
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_target_the_validated_table() {
        let table = TableName::chatgpt_prompts();
        assert_eq!(
            create_table_sql(&table),
            "CREATE TABLE IF NOT EXISTS chatgpt_prompts (id SERIAL PRIMARY KEY, prompt TEXT, category VARCHAR(255))"
        );
        assert_eq!(
            count_prompt_sql(&table),
            "SELECT COUNT(*) FROM chatgpt_prompts WHERE prompt = $1"
        );
        assert_eq!(
            insert_prompt_sql(&table),
            "INSERT INTO chatgpt_prompts (prompt, category) VALUES ($1, $2)"
        );
        assert_eq!(
            select_all_sql(&table),
            "SELECT id, prompt, category FROM chatgpt_prompts"
        );
    }

    #[test]
    fn debug_output_redacts_password() {
        let params = ConnectionParams::new("db", "prompts", "loader", "s3cret", 5432);
        let rendered = format!("{params:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("s3cret"));
    }

    fn lookup_from<'a>(vars: &'a [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key: &str| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn env_connection_uses_defaults_and_overrides() {
        let params = ConnectionParams::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(params.host, "postgres");
        assert_eq!(params.database, "airflow");
        assert_eq!(params.port, 5432);

        let params = ConnectionParams::from_lookup(lookup_from(&[
            ("POSTGRES_HOST", "db.internal"),
            ("POSTGRES_PORT", "6543"),
        ]))
        .expect("overrides");
        assert_eq!(params.host, "db.internal");
        assert_eq!(params.user, "airflow");
        assert_eq!(params.port, 6543);
    }

    #[test]
    fn unparsable_env_port_is_an_error() {
        for raw in ["abc", "70000", ""] {
            let err = ConnectionParams::from_lookup(lookup_from(&[("POSTGRES_PORT", raw)]))
                .expect_err("bad port must not fall back");
            assert!(format!("{err:#}").contains("POSTGRES_PORT"), "{err:#}");
        }
    }

    #[tokio::test]
    async fn unreachable_store_surfaces_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let params = ConnectionParams::new("127.0.0.1", "prompts", "loader", "loader", port)
            .with_connect_timeout(Duration::from_secs(2));
        let err = PgPromptStore::connect(&params)
            .await
            .err()
            .expect("connection must fail");
        assert!(matches!(err, StoreError::Connect { port: p, .. } if p == port));
    }
}
