//! External SQL execution engine
//!
//! Statements run inside a READ ONLY transaction that is always rolled back.
//! The configured timeout is enforced by the server (`statement_timeout`) and
//! by the client.

use super::QueryOutput;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("query timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("no database connection available: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("no execution engine is configured")]
    Unavailable,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn run(&self, sql: &str) -> Result<QueryOutput, EngineError>;
}

pub struct PostgresEngine {
    pool: Pool,
    timeout: Duration,
}

impl PostgresEngine {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn run_read_only(&self, sql: &str) -> Result<QueryOutput, EngineError> {
        let mut object = self.pool.get().await?;
        let client: &mut tokio_postgres::Client = &mut object;
        let tx = client.build_transaction().read_only(true).start().await?;
        tx.batch_execute(&format!(
            "SET LOCAL statement_timeout = {}",
            self.timeout.as_millis()
        ))
        .await?;

        // Column names come from the prepared statement so empty results keep them
        let statement = tx.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let wrapped = json_wrapped(sql);
        let row = tx.query_one(wrapped.as_str(), &[]).await?;
        let rows = match row.try_get::<_, serde_json::Value>(0)? {
            serde_json::Value::Array(rows) => rows,
            other => vec![other],
        };

        tx.rollback().await?;
        Ok(QueryOutput { columns, rows })
    }
}

/// Aggregate the result set into one JSON array. The newline keeps a trailing
/// line comment from swallowing the closing parenthesis.
fn json_wrapped(sql: &str) -> String {
    format!(
        "SELECT COALESCE(json_agg(q), '[]'::json) FROM ({}\n) AS q",
        sql.trim().trim_end_matches(';')
    )
}

#[async_trait]
impl QueryEngine for PostgresEngine {
    async fn run(&self, sql: &str) -> Result<QueryOutput, EngineError> {
        debug!("executing governed statement");
        timeout(self.timeout, self.run_read_only(sql))
            .await
            .map_err(|_| EngineError::Timeout(self.timeout.as_secs()))?
    }
}

/// Stand-in used when no DATABASE_URL is configured
pub struct DetachedEngine;

#[async_trait]
impl QueryEngine for DetachedEngine {
    async fn run(&self, _sql: &str) -> Result<QueryOutput, EngineError> {
        Err(EngineError::Unavailable)
    }
}
