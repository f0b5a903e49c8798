//! Running tile queries against PostGIS.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Executor, PgConnection, PgPool, Postgres};

use crate::config::DatabaseConfig;
use crate::error::{Error, ExecutionError};
use crate::row::RawRow;

/// Capability to run a query and collect its rows.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<RawRow>, ExecutionError>;
}

/// Executes queries on a PostgreSQL connection pool.
#[derive(Clone, Debug)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        PgExecutor { pool }
    }

    /// Builds a lazily connecting pool. Every session is switched to read-only
    /// when requested, and statements are aborted server side after
    /// `statement_timeout`.
    pub fn connect_lazy(
        config: &DatabaseConfig,
        statement_timeout: Duration,
    ) -> Result<Self, Error> {
        let ssl_mode = config.ssl_mode.parse::<PgSslMode>().map_err(|err| {
            Error::Config(format!("invalid ssl mode `{}`: {}", config.ssl_mode, err))
        })?;

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name)
            .ssl_mode(ssl_mode);

        let read_only = config.read_only;
        let timeout_ms = statement_timeout.as_millis();

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if read_only {
                        conn.execute("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                            .await?;
                    }
                    conn.execute(format!("SET statement_timeout = {}", timeout_ms).as_str())
                        .await?;
                    Ok(())
                })
            })
            .connect_lazy_with(options);

        Ok(PgExecutor { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<RawRow>, ExecutionError> {
        let mut running = RunningQuery::start(&self.pool).await?;
        let result = collect_rows(running.connection(), sql).await;
        running.finish();
        result
    }
}

async fn collect_rows(conn: &mut PgConnection, sql: &str) -> Result<Vec<RawRow>, ExecutionError> {
    let mut rows = Vec::new();
    let mut stream = sqlx::query(sql).fetch(conn);
    while let Some(row) = stream
        .try_next()
        .await
        .map_err(ExecutionError::from_database)?
    {
        rows.push(RawRow::from_pg_row(&row).map_err(ExecutionError::from_database)?);
    }

    Ok(rows)
}

/// A pooled connection lent to one statement.
///
/// Dropped before [`RunningQuery::finish`], because the caller gave up or
/// timed out, it takes the connection out of the pool and asks the server to
/// cancel the statement still running on it.
struct RunningQuery {
    conn: Option<PoolConnection<Postgres>>,
    pool: PgPool,
    backend_pid: i32,
}

impl RunningQuery {
    async fn start(pool: &PgPool) -> Result<RunningQuery, ExecutionError> {
        let mut conn = pool.acquire().await.map_err(ExecutionError::from_database)?;
        let backend_pid = sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await
            .map_err(ExecutionError::from_database)?;

        Ok(RunningQuery {
            conn: Some(conn),
            pool: pool.clone(),
            backend_pid,
        })
    }

    fn connection(&mut self) -> &mut PgConnection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken when the query ends"),
        }
    }

    /// The statement ended on its own; the connection goes back to the pool.
    fn finish(mut self) {
        self.conn.take();
    }
}

impl Drop for RunningQuery {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn.detach(),
            None => return,
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return,
        };

        let pool = self.pool.clone();
        let backend_pid = self.backend_pid;
        log::debug!("cancelling statement on backend {}", backend_pid);

        handle.spawn(async move {
            let cancelled = sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
                .bind(backend_pid)
                .fetch_one(&pool)
                .await;
            match cancelled {
                Ok(true) => {}
                Ok(false) => log::debug!("backend {} had nothing to cancel", backend_pid),
                Err(err) => log::warn!("could not cancel backend {}: {}", backend_pid, err),
            }
            // The detached connection is never reused, so a late cancel cannot
            // hit another statement.
            drop(conn);
        });
    }
}
