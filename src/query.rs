//! Statement execution over scoped connections
//!
//! Every call opens its own connection and closes it before returning. Failures
//! never propagate: they are logged once (by the error constructor) and turned
//! into a `Failed` outcome, which renders as an empty payload.
//!
//! Statements go over the simple query protocol, so every value arrives in
//! PostgreSQL's text form and renders the way the server prints it.

use crate::connection::ConnectionTarget;
use crate::format::ResultFormatter;
use crate::{Result, ServerError};
use sqlx::error::DatabaseError;
use sqlx::postgres::{PgColumn, PgConnection, PgRow};
use sqlx::{Column, Connection, Either, Executor, Row as SqlxRow, Statement, TypeInfo, ValueRef};
use std::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, info};

/// A single cell value as decoded from the driver
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision numeric, kept in its decimal text form
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

/// A single row of query results
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column values, in column order
    pub values: Vec<Scalar>,
}

/// Column names and rows exactly as returned by the server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Result of a read; a failure is indistinguishable from an empty result once rendered
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(ResultSet),
    Failed { reason: String },
}

impl QueryOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, QueryOutcome::Failed { .. })
    }

    pub fn result_set(&self) -> Option<&ResultSet> {
        match self {
            QueryOutcome::Rows(result) => Some(result),
            QueryOutcome::Failed { .. } => None,
        }
    }

    /// Format the rows, or return an empty string for a failed query
    pub fn render(&self, formatter: &ResultFormatter) -> String {
        match self {
            QueryOutcome::Rows(result) => formatter.format(result),
            QueryOutcome::Failed { .. } => String::new(),
        }
    }
}

impl From<Result<ResultSet>> for QueryOutcome {
    fn from(result: Result<ResultSet>) -> Self {
        match result {
            Ok(rows) => QueryOutcome::Rows(rows),
            Err(e) => QueryOutcome::Failed { reason: e.user_message() },
        }
    }
}

/// Result of a write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Committed { rows_affected: u64 },
    Failed { reason: String },
}

impl WriteOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteOutcome::Committed { .. })
    }
}

impl From<Result<u64>> for WriteOutcome {
    fn from(result: Result<u64>) -> Self {
        match result {
            Ok(rows_affected) => WriteOutcome::Committed { rows_affected },
            Err(e) => WriteOutcome::Failed { reason: e.user_message() },
        }
    }
}

/// Runs single statements against a [`ConnectionTarget`]
pub struct StatementExecutor;

impl StatementExecutor {
    /// Execute `sql` and fetch every row
    pub async fn run_query(target: &ConnectionTarget, sql: &str) -> QueryOutcome {
        let start_time = Instant::now();
        debug!("Executing SQL query on {}: {}", target.database, sql);

        let mut connection = match Self::open(target).await {
            Ok(connection) => connection,
            Err(e) => return QueryOutcome::Failed { reason: e.user_message() },
        };

        let result = Self::fetch_result_set(&mut connection, sql).await;
        Self::release(connection).await;

        if let Ok(result_set) = &result {
            info!(
                "Query returned {} rows in {}ms",
                result_set.rows.len(),
                start_time.elapsed().as_millis()
            );
        }

        result.into()
    }

    /// Execute `sql` inside a transaction and commit it
    pub async fn run_write(target: &ConnectionTarget, sql: &str) -> WriteOutcome {
        let start_time = Instant::now();
        debug!("Executing SQL write on {}: {}", target.database, sql);

        let mut connection = match Self::open(target).await {
            Ok(connection) => connection,
            Err(e) => return WriteOutcome::Failed { reason: e.user_message() },
        };

        let result = Self::execute_and_commit(&mut connection, sql).await;
        Self::release(connection).await;

        if let Ok(rows_affected) = &result {
            info!(
                "Write committed ({} rows affected) in {}ms",
                rows_affected,
                start_time.elapsed().as_millis()
            );
        }

        result.into()
    }

    async fn open(target: &ConnectionTarget) -> Result<PgConnection> {
        let options = target.connect_options()?;

        PgConnection::connect_with(&options).await.map_err(|e| {
            let recoverable = matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut);
            ServerError::connection_error(e, recoverable)
        })
    }

    async fn release(connection: PgConnection) {
        if let Err(e) = connection.close().await {
            debug!("Error while closing database connection: {}", e);
        }
    }

    async fn fetch_result_set(connection: &mut PgConnection, sql: &str) -> Result<ResultSet> {
        // Prepare outside the transaction: a failed prepare would abort it
        let prepared_columns = match (&mut *connection).prepare(sql).await {
            Ok(statement) => {
                let columns: Vec<String> = statement
                    .columns()
                    .iter()
                    .map(|col| col.name().to_string())
                    .collect();
                if columns.is_empty() {
                    return Err(ServerError::query_error(sql.to_string(), no_result_set()));
                }
                Some(columns)
            }
            Err(e) if is_multiple_commands(&e) => {
                debug!("Statement batch cannot be prepared, reading the last result set");
                None
            }
            Err(e) => return Err(ServerError::query_error(sql.to_string(), e)),
        };

        let mut tx = connection
            .begin()
            .await
            .map_err(|e| ServerError::query_error("BEGIN".to_string(), e))?;

        // Dropping an uncommitted transaction rolls it back
        let last_rows = Self::fetch_last_rows(&mut tx, sql).await?;

        let result = match (prepared_columns, last_rows) {
            (Some(columns), rows) => ResultSet {
                columns,
                rows: rows.map(|set| set.rows).unwrap_or_default(),
            },
            (None, Some(set)) => set,
            (None, None) => return Err(ServerError::query_error(sql.to_string(), no_result_set())),
        };

        tx.commit()
            .await
            .map_err(|e| ServerError::query_error("COMMIT".to_string(), e))?;

        Ok(result)
    }

    /// Run `sql` over the simple query protocol and keep the rows of its last statement
    async fn fetch_last_rows(connection: &mut PgConnection, sql: &str) -> Result<Option<ResultSet>> {
        let mut stream = connection.fetch_many(sql);
        let mut current: Option<ResultSet> = None;
        let mut last: Option<ResultSet> = None;

        while let Some(item) = stream.next().await {
            match item.map_err(|e| ServerError::query_error(sql.to_string(), e))? {
                Either::Right(row) => {
                    let set = current.get_or_insert_with(|| ResultSet {
                        columns: row.columns().iter().map(|col| col.name().to_string()).collect(),
                        rows: Vec::new(),
                    });
                    set.rows.push(Row { values: Self::convert_row(&row) });
                }
                // end of one statement
                Either::Left(_) => last = current.take(),
            }
        }

        Ok(last)
    }

    async fn execute_and_commit(connection: &mut PgConnection, sql: &str) -> Result<u64> {
        let mut tx = connection
            .begin()
            .await
            .map_err(|e| ServerError::query_error("BEGIN".to_string(), e))?;

        // Dropping an uncommitted transaction rolls it back
        let result = (&mut *tx)
            .execute(sql)
            .await
            .map_err(|e| ServerError::query_error(sql.to_string(), e))?;

        tx.commit()
            .await
            .map_err(|e| ServerError::query_error("COMMIT".to_string(), e))?;

        Ok(result.rows_affected())
    }

    fn convert_row(row: &PgRow) -> Vec<Scalar> {
        row.columns()
            .iter()
            .enumerate()
            .map(|(i, column)| Self::convert_pg_value(row, i, column))
            .collect()
    }

    /// Decode one text-format cell by its PostgreSQL type name
    fn convert_pg_value(row: &PgRow, index: usize, column: &PgColumn) -> Scalar {
        let raw = match row.try_get_raw(index) {
            Ok(value) if value.is_null() => return Scalar::Null,
            Ok(value) => value,
            Err(e) => {
                debug!("Failed to read column '{}': {}", column.name(), e);
                return Scalar::Null;
            }
        };

        let text = match raw.as_str() {
            Ok(text) => text,
            Err(e) => {
                debug!("Column '{}' is not valid text: {}", column.name(), e);
                return Scalar::Null;
            }
        };

        let type_name = column.type_info().name();

        match type_name {
            "BOOL" => Scalar::Bool(text == "t"),
            "INT2" | "INT4" | "INT8" | "OID" => text
                .parse::<i64>()
                .map(Scalar::Int)
                .unwrap_or_else(|_| Scalar::Numeric(text.to_string())),
            "FLOAT4" | "FLOAT8" => text
                .parse::<f64>()
                .map(Scalar::Float)
                .unwrap_or_else(|_| Scalar::Numeric(text.to_string())),
            "NUMERIC" => Scalar::Numeric(text.to_string()),
            "BYTEA" => match row.try_get::<Vec<u8>, _>(index) {
                Ok(bytes) => Scalar::Bytes(bytes),
                Err(e) => {
                    debug!("Column '{}' kept as escaped text: {}", column.name(), e);
                    Scalar::Text(text.to_string())
                }
            },
            "JSON" | "JSONB" => serde_json::from_str(text)
                .map(Scalar::Json)
                .unwrap_or_else(|_| Scalar::Text(text.to_string())),
            _ => Scalar::Text(text.to_string()),
        }
    }
}

/// The statement ran but produced no rows to fetch
fn no_result_set() -> sqlx::Error {
    sqlx::Error::Protocol("the statement does not return a result set".to_string())
}

/// PostgreSQL refuses to prepare a batch of several statements
fn is_multiple_commands(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .map_or(false, |db| db.message().contains("cannot insert multiple commands"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{PayloadShape, ResultFormatter};

    fn unreachable_target() -> ConnectionTarget {
        // Port 1 on loopback refuses connections immediately
        ConnectionTarget {
            host: "127.0.0.1".to_string(),
            port: 1,
            database: "postgres".to_string(),
            user: "nobody".to_string(),
            credential: "nothing".to_string(),
            ssl_mode: "disable".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_query_failure_yields_failed_outcome() {
        let outcome = StatementExecutor::run_query(&unreachable_target(), "SELECT * FROM nonexistent").await;

        assert!(outcome.is_failed());
        assert!(outcome.result_set().is_none());
        assert_eq!(outcome.render(&ResultFormatter::for_query(PayloadShape::Plain)), "");
        assert_eq!(outcome.render(&ResultFormatter::for_query(PayloadShape::Structured)), "");
    }

    #[tokio::test]
    async fn test_run_write_failure_is_not_committed() {
        let outcome = StatementExecutor::run_write(&unreachable_target(), "CREATE TABLE t2(x int)").await;

        assert!(!outcome.is_committed());
        assert!(matches!(outcome, WriteOutcome::Failed { .. }));
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: QueryOutcome = Ok(ResultSet::default()).into();
        assert_eq!(ok, QueryOutcome::Rows(ResultSet::default()));

        let failed: QueryOutcome = Err(ServerError::validation_error("boom".to_string(), None)).into();
        assert_eq!(failed, QueryOutcome::Failed { reason: "boom".to_string() });

        let committed: WriteOutcome = Ok(3).into();
        assert_eq!(committed, WriteOutcome::Committed { rows_affected: 3 });
    }
}
