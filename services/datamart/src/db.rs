//! Database gateway for the datamart warehouse.
//!
//! Wraps a Postgres pool with the three operations the services need:
//! parameterized execution, plain execution and row queries. A call that
//! fails because the connection dropped is re-issued exactly once; a second
//! failure propagates to the caller.

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres, Row};

/// Dynamic cell/parameter value.
///
/// The import pipeline builds rows whose columns are only known at runtime,
/// so statements bind through this enum instead of typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Null,
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Bool(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::Null => query.bind(None::<String>),
    }
}

/// True when the error means the connection died rather than the statement
/// being wrong. SQLSTATE class 08 covers connection exceptions, 57P01 is
/// admin_shutdown.
pub fn is_connection_loss(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || code == "57P01")
            .unwrap_or(false),
        _ => false,
    }
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    /// Execute a parameterized statement, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error> {
        match self.try_execute(sql, params).await {
            Err(e) if is_connection_loss(&e) => self.try_execute(sql, params).await,
            other => other,
        }
    }

    async fn try_execute(&self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Execute a statement without parameters.
    pub async fn execute_plain(&self, sql: &str) -> Result<u64, sqlx::Error> {
        self.execute(sql, &[]).await
    }

    /// Execute a parameterized INSERT ... RETURNING id and fetch the id.
    pub async fn insert_returning_id(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<i32, sqlx::Error> {
        match self.try_insert_returning_id(sql, params).await {
            Err(e) if is_connection_loss(&e) => self.try_insert_returning_id(sql, params).await,
            other => other,
        }
    }

    async fn try_insert_returning_id(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<i32, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let row = query.fetch_one(&self.pool).await?;
        row.try_get(0)
    }

    /// Run a query and return its rows in result order.
    pub async fn fetch_all<T>(&self, sql: &str, params: &[Value]) -> Result<Vec<T>, sqlx::Error>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        match self.try_fetch_all(sql, params).await {
            Err(e) if is_connection_loss(&e) => self.try_fetch_all(sql, params).await,
            other => other,
        }
    }

    async fn try_fetch_all<T>(&self, sql: &str, params: &[Value]) -> Result<Vec<T>, sqlx::Error>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|row| T::from_row(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_loss_classification() {
        assert!(is_connection_loss(&sqlx::Error::PoolTimedOut));
        assert!(is_connection_loss(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe"
        ))));
        assert!(!is_connection_loss(&sqlx::Error::RowNotFound));
    }
}
