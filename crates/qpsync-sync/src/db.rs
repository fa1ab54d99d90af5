//! PostgreSQL connection management and the live destination table.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use qpsync_core::Cell;
use qpsync_storage::{BackoffPolicy, RetryDisposition, RetryFailure};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::load::{DestinationTable, InsertError};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("database unreachable after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}

/// Run `op` up to `max_attempts` times, sleeping `base_delay * 2^(n-1)` after
/// the n-th failure. Returns the attempt count with the last error.
pub(crate) async fn with_retries<T, E, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, (u32, E)>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let policy = BackoffPolicy::uncapped(max_attempts as usize - 1, base_delay);
    let attempt_no = |attempt: usize| u32::try_from(attempt).unwrap_or(u32::MAX);
    match policy
        .retry(
            "database connect",
            |attempt| op(attempt_no(attempt)),
            |_| RetryDisposition::Retryable,
        )
        .await
    {
        Ok(value) => {
            info!("database connection established");
            Ok(value)
        }
        Err(RetryFailure { attempts, error }) => {
            warn!(attempts, max_attempts, error = %error, "database unreachable; giving up");
            Err((attempt_no(attempts), error))
        }
    }
}

pub fn connect_options(db: &DatabaseConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .database(&db.database)
        .username(&db.user)
        .password(db.password.expose())
        .options([("statement_timeout", format!("{}ms", db.timeout.as_millis()))])
}

/// Open a single-connection pool, retrying with exponential backoff.
pub async fn connect(db: &DatabaseConfig) -> Result<PgPool, ConnectError> {
    let options = connect_options(db);
    with_retries(db.max_attempts, db.base_delay, |_attempt| {
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(db.timeout)
            .connect_with(options.clone())
    })
    .await
    .map_err(|(attempts, source)| ConnectError::Exhausted { attempts, source })
}

/// Double-quote an identifier, splitting `schema.table` into parts.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn split_table_name(table: &str) -> (Option<&str>, &str) {
    match table.rsplit_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

/// A column's declared type as `information_schema` names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    pub schema: String,
    pub name: String,
}

impl ColumnType {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    fn cast_target(&self) -> String {
        format!("{}.{}", quote_ident_part(&self.schema), quote_ident_part(&self.name))
    }

    fn is_timestamp(&self) -> bool {
        self.schema == "pg_catalog" && matches!(self.name.as_str(), "timestamp" | "timestamptz")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub data_type: ColumnType,
}

/// Parameters are cast to the column's declared type, so text binds land in
/// integer or timestamp columns.
pub fn insert_sql(table: &str, columns: &[&str], types: &HashMap<String, ColumnType>) -> String {
    let cols = columns
        .iter()
        .map(|c| quote_ident_part(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| match types.get(*column) {
            Some(ty) => format!("${}::{}", idx + 1, ty.cast_target()),
            None => format!("${}", idx + 1),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({cols}) VALUES ({placeholders})", quote_ident(table))
}

/// Timestamp identities are rendered server-side in the same layout as
/// [`qpsync_core::timestamp_key`], independent of column type or session
/// `DateStyle`.
pub fn existing_keys_sql(table: &str, column: &str, ty: Option<&ColumnType>) -> String {
    let col = quote_ident_part(column);
    let key = match ty {
        Some(ty) if ty.is_timestamp() => format!("to_char({col}, 'YYYY-MM-DD HH24:MI:SS')"),
        _ => format!("{col}::text"),
    };
    format!("SELECT {key} FROM {} WHERE {col} IS NOT NULL", quote_ident(table))
}

/// Column names may contain dots; quote them whole.
fn quote_ident_part(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub async fn table_columns(
    conn: &mut sqlx::PgConnection,
    table: &str,
) -> anyhow::Result<Vec<TableColumn>> {
    let (schema, name) = split_table_name(table);
    let rows = sqlx::query_as::<_, (String, String, String)>(
        r#"
        SELECT column_name::text, udt_schema::text, udt_name::text
          FROM information_schema.columns
         WHERE table_name = $1
           AND table_schema = COALESCE($2, current_schema())
         ORDER BY ordinal_position
        "#,
    )
    .bind(name)
    .bind(schema)
    .fetch_all(conn)
    .await
    .with_context(|| format!("reading column metadata for {table}"))?;

    Ok(rows
        .into_iter()
        .map(|(name, udt_schema, udt_name)| TableColumn {
            name,
            data_type: ColumnType::new(udt_schema, udt_name),
        })
        .collect())
}

/// Destination table inside one transaction; each insert runs in a savepoint.
pub struct PgDestination {
    tx: Transaction<'static, Postgres>,
    table: String,
    column_types: Option<HashMap<String, ColumnType>>,
}

impl PgDestination {
    pub async fn begin(pool: &PgPool, table: impl Into<String>) -> anyhow::Result<Self> {
        let tx = pool.begin().await.context("opening load transaction")?;
        Ok(Self {
            tx,
            table: table.into(),
            column_types: None,
        })
    }

    async fn column_types(&mut self) -> anyhow::Result<&HashMap<String, ColumnType>> {
        if self.column_types.is_none() {
            let columns = table_columns(&mut *self.tx, &self.table).await?;
            self.column_types = Some(
                columns
                    .into_iter()
                    .map(|column| (column.name, column.data_type))
                    .collect(),
            );
        }
        Ok(self.column_types.get_or_insert_with(HashMap::new))
    }
}

fn classify_insert_error(err: sqlx::Error) -> InsertError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => InsertError::Duplicate,
        _ => InsertError::Failed(err.to_string()),
    }
}

#[async_trait]
impl DestinationTable for PgDestination {
    async fn existing_keys(&mut self, identity_column: &str) -> anyhow::Result<HashSet<String>> {
        let ty = self.column_types().await?.get(identity_column).cloned();
        let sql = existing_keys_sql(&self.table, identity_column, ty.as_ref());
        let keys = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .with_context(|| format!("reading existing identities from {}", self.table))?;
        Ok(keys.into_iter().collect())
    }

    async fn column_names(&mut self) -> anyhow::Result<Vec<String>> {
        Ok(self.column_types().await?.keys().cloned().collect())
    }

    async fn insert_row(&mut self, columns: &[&str], cells: &[Cell]) -> Result<(), InsertError> {
        let sql = {
            let table = self.table.clone();
            let types = self
                .column_types()
                .await
                .map_err(|err| InsertError::Failed(format!("{err:#}")))?;
            insert_sql(&table, columns, types)
        };
        let mut savepoint = Connection::begin(&mut *self.tx)
            .await
            .map_err(|err| InsertError::Failed(err.to_string()))?;

        let mut query = sqlx::query(&sql);
        for cell in cells {
            query = match cell {
                Cell::Null => query.bind(None::<String>),
                Cell::Text(text) => query.bind(text.as_str()),
                Cell::Timestamp(ts) => query.bind(*ts),
            };
        }

        match query.execute(&mut *savepoint).await {
            Ok(_) => savepoint
                .commit()
                .await
                .map_err(|err| InsertError::Failed(err.to_string())),
            Err(err) => {
                let _ = savepoint.rollback().await;
                Err(classify_insert_error(err))
            }
        }
    }

    async fn commit(self) -> anyhow::Result<()> {
        self.tx.commit().await.context("committing load transaction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_back_off_exponentially_and_surface_last_error() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = with_retries(4, Duration::from_secs(1), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(format!("refused #{attempt}")) }
        })
        .await;

        let (attempts, err) = result.unwrap_err();
        assert_eq!(attempts, 4);
        assert_eq!(err, "refused #4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1 + 2 + 4 seconds; nothing after the final attempt.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failures_stops_retrying() {
        let started = Instant::now();
        let value = with_retries(10, Duration::from_millis(500), |attempt| async move {
            if attempt < 3 {
                Err(format!("attempt {attempt} failed"))
            } else {
                Ok(attempt)
            }
        })
        .await
        .expect("connects on third attempt");

        assert_eq!(value, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let result = with_retries(0, Duration::from_secs(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("down") }
        })
        .await;
        assert_eq!(result.unwrap_err().0, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("survey_responses"), "\"survey_responses\"");
        assert_eq!(quote_ident("etl.responses"), "\"etl\".\"responses\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(split_table_name("etl.responses"), (Some("etl"), "responses"));
        assert_eq!(split_table_name("responses"), (None, "responses"));
    }

    #[test]
    fn insert_statement_names_every_column_once() {
        let sql = insert_sql("etl.responses", &["responseID", "timestamp", "Q1.a"], &HashMap::new());
        assert_eq!(
            sql,
            "INSERT INTO \"etl\".\"responses\" (\"responseID\", \"timestamp\", \"Q1.a\") VALUES ($1, $2, $3)"
        );
    }

    #[test]
    fn insert_parameters_are_cast_to_declared_column_types() {
        let types: HashMap<String, ColumnType> = [
            ("responseID", ColumnType::new("pg_catalog", "int8")),
            ("timestamp", ColumnType::new("pg_catalog", "timestamptz")),
            ("Q1", ColumnType::new("pg_catalog", "varchar")),
            ("mood", ColumnType::new("etl", "mood_level")),
        ]
        .into_iter()
        .map(|(name, ty)| (name.to_string(), ty))
        .collect();

        let sql = insert_sql("responses", &["responseID", "timestamp", "Q1", "mood", "Q9"], &types);

        assert_eq!(
            sql,
            "INSERT INTO \"responses\" (\"responseID\", \"timestamp\", \"Q1\", \"mood\", \"Q9\") \
             VALUES ($1::\"pg_catalog\".\"int8\", $2::\"pg_catalog\".\"timestamptz\", \
             $3::\"pg_catalog\".\"varchar\", $4::\"etl\".\"mood_level\", $5)"
        );
    }

    #[test]
    fn timestamp_identities_are_read_back_in_key_layout() {
        for udt in ["timestamp", "timestamptz"] {
            let ty = ColumnType::new("pg_catalog", udt);
            assert_eq!(
                existing_keys_sql("etl.responses", "timestamp", Some(&ty)),
                "SELECT to_char(\"timestamp\", 'YYYY-MM-DD HH24:MI:SS') FROM \"etl\".\"responses\" \
                 WHERE \"timestamp\" IS NOT NULL"
            );
        }

        let bigint = ColumnType::new("pg_catalog", "int8");
        assert_eq!(
            existing_keys_sql("responses", "responseID", Some(&bigint)),
            "SELECT \"responseID\"::text FROM \"responses\" WHERE \"responseID\" IS NOT NULL"
        );
        assert_eq!(
            existing_keys_sql("responses", "responseID", None),
            "SELECT \"responseID\"::text FROM \"responses\" WHERE \"responseID\" IS NOT NULL"
        );
    }
}
