//! PostgreSQL document store.
//!
//! All collections share one `documents` table keyed by `(collection, id)`
//! with a JSONB body. Filters translate JSON pointers to `#>` path lookups.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Row};
use std::time::Duration;
use tracing::Instrument;

use super::{Condition, Document, DocumentStore, Filter, StorageError};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        version BIGINT NOT NULL,
        body JSONB NOT NULL,
        expires_at TIMESTAMPTZ,
        PRIMARY KEY (collection, id)
    )
";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn db_span(operation: &'static str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn to_db_version(version: u64) -> Result<i64, StorageError> {
    i64::try_from(version).map_err(|_| StorageError::Backend("version overflow".to_string()))
}

fn from_db_version(version: i64) -> Result<u64, StorageError> {
    u64::try_from(version).map_err(|_| StorageError::Backend("negative version".to_string()))
}

fn pointer_path(pointer: &str) -> Vec<String> {
    pointer
        .split('/')
        .skip(1)
        .map(|part| part.replace("~1", "/").replace("~0", "~"))
        .collect()
}

impl PgStore {
    /// Connect and make sure the `documents` table exists.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable or the schema cannot be created.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .instrument(db_span("CREATE", SCHEMA))
            .await
            .context("failed to create documents table")?;

        Ok(Self { pool })
    }

    fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document, StorageError> {
        let Json(body): Json<Value> = row.try_get("body").map_err(backend)?;
        Ok(Document {
            id: row.try_get("id").map_err(backend)?,
            version: from_db_version(row.try_get("version").map_err(backend)?)?,
            body,
            expires_at: row.try_get("expires_at").map_err(backend)?,
        })
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Document, StorageError> {
        let query = "SELECT id, version, body, expires_at FROM documents WHERE collection = $1 AND id = $2";
        let row = sqlx::query(query)
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .map_err(backend)?;

        row.as_ref()
            .map(Self::row_to_document)
            .transpose()?
            .ok_or_else(|| StorageError::not_found(collection, id))
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let query = r"
            INSERT INTO documents (collection, id, version, body, expires_at)
            VALUES ($1, $2, 1, $3, $4)
        ";
        match sqlx::query(query)
            .bind(collection)
            .bind(id)
            .bind(Json(body))
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
        {
            Ok(_) => Ok(1),
            Err(err) if is_unique_violation(&err) => Err(StorageError::duplicate(collection, id)),
            Err(err) => Err(backend(err)),
        }
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let query = r"
            UPDATE documents
            SET version = version + 1, body = $4, expires_at = $5
            WHERE collection = $1 AND id = $2 AND version = $3
            RETURNING version
        ";
        let row = sqlx::query(query)
            .bind(collection)
            .bind(id)
            .bind(to_db_version(expected_version)?)
            .bind(Json(body))
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(backend)?;

        if let Some(row) = row {
            return from_db_version(row.try_get("version").map_err(backend)?);
        }

        // Distinguish a lost race from a missing document.
        match self.get(collection, id).await {
            Ok(_) => Err(StorageError::conflict(collection, id)),
            Err(err) => Err(err),
        }
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let query = r"
            INSERT INTO documents (collection, id, version, body, expires_at)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (collection, id) DO UPDATE
            SET version = documents.version + 1, body = EXCLUDED.body, expires_at = EXCLUDED.expires_at
            RETURNING version
        ";
        let row = sqlx::query(query)
            .bind(collection)
            .bind(id)
            .bind(Json(body))
            .bind(expires_at)
            .fetch_one(&self.pool)
            .instrument(db_span("UPSERT", query))
            .await
            .map_err(backend)?;
        from_db_version(row.try_get("version").map_err(backend)?)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        let query = "DELETE FROM documents WHERE collection = $1 AND id = $2";
        let result = sqlx::query(query)
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StorageError> {
        let mut query = String::from(
            "SELECT id, version, body, expires_at FROM documents WHERE collection = $1",
        );
        let mut next = 2;
        for condition in filter.conditions() {
            let clause = match condition {
                Condition::Eq(..) => format!(" AND body #> ${} = ${}", next, next + 1),
                Condition::Contains(..) => format!(" AND body #> ${} @> ${}", next, next + 1),
                Condition::HasKey(..) => {
                    format!(" AND jsonb_exists(body #> ${}, ${})", next, next + 1)
                }
            };
            query.push_str(&clause);
            next += 2;
        }
        query.push_str(" ORDER BY id");

        let mut statement = sqlx::query(&query).bind(collection);
        for condition in filter.conditions() {
            statement = match condition {
                Condition::Eq(pointer, value) => statement
                    .bind(pointer_path(pointer))
                    .bind(Json(value.clone())),
                Condition::Contains(pointer, value) => statement
                    .bind(pointer_path(pointer))
                    .bind(Json(Value::Array(vec![value.clone()]))),
                Condition::HasKey(pointer, key) => {
                    statement.bind(pointer_path(pointer)).bind(key.clone())
                }
            };
        }

        let rows = statement
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(backend)?;
        rows.iter().map(Self::row_to_document).collect()
    }

    async fn delete_expired(
        &self,
        collection: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let query = "DELETE FROM documents WHERE collection = $1 AND expires_at <= $2";
        let result = sqlx::query(query)
            .bind(collection)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}
