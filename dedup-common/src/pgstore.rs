use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::key::DedupKey;
use crate::store::{
    validate_identifier, ClaimOutcome, MembershipStore, ProvisionRequest, StoreError, StoreResult,
};

/// Connection pool settings for a `PgMembershipStore`.
#[derive(Debug, Clone, Copy)]
pub struct PgStoreOptions {
    pub max_connections: u32,
    pub acquire_timeout: time::Duration,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 1,
            acquire_timeout: time::Duration::from_secs(5),
        }
    }
}

/// A membership store implemented on top of a PostgreSQL table.
///
/// The table lives in the schema named by the compartment and has the layout created by
/// `provision`: `(id TEXT PRIMARY KEY, created_at TIMESTAMPTZ NOT NULL)`.
pub struct PgMembershipStore {
    schema: String,
    table: String,
    pool: PgPool,
}

impl PgMembershipStore {
    /// Initialize a new store backed by `schema.table` in PostgreSQL.
    pub async fn new(
        schema: &str,
        table: &str,
        url: &str,
        options: PgStoreOptions,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Self::new_from_pool(schema, table, pool)
    }

    /// Initialize a store on an existing pool.
    pub fn new_from_pool(schema: &str, table: &str, pool: PgPool) -> StoreResult<Self> {
        Ok(Self {
            schema: validate_identifier(schema)?.to_owned(),
            table: validate_identifier(table)?.to_owned(),
            pool,
        })
    }

    fn qualified_table(&self) -> String {
        format!(r#""{}"."{}""#, self.schema, self.table)
    }
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn exists(&self, key: &DedupKey) -> StoreResult<bool> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
            self.qualified_table()
        );

        sqlx::query_scalar::<_, bool>(&query)
            .bind(key.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn claim(&self, key: &DedupKey, created_at: DateTime<Utc>) -> StoreResult<()> {
        let query = format!(
            r#"
INSERT INTO {}
    (id, created_at)
VALUES
    ($1, $2)
            "#,
            self.qualified_table()
        );

        sqlx::query(&query)
            .bind(key.as_str())
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(|error| match error {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    StoreError::AlreadyClaimed(key.to_string())
                }
                error => StoreError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                },
            })?;

        Ok(())
    }

    async fn claim_if_absent(
        &self,
        key: &DedupKey,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let query = format!(
            r#"
INSERT INTO {}
    (id, created_at)
VALUES
    ($1, $2)
ON CONFLICT (id) DO NOTHING
            "#,
            self.qualified_table()
        );

        let result = sqlx::query(&query)
            .bind(key.as_str())
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        if result.rows_affected() == 1 {
            Ok(ClaimOutcome::Created)
        } else {
            Ok(ClaimOutcome::AlreadyExisted)
        }
    }

    async fn provision(&self, request: &ProvisionRequest) -> StoreResult<()> {
        let schema = validate_identifier(&request.compartment)?;
        let table = validate_identifier(&request.table)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        sqlx::query(&format!(r#"CREATE SCHEMA IF NOT EXISTS "{}""#, schema))
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "CREATE SCHEMA".to_owned(),
                error,
            })?;

        // Fails if the table is already there.
        let ddl = format!(
            r#"
CREATE TABLE "{}"."{}" (
    id TEXT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL
)
            "#,
            schema, table
        );
        sqlx::query(&ddl)
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "CREATE TABLE".to_owned(),
                error,
            })?;

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(())
    }
}
