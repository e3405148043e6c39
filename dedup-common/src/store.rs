use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::key::DedupKey;

/// Enumeration of errors for operations against a membership store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("key {0} has already been claimed")]
    AlreadyClaimed(String),
    #[error("{0:?} is not a valid identifier")]
    InvalidIdentifier(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The unit persisted for every claimed key. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MembershipEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Result of an atomic "create if absent" claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Created,
    AlreadyExisted,
}

/// Parameters for the one-time creation of a key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Name of the key space (table) to create.
    pub table: String,
    /// Where the key space lives (a schema, for Postgres).
    pub compartment: String,
}

/// Records which dedup keys have been seen.
///
/// `exists` followed by `claim` is not atomic: two writers racing on the same key can both
/// observe it as absent. At most one of their claims succeeds when the backend enforces key
/// uniqueness; the other gets an error. Backends that can create-if-absent in a single round
/// trip override `claim_if_absent`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Whether an entry for `key` is present.
    async fn exists(&self, key: &DedupKey) -> StoreResult<bool>;

    /// Create the entry for `key`. Fails if it is already present.
    async fn claim(&self, key: &DedupKey, created_at: DateTime<Utc>) -> StoreResult<()>;

    /// Create the entry for `key` unless it is already present.
    async fn claim_if_absent(
        &self,
        key: &DedupKey,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        if self.exists(key).await? {
            return Ok(ClaimOutcome::AlreadyExisted);
        }

        match self.claim(key, created_at).await {
            Ok(()) => Ok(ClaimOutcome::Created),
            Err(StoreError::AlreadyClaimed(_)) => Ok(ClaimOutcome::AlreadyExisted),
            Err(error) => Err(error),
        }
    }

    /// Create the key space. Administrative only, never called while filtering.
    async fn provision(&self, request: &ProvisionRequest) -> StoreResult<()>;
}

/// Validate a table or schema name before it is interpolated into DDL or queries.
pub fn validate_identifier(name: &str) -> StoreResult<&str> {
    let mut chars = name.chars();

    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 63 {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_owned()))
    }
}
