use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::key::DedupKey;
use crate::store::{
    ClaimOutcome, MembershipEntry, MembershipStore, ProvisionRequest, StoreError, StoreResult,
};

/// A membership store that lives only as long as the process.
/// Useful to deduplicate a single input without a database, and as the store in tests.
#[derive(Default)]
pub struct MemoryMembershipStore {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every claimed entry, sorted by key.
    pub fn entries(&self) -> StoreResult<Vec<MembershipEntry>> {
        let mut entries: Vec<MembershipEntry> = self
            .lock()?
            .iter()
            .map(|(id, created_at)| MembershipEntry {
                id: id.clone(),
                created_at: *created_at,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(entries)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, DateTime<Utc>>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_owned()))
    }
}

#[async_trait]
impl MembershipStore for MemoryMembershipStore {
    async fn exists(&self, key: &DedupKey) -> StoreResult<bool> {
        Ok(self.lock()?.contains_key(key.as_str()))
    }

    async fn claim(&self, key: &DedupKey, created_at: DateTime<Utc>) -> StoreResult<()> {
        let mut entries = self.lock()?;

        if entries.contains_key(key.as_str()) {
            return Err(StoreError::AlreadyClaimed(key.to_string()));
        }
        entries.insert(key.to_string(), created_at);

        Ok(())
    }

    async fn claim_if_absent(
        &self,
        key: &DedupKey,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let mut entries = self.lock()?;

        if entries.contains_key(key.as_str()) {
            Ok(ClaimOutcome::AlreadyExisted)
        } else {
            entries.insert(key.to_string(), created_at);
            Ok(ClaimOutcome::Created)
        }
    }

    async fn provision(&self, _request: &ProvisionRequest) -> StoreResult<()> {
        Ok(())
    }
}
