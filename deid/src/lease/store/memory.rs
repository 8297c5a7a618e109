use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::DeidResult;
use crate::lease::LeaseRecord;
use crate::lease::store::{CreateOutcome, LeaseStore, UpdateOutcome};

/// Lease store kept in process memory.
///
/// Clones share the same records, so every clone handed to a task or a manager sees the same
/// leases. Only excludes holders living in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    records: Arc<Mutex<HashMap<String, LeaseRecord>>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, name: &str) -> DeidResult<Option<LeaseRecord>> {
        let records = self.records.lock().await;

        Ok(records.get(name).cloned())
    }

    async fn put_if_absent(&self, record: LeaseRecord) -> DeidResult<CreateOutcome> {
        let mut records = self.records.lock().await;

        if records.contains_key(&record.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        records.insert(record.name.clone(), record);

        Ok(CreateOutcome::Created)
    }

    async fn put_if_version(
        &self,
        record: LeaseRecord,
        expected_version: u64,
    ) -> DeidResult<UpdateOutcome> {
        let mut records = self.records.lock().await;

        match records.get_mut(&record.name) {
            Some(current) if current.version == expected_version => {
                *current = record;
                Ok(UpdateOutcome::Updated)
            }
            _ => Ok(UpdateOutcome::VersionMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn record(owner: &str, version: u64) -> LeaseRecord {
        LeaseRecord {
            name: "identity".to_string(),
            owner: Some(owner.to_string()),
            expires_at: Utc::now(),
            version,
        }
    }

    #[tokio::test]
    async fn create_only_once() {
        let store = MemoryLeaseStore::new();

        assert_eq!(
            store.put_if_absent(record("a", 1)).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            store.put_if_absent(record("b", 1)).await.unwrap(),
            CreateOutcome::AlreadyExists
        );

        let stored = store.get("identity").await.unwrap().unwrap();
        assert_eq!(stored.owner.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn update_requires_matching_version() {
        let store = MemoryLeaseStore::new();
        store.put_if_absent(record("a", 1)).await.unwrap();

        assert_eq!(
            store.put_if_version(record("b", 2), 7).await.unwrap(),
            UpdateOutcome::VersionMismatch
        );
        assert_eq!(
            store.put_if_version(record("b", 2), 1).await.unwrap(),
            UpdateOutcome::Updated
        );
        // The version the second writer read is gone now.
        assert_eq!(
            store.put_if_version(record("c", 2), 1).await.unwrap(),
            UpdateOutcome::VersionMismatch
        );

        let stored = store.get("identity").await.unwrap().unwrap();
        assert_eq!(stored.owner.as_deref(), Some("b"));
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn update_of_missing_record_is_a_mismatch() {
        let store = MemoryLeaseStore::new();

        assert_eq!(
            store.put_if_version(record("a", 2), 1).await.unwrap(),
            UpdateOutcome::VersionMismatch
        );
        assert!(store.get("identity").await.unwrap().is_none());
    }
}
