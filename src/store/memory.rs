//! In-process job store for tests and single-process embedding.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{JobStore, StoreError};
use crate::job::{JobId, JobRecord};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: &JobRecord,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        match records.get_mut(&record.id) {
            Some(current) if current.revision == expected_revision => {
                *current = record.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(record.id.clone())),
        }
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;

    fn record(id: &str) -> JobRecord {
        JobRecord::new(
            JobId::from(id),
            JobPayload {
                geojson: serde_json::json!({"type": "Point", "coordinates": [0, 0]}),
                output_filename: "map.pdf".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id() {
        let store = MemoryJobStore::new();
        store.insert(&record("a")).await.unwrap();
        assert!(matches!(
            store.insert(&record("a")).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_revision() {
        let store = MemoryJobStore::new();
        let original = record("a");
        store.insert(&original).await.unwrap();

        let mut first = original.clone();
        first.start_attempt().unwrap();
        assert!(store.compare_and_swap(0, &first).await.unwrap());

        let mut stale = original.clone();
        stale.start_attempt().unwrap();
        assert!(!store.compare_and_swap(0, &stale).await.unwrap());

        let stored = store.get(&original.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn test_list_returns_all_records() {
        let store = MemoryJobStore::new();
        store.insert(&record("a")).await.unwrap();
        store.insert(&record("b")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
