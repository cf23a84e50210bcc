use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::RepositoryResult;
use super::record_store::{BoxFuture, Record, RecordStore, RecordVisitor, fresh_id};

/// In-memory record store
/// Useful for testing and development
pub struct InMemoryRecordStore<R: Record> {
    records: Arc<Mutex<HashMap<String, R>>>,
}

impl<R: Record> InMemoryRecordStore<R> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().contains_key(id)
    }
}

impl<R: Record> Default for InMemoryRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> Clone for InMemoryRecordStore<R> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
        }
    }
}

impl<R: Record> RecordStore<R> for InMemoryRecordStore<R> {
    fn create(&self, mut record: R) -> BoxFuture<'static, RepositoryResult<R>> {
        let records = self.records.clone();

        Box::pin(async move {
            record.set_id(fresh_id());
            record.validate()?;
            records
                .lock()
                .insert(record.id().to_string(), record.clone());
            Ok(record)
        })
    }

    fn put(&self, record: R) -> BoxFuture<'static, RepositoryResult<R>> {
        let records = self.records.clone();

        Box::pin(async move {
            record.validate()?;
            records
                .lock()
                .insert(record.id().to_string(), record.clone());
            Ok(record)
        })
    }

    fn find_by_id(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<R>>> {
        let records = self.records.clone();
        let id = id.to_string();

        Box::pin(async move { Ok(records.lock().get(&id).cloned()) })
    }

    fn find_by_ids(&self, ids: &[String]) -> BoxFuture<'static, RepositoryResult<Vec<R>>> {
        let records = self.records.clone();
        let ids = ids.to_vec();

        Box::pin(async move {
            let store = records.lock();
            Ok(ids.iter().filter_map(|id| store.get(id).cloned()).collect())
        })
    }

    fn destroy(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let records = self.records.clone();
        let id = id.to_string();

        Box::pin(async move {
            records.lock().remove(&id);
            Ok(())
        })
    }

    fn destroy_many(&self, ids: &[String]) -> BoxFuture<'static, RepositoryResult<()>> {
        let records = self.records.clone();
        let ids = ids.to_vec();

        Box::pin(async move {
            let mut store = records.lock();
            for id in &ids {
                store.remove(id);
            }
            Ok(())
        })
    }

    fn iterate<'a>(&'a self, visit: RecordVisitor<'a, R>) -> BoxFuture<'a, RepositoryResult<()>> {
        Box::pin(async move {
            // Snapshot first so the visitor never runs under the lock
            let snapshot: Vec<R> = self.records.lock().values().cloned().collect();
            for record in snapshot {
                visit(record);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::RepositoryError;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Record for Note {
        const TABLE: &'static str = "notes";

        fn id(&self) -> &str {
            &self.id
        }

        fn set_id(&mut self, id: String) {
            self.id = id;
        }

        fn validate(&self) -> RepositoryResult<()> {
            if self.body.is_empty() {
                return Err(RepositoryError::validation("empty body"));
            }
            Ok(())
        }
    }

    fn note(body: &str) -> Note {
        Note {
            id: String::new(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_fresh_ids() {
        let store = InMemoryRecordStore::<Note>::new();

        let a = store.create(note("a")).await.unwrap();
        let b = store.create(note("b")).await.unwrap();

        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_find_by_ids_skips_missing_and_keeps_order() {
        let store = InMemoryRecordStore::<Note>::new();
        let a = store.create(note("a")).await.unwrap();
        let b = store.create(note("b")).await.unwrap();

        let found = store
            .find_by_ids(&[b.id.clone(), "missing".to_string(), a.id.clone()])
            .await
            .unwrap();

        let bodies: Vec<&str> = found.iter().map(|n| n.body.as_str()).collect();
        assert_eq!(bodies, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_records() {
        let store = InMemoryRecordStore::<Note>::new();
        let mut a = store.create(note("a")).await.unwrap();
        a.body.clear();

        let err = store.put(a).await.unwrap_err();
        assert!(matches!(err, RepositoryError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn test_destroy_many_and_iterate() {
        let store = InMemoryRecordStore::<Note>::new();
        let a = store.create(note("a")).await.unwrap();
        let b = store.create(note("b")).await.unwrap();
        store.create(note("c")).await.unwrap();

        store.destroy_many(&[a.id, b.id]).await.unwrap();

        let mut seen = Vec::new();
        store.iterate(&mut |n: Note| seen.push(n.body)).await.unwrap();
        assert_eq!(seen, vec!["c".to_string()]);
    }
}
