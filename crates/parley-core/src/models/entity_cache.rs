use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::repositories::Record;

type Transform<S, V> = Box<dyn Fn(S) -> Arc<V> + Send + Sync>;

/// Identity map: one canonical view per record id.
///
/// Views are handed out as `Arc`s, so "is this the same message" checks are
/// `Arc::ptr_eq`. A cache built with [`EntityCache::with_transform`] wraps each
/// source record into a richer view on insertion.
pub struct EntityCache<S, V = S> {
    entries: Mutex<HashMap<String, Arc<V>>>,
    transform: Transform<S, V>,
}

impl<S: Record> EntityCache<S, S> {
    /// Cache that stores records as-is.
    pub fn new() -> Self {
        Self::with_transform(Arc::new)
    }
}

impl<S: Record> Default for EntityCache<S, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Record, V> EntityCache<S, V> {
    pub fn with_transform<F>(transform: F) -> Self
    where
        F: Fn(S) -> Arc<V> + Send + Sync + 'static,
    {
        Self {
            entries: Mutex::new(HashMap::new()),
            transform: Box::new(transform),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<V>> {
        self.entries.lock().get(id).cloned()
    }

    /// Insert `source`, transforming it into a view.
    ///
    /// With `replace == false` an existing view is returned untouched, which
    /// preserves in-flight view state when the same record is refetched.
    pub fn put(&self, source: S, replace: bool) -> Arc<V> {
        let id = source.id().to_string();
        if !replace && let Some(existing) = self.get(&id) {
            return existing;
        }

        // Transform outside the lock; view constructors may build nested caches
        let view = (self.transform)(source);

        let mut entries = self.entries.lock();
        if !replace && let Some(existing) = entries.get(&id) {
            return existing.clone();
        }
        entries.insert(id, view.clone());
        view
    }

    pub fn get_or_put(&self, source: S) -> Arc<V> {
        self.put(source, false)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<V>> {
        self.entries.lock().remove(id)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(id: &str, content: &str) -> MessageRecord {
        let mut r = MessageRecord::user(content, Vec::new());
        r.id = id.to_string();
        r
    }

    #[test]
    fn test_get_returns_same_reference() {
        let cache = EntityCache::<MessageRecord>::new();
        cache.put(record("m1", "a"), true);

        let first = cache.get("m1").unwrap();
        let second = cache.get("m1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_put_without_replace_keeps_existing_view() {
        let cache = EntityCache::<MessageRecord>::new();
        let original = cache.put(record("m1", "a"), false);
        let again = cache.put(record("m1", "b"), false);

        assert!(Arc::ptr_eq(&original, &again));
        assert_eq!(cache.get("m1").unwrap().content, "a");
    }

    #[test]
    fn test_put_with_replace_swaps_view() {
        let cache = EntityCache::<MessageRecord>::new();
        let original = cache.put(record("m1", "a"), true);
        let replaced = cache.put(record("m1", "b"), true);

        assert!(!Arc::ptr_eq(&original, &replaced));
        assert_eq!(cache.get("m1").unwrap().content, "b");
    }

    #[test]
    fn test_transform_runs_once_per_insert() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = EntityCache::<MessageRecord, String>::with_transform(move |r| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(r.content.to_uppercase())
        });

        let view = cache.get_or_put(record("m1", "abc"));
        cache.get_or_put(record("m1", "zzz"));

        assert_eq!(view.as_str(), "ABC");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_ids_are_none() {
        let cache = EntityCache::<MessageRecord>::new();
        assert!(cache.get("nope").is_none());
        assert!(cache.remove("nope").is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = EntityCache::<MessageRecord>::new();
        cache.put(record("m1", "a"), true);
        cache.put(record("m2", "b"), true);

        assert!(cache.remove("m1").is_some());
        assert!(!cache.contains("m1"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
