use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::RepositoryResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback handed to [`RecordStore::iterate`] for every stored record.
pub type RecordVisitor<'a, R> = &'a mut (dyn FnMut(R) + Send);

/// A persisted entity with an opaque string identity.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table (or key prefix) the record type is stored under.
    const TABLE: &'static str;

    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);

    /// Shape check run on every write. Failures surface as
    /// [`RepositoryError::ValidationError`](super::RepositoryError::ValidationError).
    fn validate(&self) -> RepositoryResult<()> {
        Ok(())
    }
}

/// Durable async table of records of one type.
///
/// Reads of missing ids are not errors: `find_by_id` yields `None` and
/// `find_by_ids` skips them while preserving the order of the ids found.
pub trait RecordStore<R: Record>: Send + Sync + 'static {
    /// Assign a fresh id to `record` and persist it.
    fn create(&self, record: R) -> BoxFuture<'static, RepositoryResult<R>>;

    /// Insert or replace a record by id.
    fn put(&self, record: R) -> BoxFuture<'static, RepositoryResult<R>>;

    fn find_by_id(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<R>>>;

    fn find_by_ids(&self, ids: &[String]) -> BoxFuture<'static, RepositoryResult<Vec<R>>>;

    fn destroy(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    fn destroy_many(&self, ids: &[String]) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Full scan. The visitor is invoked once per record, in no particular order.
    fn iterate<'a>(&'a self, visit: RecordVisitor<'a, R>) -> BoxFuture<'a, RepositoryResult<()>>;
}

pub(crate) fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
