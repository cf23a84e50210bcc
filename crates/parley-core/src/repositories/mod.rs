pub mod blob_cache;
pub mod error;
pub mod in_memory_repository;
pub mod record_store;
pub mod sqlite_repository;

pub use blob_cache::{BlobCache, InMemoryBlobCache, store_image};
pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::InMemoryRecordStore;
pub use record_store::{BoxFuture, Record, RecordStore};
pub use sqlite_repository::SqliteRecordStore;
