use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::error::{RepositoryError, RepositoryResult};
use super::record_store::{BoxFuture, Record, RecordStore, RecordVisitor, fresh_id};

/// SQLite-backed record store.
///
/// Each record type lives in its own table (`R::TABLE`) as a JSON document
/// keyed by id. Several stores may share one pool; `SqlitePool` is internally
/// reference-counted and cheap to clone.
pub struct SqliteRecordStore<R: Record> {
    pool: SqlitePool,
    _record: PhantomData<fn() -> R>,
}

/// Open (or create) the database file, using WAL journal mode for concurrent
/// reads during background flushes.
pub async fn open_pool(db_path: &Path) -> RepositoryResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    info!(path = %db_path.display(), "Opened SQLite record database");
    Ok(pool)
}

/// Platform config location of the default database.
pub fn default_db_path() -> RepositoryResult<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| RepositoryError::InitializationError {
            message: "Cannot find config directory".into(),
        })
        .map(|p| p.join("parley").join("records.db"))
}

impl<R: Record> SqliteRecordStore<R> {
    /// Wrap an existing pool, creating the record table if absent.
    pub async fn with_pool(pool: SqlitePool) -> RepositoryResult<Self> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id   TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )",
            R::TABLE
        );
        sqlx::query(&ddl).execute(&pool).await?;
        debug!(table = R::TABLE, "Record table ready");

        Ok(Self {
            pool,
            _record: PhantomData,
        })
    }

    /// Open a store backed by the database file at `db_path`.
    pub async fn open(db_path: &Path) -> RepositoryResult<Self> {
        let pool = open_pool(db_path).await?;
        Self::with_pool(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode(data: &str) -> RepositoryResult<R> {
        Ok(serde_json::from_str(data)?)
    }

    async fn upsert(pool: &SqlitePool, record: &R) -> RepositoryResult<()> {
        record.validate()?;
        let data = serde_json::to_string(record)?;
        let sql = format!(
            "INSERT INTO {} (id, data) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            R::TABLE
        );
        sqlx::query(&sql)
            .bind(record.id())
            .bind(data)
            .execute(pool)
            .await?;
        Ok(())
    }
}

impl<R: Record> Clone for SqliteRecordStore<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> RecordStore<R> for SqliteRecordStore<R> {
    fn create(&self, mut record: R) -> BoxFuture<'static, RepositoryResult<R>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            record.set_id(fresh_id());
            Self::upsert(&pool, &record).await?;
            Ok(record)
        })
    }

    fn put(&self, record: R) -> BoxFuture<'static, RepositoryResult<R>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            Self::upsert(&pool, &record).await?;
            Ok(record)
        })
    }

    fn find_by_id(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<R>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let sql = format!("SELECT data FROM {} WHERE id = ?", R::TABLE);
            let row = sqlx::query(&sql).bind(&id).fetch_optional(&pool).await?;
            row.map(|r| Self::decode(r.get::<&str, _>("data")))
                .transpose()
        })
    }

    fn find_by_ids(&self, ids: &[String]) -> BoxFuture<'static, RepositoryResult<Vec<R>>> {
        let pool = self.pool.clone();
        let ids = ids.to_vec();
        Box::pin(async move {
            let sql = format!("SELECT data FROM {} WHERE id = ?", R::TABLE);
            let mut found = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&pool).await? {
                    found.push(Self::decode(row.get::<&str, _>("data"))?);
                }
            }
            Ok(found)
        })
    }

    fn destroy(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let sql = format!("DELETE FROM {} WHERE id = ?", R::TABLE);
            sqlx::query(&sql).bind(&id).execute(&pool).await?;
            Ok(())
        })
    }

    fn destroy_many(&self, ids: &[String]) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let ids = ids.to_vec();
        Box::pin(async move {
            let sql = format!("DELETE FROM {} WHERE id = ?", R::TABLE);
            let mut tx = pool.begin().await?;
            for id in &ids {
                sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    fn iterate<'a>(&'a self, visit: RecordVisitor<'a, R>) -> BoxFuture<'a, RepositoryResult<()>> {
        Box::pin(async move {
            let sql = format!("SELECT data FROM {}", R::TABLE);
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            for row in rows {
                visit(Self::decode(row.get::<&str, _>("data"))?);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRecord;

    #[tokio::test]
    async fn test_roundtrip_through_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        let store = SqliteRecordStore::<MessageRecord>::open(&path).await.unwrap();
        let created = store
            .create(MessageRecord::user("hello there", Vec::new()))
            .await
            .unwrap();

        // Reopen to make sure the write reached disk
        let reopened = SqliteRecordStore::<MessageRecord>::open(&path).await.unwrap();
        let loaded = reopened.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, "hello there");
        assert!(!loaded.from_bot);
    }

    #[tokio::test]
    async fn test_find_by_ids_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::<MessageRecord>::open(&dir.path().join("r.db"))
            .await
            .unwrap();

        let a = store.create(MessageRecord::user("a", Vec::new())).await.unwrap();
        let b = store.create(MessageRecord::user("b", Vec::new())).await.unwrap();

        let found = store
            .find_by_ids(&[b.id.clone(), "nope".into(), a.id.clone()])
            .await
            .unwrap();
        let contents: Vec<&str> = found.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_put_validates_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::<MessageRecord>::open(&dir.path().join("r.db"))
            .await
            .unwrap();

        let mut record = store.create(MessageRecord::bot_placeholder()).await.unwrap();
        record.variation_ids.push(record.id.clone());

        let err = store.put(record).await.unwrap_err();
        assert!(matches!(err, RepositoryError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn test_destroy_many_and_iterate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::<MessageRecord>::open(&dir.path().join("r.db"))
            .await
            .unwrap();

        let a = store.create(MessageRecord::user("a", Vec::new())).await.unwrap();
        let b = store.create(MessageRecord::user("b", Vec::new())).await.unwrap();
        store.create(MessageRecord::user("c", Vec::new())).await.unwrap();
        store.destroy_many(&[a.id, b.id]).await.unwrap();

        let mut contents = Vec::new();
        store
            .iterate(&mut |m: MessageRecord| contents.push(m.content))
            .await
            .unwrap();
        assert_eq!(contents, vec!["c".to_string()]);
    }
}
