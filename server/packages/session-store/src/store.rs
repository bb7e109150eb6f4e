use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::Session;

const DB_FILE: &str = "sessions.db";
const MAX_CONNECTIONS: u32 = 4;

/// Durable per-user session store with a write-through cache.
///
/// A single store-wide lock orders every durable access: reads that miss the
/// cache take it shared, writes and deletes take it exclusively. Cache hits
/// skip the lock. Every value going in or out of the cache is a fresh clone.
#[derive(Debug)]
pub struct SessionStore {
    pool: SqlitePool,
    cache: DashMap<String, Session>,
    lock: RwLock<()>,
    closed: AtomicBool,
    path: PathBuf,
}

impl SessionStore {
    /// Opens (creating if needed) the store under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(DB_FILE);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(StoreError::Open)?;
        sqlx::query(include_str!("../migrations/0001_init.sql"))
            .execute(&pool)
            .await
            .map_err(StoreError::Open)?;

        tracing::info!(path = %path.display(), "session store opened");

        Ok(Self {
            pool,
            cache: DashMap::new(),
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the user's session. A user that was never written gets an
    /// empty session.
    pub async fn read(&self, user_id: &str) -> Result<Session, StoreError> {
        self.ensure_open()?;
        validate_user_id(user_id)?;

        if let Some(cached) = self.cache.get(user_id) {
            return Ok(cached.value().clone());
        }

        let _guard = self.lock.read().await;
        // A writer may have filled the entry while we waited.
        if let Some(cached) = self.cache.get(user_id) {
            return Ok(cached.value().clone());
        }

        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM sessions WHERE user_id = ?1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| {
                    tracing::error!(user_id, error = %err, "unable to read session");
                    StoreError::Read(err)
                })?;

        let session = match row {
            Some((data,)) if !data.is_empty() => serde_json::from_str(&data).map_err(|err| {
                tracing::error!(user_id, error = %err, "unable to decode session");
                StoreError::Decode(err)
            })?,
            _ => Session::default(),
        };

        self.cache.insert(user_id.to_string(), session.clone());
        Ok(session)
    }

    /// Replaces the user's session.
    ///
    /// The cache is only updated once the record is durable, so readers never
    /// observe a value that failed to persist.
    pub async fn write(&self, user_id: &str, session: &Session) -> Result<(), StoreError> {
        self.ensure_open()?;
        validate_user_id(user_id)?;

        let _guard = self.lock.write().await;
        if let Err(err) = self.persist(user_id, session).await {
            tracing::error!(user_id, error = %err, "unable to persist session");
            return Err(err);
        }
        self.cache.insert(user_id.to_string(), session.clone());
        Ok(())
    }

    pub async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        validate_user_id(user_id)?;

        let _guard = self.lock.write().await;
        sqlx::query("DELETE FROM sessions WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                tracing::error!(user_id, error = %err, "unable to delete session");
                StoreError::Write(err)
            })?;
        self.cache.remove(user_id);
        Ok(())
    }

    /// Releases the database handle. Every later call fails with
    /// [`StoreError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.lock.write().await;
        self.pool.close().await;
        self.cache.clear();
        tracing::info!(path = %self.path.display(), "session store closed");
    }

    async fn persist(&self, user_id: &str, session: &Session) -> Result<(), StoreError> {
        let data = serde_json::to_string(session).map_err(StoreError::Encode)?;
        sqlx::query(
            "INSERT INTO sessions (user_id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(data)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Write)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

fn validate_user_id(user_id: &str) -> Result<(), StoreError> {
    if user_id.is_empty() {
        return Err(StoreError::EmptyUserId);
    }
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Adapter;

    #[tokio::test]
    async fn failed_persist_keeps_previous_cache_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).await.expect("open store");

        let mut first = Session::default();
        first.adapters.push(Adapter::at("adapter-a"));
        store.write("u1", &first).await.expect("first write");

        sqlx::query("DROP TABLE sessions")
            .execute(&store.pool)
            .await
            .expect("drop table");

        let mut second = first.clone();
        second.adapters.push(Adapter::at("adapter-b"));
        let err = store.write("u1", &second).await.expect_err("write must fail");
        assert!(matches!(err, StoreError::Write(_)));

        let cached = store.read("u1").await.expect("cached read");
        assert_eq!(cached, first);
    }

    #[tokio::test]
    async fn failed_persist_of_new_user_leaves_no_cache_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).await.expect("open store");
        sqlx::query("DROP TABLE sessions")
            .execute(&store.pool)
            .await
            .expect("drop table");

        let mut session = Session::default();
        session.adapters.push(Adapter::at("adapter-a"));
        assert!(store.write("u2", &session).await.is_err());
        assert!(!store.cache.contains_key("u2"));
    }

    #[tokio::test]
    async fn readers_never_see_a_write_that_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = std::sync::Arc::new(SessionStore::open(dir.path()).await.expect("open store"));
        let mut first = Session::default();
        first.adapters.push(Adapter::at("adapter-a"));
        store.write("u1", &first).await.expect("first write");
        sqlx::query("DROP TABLE sessions")
            .execute(&store.pool)
            .await
            .expect("drop table");

        let done = std::sync::Arc::new(AtomicBool::new(false));
        let reader = {
            let store = store.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut observed = Vec::new();
                while !done.load(Ordering::SeqCst) {
                    observed.push(store.read("u1").await.expect("cached read"));
                    tokio::task::yield_now().await;
                }
                observed
            })
        };

        let mut second = first.clone();
        second.adapters.push(Adapter::at("adapter-b"));
        for _ in 0..20 {
            assert!(store.write("u1", &second).await.is_err());
        }
        done.store(true, Ordering::SeqCst);

        let observed = reader.await.expect("reader joins");
        assert!(observed.iter().all(|session| *session == first));
    }
}
