//! Per-sync state cache
//!
//! One SQLite database per sync, holding the serialized mirror tree. The
//! engine batches changes into an insert set and a delete set during a tick;
//! [`StateCache::commit`] drains both inside a single transaction, inserts
//! first so parent rows exist before their children reference them.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use cirrus_core::domain::{BackupId, MirrorRow};

use crate::StoreError;

/// Subdirectory of the client db holding per-sync caches.
pub const STATE_CACHE_DIR: &str = "syncs";

/// Handle on one sync's mirror-node table.
pub struct StateCache {
    pool: SqlitePool,
    path: PathBuf,
}

impl StateCache {
    /// Opens (creating if necessary) the cache for `backup_id` under
    /// `<client_db>/syncs/<backup_id>.db`.
    pub async fn open(client_db_path: &Path, backup_id: BackupId) -> Result<Self, StoreError> {
        let dir = client_db_path.join(STATE_CACHE_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(format!("{backup_id}.db"));

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mirror_nodes (
                row_id INTEGER PRIMARY KEY,
                parent_row INTEGER,
                payload BLOB NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        debug!(path = %path.display(), "state cache opened");
        Ok(Self { pool, path })
    }

    /// Location of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every row for a bottom-up rebuild of the mirror tree.
    pub async fn load_rows(&self) -> Result<Vec<MirrorRow>, StoreError> {
        let rows = sqlx::query("SELECT payload FROM mirror_nodes ORDER BY row_id")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: Vec<u8> = row.get("payload");
            out.push(serde_json::from_slice(&payload)?);
        }
        Ok(out)
    }

    /// Applies one tick's worth of changes transactionally.
    ///
    /// `inserts` must be ordered parents-before-children; deletes run after
    /// inserts. An empty commit is a no-op without touching the database.
    pub async fn commit(&self, inserts: &[MirrorRow], deletes: &[i64]) -> Result<(), StoreError> {
        if inserts.is_empty() && deletes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for row in inserts {
            let payload = serde_json::to_vec(row)?;
            sqlx::query(
                "INSERT OR REPLACE INTO mirror_nodes (row_id, parent_row, payload)
                 VALUES (?1, ?2, ?3)",
            )
            .bind(row.row_id)
            .bind(row.parent_row)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }

        for row_id in deletes {
            sqlx::query("DELETE FROM mirror_nodes WHERE row_id = ?1")
                .bind(*row_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            inserts = inserts.len(),
            deletes = deletes.len(),
            "state cache committed"
        );
        Ok(())
    }

    /// Empties the table (sync reset; the file stays).
    pub async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM mirror_nodes")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Closes the pool and deletes the database file (sync removal).
    pub async fn remove(self) -> Result<(), StoreError> {
        self.pool.close().await;
        info!(path = %self.path.display(), "removing state cache");
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::domain::{Fsid, NodeHandle, NodeKind};

    fn row(row_id: i64, parent: Option<i64>, name: &str) -> MirrorRow {
        MirrorRow {
            row_id,
            parent_row: parent,
            kind: if parent.is_none() {
                NodeKind::Folder
            } else {
                NodeKind::File
            },
            size: 10,
            fsid: Some(Fsid::new(row_id as u64 + 1000)),
            cloud_handle: Some(NodeHandle::new(row_id as u64 + 2000)),
            leaf_name: name.to_string(),
            short_name: None,
            fingerprint: None,
            syncable: true,
        }
    }

    #[tokio::test]
    async fn commit_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(dir.path(), BackupId::new(7)).await.unwrap();

        let rows = vec![row(1, None, "/root"), row(2, Some(1), "a.txt")];
        cache.commit(&rows, &[]).await.unwrap();

        let loaded = cache.load_rows().await.unwrap();
        assert_eq!(loaded, rows);
    }

    #[tokio::test]
    async fn deletes_run_after_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(dir.path(), BackupId::new(8)).await.unwrap();

        cache
            .commit(&[row(1, None, "/root"), row(2, Some(1), "x")], &[])
            .await
            .unwrap();
        // Same tick: re-insert row 2 under a new name and delete row 3 (absent).
        cache
            .commit(&[row(2, Some(1), "y")], &[3])
            .await
            .unwrap();

        let loaded = cache.load_rows().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].leaf_name, "y");
    }

    #[tokio::test]
    async fn cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = BackupId::new(9);
        {
            let cache = StateCache::open(dir.path(), id).await.unwrap();
            cache.commit(&[row(1, None, "/root")], &[]).await.unwrap();
        }
        let cache = StateCache::open(dir.path(), id).await.unwrap();
        assert_eq!(cache.load_rows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(dir.path(), BackupId::new(10)).await.unwrap();
        let path = cache.path().to_path_buf();
        assert!(path.exists());
        cache.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn empty_commit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(dir.path(), BackupId::new(11)).await.unwrap();
        cache.commit(&[], &[]).await.unwrap();
        assert!(cache.load_rows().await.unwrap().is_empty());
    }
}
