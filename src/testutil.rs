//! Shared helpers for unit tests.

use sqlx::SqlitePool;
use tempfile::TempDir;

/// A migrated database in a fresh temporary directory.
pub async fn test_pool() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().unwrap();
    let pool = crate::db::connect_path(&dir.path().join("test.sqlite"))
        .await
        .unwrap();
    crate::migrate::migrate(&pool).await.unwrap();
    (dir, pool)
}
