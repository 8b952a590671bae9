//! Inventory store: discovered inputs and their content identity.
//!
//! Inputs are keyed by path. Re-registering a path with the same content
//! hash is a no-op beyond stat metadata; a different hash means the path now
//! holds a new identity and downstream records for the old hash no longer
//! apply to it.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::identity;
use crate::ledger::RunLedger;
use crate::models::{InputRecord, InputStatus, StageKind};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::scanner::{Discovered, ScanItem, Scanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    New,
    Unchanged,
    ContentChanged,
}

#[derive(Debug, Clone, Copy)]
pub struct Registered {
    pub input_id: i64,
    pub registration: Registration,
}

/// Insert or refresh the input at `discovered.path`.
pub async fn register(
    pool: &SqlitePool,
    run_id: i64,
    discovered: &Discovered,
    content_hash: &str,
) -> Result<Registered> {
    let path = discovered.path.to_string_lossy().to_string();
    let now = Utc::now().timestamp();

    let existing: Option<(i64, String)> =
        sqlx::query_as("SELECT id, content_hash FROM inputs WHERE path = ?")
            .bind(&path)
            .fetch_optional(pool)
            .await?;

    match existing {
        None => {
            let input_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO inputs (path, content_hash, size, mtime, mime_hint, status, discovery_run, last_seen_run, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, 'active', ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(&path)
            .bind(content_hash)
            .bind(discovered.size as i64)
            .bind(discovered.mtime)
            .bind(&discovered.mime_hint)
            .bind(run_id)
            .bind(run_id)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await?;

            tracing::debug!(input_id, path = %path, "new input");
            Ok(Registered {
                input_id,
                registration: Registration::New,
            })
        }
        Some((input_id, old_hash)) if old_hash == content_hash => {
            sqlx::query(
                r#"
                UPDATE inputs SET size = ?, mtime = ?, mime_hint = ?, status = 'active', last_seen_run = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(discovered.size as i64)
            .bind(discovered.mtime)
            .bind(&discovered.mime_hint)
            .bind(run_id)
            .bind(now)
            .bind(input_id)
            .execute(pool)
            .await?;

            Ok(Registered {
                input_id,
                registration: Registration::Unchanged,
            })
        }
        Some((input_id, old_hash)) => {
            sqlx::query(
                r#"
                UPDATE inputs SET content_hash = ?, size = ?, mtime = ?, mime_hint = ?, status = 'active',
                    discovery_run = ?, last_seen_run = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(content_hash)
            .bind(discovered.size as i64)
            .bind(discovered.mtime)
            .bind(&discovered.mime_hint)
            .bind(run_id)
            .bind(run_id)
            .bind(now)
            .bind(input_id)
            .execute(pool)
            .await?;

            tracing::info!(
                input_id,
                path = %path,
                old_hash = %old_hash,
                new_hash = %content_hash,
                "input content changed"
            );
            Ok(Registered {
                input_id,
                registration: Registration::ContentChanged,
            })
        }
    }
}

/// Record a per-input inventory error. A known input at `path` is marked
/// unreadable; returns whether one was.
pub async fn record_failure(
    pool: &SqlitePool,
    run_id: i64,
    path: &Path,
    error: &str,
) -> Result<bool> {
    let path = path.to_string_lossy().to_string();
    let now = Utc::now().timestamp();

    sqlx::query("INSERT INTO inventory_failures (run_id, path, error, created_at) VALUES (?, ?, ?, ?)")
        .bind(run_id)
        .bind(&path)
        .bind(error)
        .bind(now)
        .execute(pool)
        .await?;

    let marked = sqlx::query(
        "UPDATE inputs SET status = 'unreadable', last_seen_run = ?, updated_at = ? WHERE path = ?",
    )
    .bind(run_id)
    .bind(now)
    .bind(&path)
    .execute(pool)
    .await?;

    tracing::warn!(path = %path, error, "inventory failure");
    Ok(marked.rows_affected() > 0)
}

pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<InputRecord>> {
    let row = sqlx::query("SELECT * FROM inputs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| input_from_row(&r)))
}

pub async fn get_by_path(pool: &SqlitePool, path: &str) -> Result<Option<InputRecord>> {
    let row = sqlx::query("SELECT * FROM inputs WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| input_from_row(&r)))
}

/// Every input path currently holding `content_hash`.
pub async fn by_hash(pool: &SqlitePool, content_hash: &str) -> Result<Vec<InputRecord>> {
    let rows = sqlx::query("SELECT * FROM inputs WHERE content_hash = ? ORDER BY id")
        .bind(content_hash)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(input_from_row).collect())
}

pub async fn list(pool: &SqlitePool, status: Option<InputStatus>) -> Result<Vec<InputRecord>> {
    let rows = match status {
        Some(status) => {
            sqlx::query("SELECT * FROM inputs WHERE status = ? ORDER BY id")
                .bind(status.as_str())
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM inputs ORDER BY id")
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows.iter().map(input_from_row).collect())
}

/// Active inputs without a successful extraction for their current hash.
/// With `force`, every active input.
pub async fn extraction_candidates(pool: &SqlitePool, force: bool) -> Result<Vec<InputRecord>> {
    let sql = if force {
        "SELECT * FROM inputs WHERE status = 'active' ORDER BY id"
    } else {
        r#"
        SELECT * FROM inputs i
        WHERE i.status = 'active'
          AND NOT EXISTS (
            SELECT 1 FROM extractions e
            WHERE e.input_id = i.id AND e.content_hash = i.content_hash AND e.status = 'success'
          )
        ORDER BY i.id
        "#
    };
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows.iter().map(input_from_row).collect())
}

/// Active inputs with a successful extraction for their current hash and no
/// label for it yet. With `force`, the label check is dropped.
pub async fn labeling_candidates(pool: &SqlitePool, force: bool) -> Result<Vec<InputRecord>> {
    let label_clause = if force {
        ""
    } else {
        r#"
          AND NOT EXISTS (
            SELECT 1 FROM labels l
            WHERE l.input_id = i.id AND l.content_hash = i.content_hash
          )
        "#
    };
    let sql = format!(
        r#"
        SELECT * FROM inputs i
        WHERE i.status = 'active'
          AND EXISTS (
            SELECT 1 FROM extractions e
            WHERE e.input_id = i.id AND e.content_hash = i.content_hash AND e.status = 'success'
          )
          {}
        ORDER BY i.id
        "#,
        label_clause
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.iter().map(input_from_row).collect())
}

pub async fn count_active(pool: &SqlitePool) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM inputs WHERE status = 'active'")
            .fetch_one(pool)
            .await?,
    )
}

pub(crate) fn input_from_row(row: &SqliteRow) -> InputRecord {
    let status: String = row.get("status");
    InputRecord {
        id: row.get("id"),
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        size: row.get("size"),
        mtime: row.get("mtime"),
        mime_hint: row.get("mime_hint"),
        status: InputStatus::parse(&status),
        discovery_run: row.get("discovery_run"),
        last_seen_run: row.get("last_seen_run"),
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanStats {
    pub discovered: u64,
    pub new: u64,
    pub unchanged: u64,
    pub changed: u64,
    pub failed: u64,
}

/// The inventory stage: walk `root`, hash and register every file.
pub async fn run_scan(
    config: &Config,
    pool: &SqlitePool,
    root: &Path,
    progress: &dyn ProgressReporter,
) -> Result<ScanStats> {
    let ledger = RunLedger::new(pool.clone());
    let mut snapshot = config.snapshot();
    snapshot["args"] = serde_json::json!({ "root": root });

    let run_id = ledger.begin(StageKind::Inventory, &snapshot).await?;
    match scan_into(pool, run_id, root, config, progress).await {
        Ok(stats) => {
            ledger.complete(run_id, &stats).await?;
            Ok(stats)
        }
        Err(e) => {
            ledger.fail(run_id, &format!("{:#}", e)).await?;
            Err(e)
        }
    }
}

async fn scan_into(
    pool: &SqlitePool,
    run_id: i64,
    root: &Path,
    config: &Config,
    progress: &dyn ProgressReporter,
) -> Result<ScanStats> {
    let scanner = Scanner::new(root, &config.scan)?;
    let mut stats = ScanStats::default();

    for item in scanner.iter() {
        match item {
            ScanItem::Found(discovered) => {
                stats.discovered += 1;
                let path = discovered.path.clone();
                let hashed = tokio::task::spawn_blocking(move || identity::hash_file(&path))
                    .await
                    .context("hashing task failed")?;
                match hashed {
                    Ok(hash) => {
                        let registered = register(pool, run_id, &discovered, &hash)
                            .await
                            .with_context(|| {
                                format!("failed to register {}", discovered.path.display())
                            })?;
                        match registered.registration {
                            Registration::New => stats.new += 1,
                            Registration::Unchanged => stats.unchanged += 1,
                            Registration::ContentChanged => stats.changed += 1,
                        }
                    }
                    Err(e) => {
                        stats.failed += 1;
                        record_failure(pool, run_id, &discovered.path, &format!("{:#}", e))
                            .await?;
                    }
                }
            }
            ScanItem::Failed { path, error } => {
                stats.failed += 1;
                record_failure(pool, run_id, &path, &error).await?;
            }
        }

        let seen = stats.discovered + stats.failed;
        if seen % 100 == 0 {
            progress.report(ProgressEvent::Discovering {
                stage: StageKind::Inventory,
                seen,
            });
        }
    }

    tracing::info!(
        run_id,
        discovered = stats.discovered,
        new = stats.new,
        changed = stats.changed,
        failed = stats.failed,
        "inventory complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_pool;
    use std::path::PathBuf;

    fn discovered(path: &str, size: u64) -> Discovered {
        Discovered {
            path: PathBuf::from(path),
            size,
            mtime: 1_700_000_000,
            mime_hint: Some("application/pdf".to_string()),
        }
    }

    async fn run(pool: &SqlitePool) -> i64 {
        RunLedger::new(pool.clone())
            .begin(StageKind::Inventory, &serde_json::json!({}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (_dir, pool) = test_pool().await;
        let run_id = run(&pool).await;
        let d = discovered("/docs/a.pdf", 10);

        let first = register(&pool, run_id, &d, "aaaa").await.unwrap();
        let second = register(&pool, run_id, &d, "aaaa").await.unwrap();
        assert_eq!(first.registration, Registration::New);
        assert_eq!(second.registration, Registration::Unchanged);
        assert_eq!(first.input_id, second.input_id);
        assert_eq!(list(&pool, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_bytes_change_identity() {
        let (_dir, pool) = test_pool().await;
        let run1 = run(&pool).await;
        let run2 = run(&pool).await;
        let d = discovered("/docs/a.pdf", 10);

        register(&pool, run1, &d, "aaaa").await.unwrap();
        let changed = register(&pool, run2, &d, "bbbb").await.unwrap();
        assert_eq!(changed.registration, Registration::ContentChanged);

        let rec = get_by_path(&pool, "/docs/a.pdf").await.unwrap().unwrap();
        assert_eq!(rec.content_hash, "bbbb");
        assert_eq!(rec.discovery_run, run2);
        assert!(by_hash(&pool, "aaaa").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_marks_known_input_unreadable() {
        let (_dir, pool) = test_pool().await;
        let run_id = run(&pool).await;
        register(&pool, run_id, &discovered("/docs/a.pdf", 1), "aaaa")
            .await
            .unwrap();

        assert!(record_failure(&pool, run_id, Path::new("/docs/a.pdf"), "denied")
            .await
            .unwrap());
        assert!(!record_failure(&pool, run_id, Path::new("/docs/b.pdf"), "denied")
            .await
            .unwrap());

        let rec = get_by_path(&pool, "/docs/a.pdf").await.unwrap().unwrap();
        assert_eq!(rec.status, InputStatus::Unreadable);
        assert!(extraction_candidates(&pool, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_stage_records_run_and_stats() {
        let (dir, pool) = test_pool().await;
        let root = dir.path().join("library");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"one").unwrap();
        std::fs::write(root.join("b.txt"), b"one").unwrap();

        let config = crate::config::parse_config(
            "[db]\npath = \"x\"\n[storage]\nsidecar_dir = \"y\"\n",
        )
        .unwrap();
        let progress = crate::progress::NoProgress;

        let stats = run_scan(&config, &pool, &root, &progress).await.unwrap();
        assert_eq!(stats.discovered, 2);
        assert_eq!(stats.new, 2);

        let again = run_scan(&config, &pool, &root, &progress).await.unwrap();
        assert_eq!(again.unchanged, 2);
        assert_eq!(again.new, 0);

        // Same bytes, one identity.
        let inputs = list(&pool, None).await.unwrap();
        assert_eq!(inputs[0].content_hash, inputs[1].content_hash);

        let runs = RunLedger::new(pool.clone())
            .list(Some(StageKind::Inventory), 10)
            .await
            .unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == crate::models::RunStatus::Completed));
    }

    #[tokio::test]
    async fn missing_root_fails_the_run() {
        let (dir, pool) = test_pool().await;
        let config = crate::config::parse_config(
            "[db]\npath = \"x\"\n[storage]\nsidecar_dir = \"y\"\n",
        )
        .unwrap();

        let err = run_scan(
            &config,
            &pool,
            &dir.path().join("nope"),
            &crate::progress::NoProgress,
        )
        .await;
        assert!(err.is_err());

        let run = RunLedger::new(pool.clone())
            .list(Some(StageKind::Inventory), 1)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(run.status, crate::models::RunStatus::Failed);
        assert!(run.error.unwrap().contains("does not exist"));
    }
}
