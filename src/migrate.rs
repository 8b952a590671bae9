use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Run ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stage TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            config_json TEXT NOT NULL DEFAULT '{}',
            stats_json TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Inventory
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inputs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            mtime INTEGER NOT NULL,
            mime_hint TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            discovery_run INTEGER NOT NULL REFERENCES runs(id),
            last_seen_run INTEGER NOT NULL REFERENCES runs(id),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inventory_failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES runs(id),
            path TEXT NOT NULL,
            error TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Extraction history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extractions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            input_id INTEGER NOT NULL REFERENCES inputs(id),
            run_id INTEGER NOT NULL REFERENCES runs(id),
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            backend TEXT,
            sidecar_hash TEXT,
            error TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(input_id, run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Label history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS labels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            input_id INTEGER NOT NULL REFERENCES inputs(id),
            run_id INTEGER NOT NULL REFERENCES runs(id),
            content_hash TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            title TEXT NOT NULL,
            canonical_name TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            target_path TEXT NOT NULL,
            date TEXT,
            issuer TEXT,
            source TEXT,
            confidence REAL NOT NULL,
            rationale TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt_fingerprint TEXT NOT NULL,
            escalated INTEGER NOT NULL DEFAULT 0,
            notes_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            UNIQUE(input_id, run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Labeling failures and skips, with the reason
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS label_failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            input_id INTEGER NOT NULL REFERENCES inputs(id),
            run_id INTEGER NOT NULL REFERENCES runs(id),
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT NOT NULL,
            prompt_fingerprint TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(input_id, run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Placement plans
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            input_id INTEGER NOT NULL REFERENCES inputs(id),
            label_id INTEGER NOT NULL REFERENCES labels(id),
            run_id INTEGER NOT NULL REFERENCES runs(id),
            source_path TEXT NOT NULL,
            target_dir TEXT NOT NULL,
            target_filename TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            needs_review INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(input_id, run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_runs_stage_status ON runs(stage, status)",
        "CREATE INDEX IF NOT EXISTS idx_inputs_content_hash ON inputs(content_hash)",
        "CREATE INDEX IF NOT EXISTS idx_inventory_failures_run ON inventory_failures(run_id)",
        "CREATE INDEX IF NOT EXISTS idx_extractions_input ON extractions(input_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_extractions_run ON extractions(run_id)",
        "CREATE INDEX IF NOT EXISTS idx_labels_input ON labels(input_id)",
        "CREATE INDEX IF NOT EXISTS idx_labels_doc_type ON labels(doc_type)",
        "CREATE INDEX IF NOT EXISTS idx_label_failures_input ON label_failures(input_id)",
        "CREATE INDEX IF NOT EXISTS idx_plans_run ON plans(run_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
