//! Library statistics and pipeline health overview.
//!
//! Summarizes what has been inventoried, extracted, labeled and planned, and
//! when each stage last ran. Used by `archivist stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Default, Clone, Serialize)]
pub struct LibraryStats {
    pub inputs: i64,
    pub unreadable: i64,
    pub unique_contents: i64,
    pub extracted: i64,
    pub extraction_failed: i64,
    pub labeled: i64,
    pub escalated: i64,
    pub needs_review: i64,
    pub by_doc_type: Vec<(String, i64)>,
    pub stages: Vec<StageSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub runs: i64,
    pub last_status: Option<String>,
    pub last_started_at: Option<i64>,
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<LibraryStats> {
    let mut stats = LibraryStats {
        inputs: count(pool, "SELECT COUNT(*) FROM inputs WHERE status = 'active'").await?,
        unreadable: count(pool, "SELECT COUNT(*) FROM inputs WHERE status = 'unreadable'").await?,
        unique_contents: count(
            pool,
            "SELECT COUNT(DISTINCT content_hash) FROM inputs WHERE status = 'active'",
        )
        .await?,
        ..LibraryStats::default()
    };

    // Coverage is measured against each input's current content.
    stats.extracted = count(
        pool,
        r#"
        SELECT COUNT(*) FROM inputs i WHERE i.status = 'active' AND EXISTS (
            SELECT 1 FROM extractions e
            WHERE e.input_id = i.id AND e.content_hash = i.content_hash AND e.status = 'success')
        "#,
    )
    .await?;
    stats.extraction_failed = count(
        pool,
        r#"
        SELECT COUNT(*) FROM inputs i WHERE i.status = 'active' AND i.id IN (
            SELECT e.input_id FROM extractions e
            WHERE e.content_hash = i.content_hash AND e.status = 'failed'
              AND e.id = (SELECT MAX(id) FROM extractions WHERE input_id = i.id))
        "#,
    )
    .await?;
    stats.labeled = count(
        pool,
        r#"
        SELECT COUNT(*) FROM inputs i WHERE i.status = 'active' AND EXISTS (
            SELECT 1 FROM labels l WHERE l.input_id = i.id AND l.content_hash = i.content_hash)
        "#,
    )
    .await?;
    stats.escalated = count(pool, "SELECT COUNT(*) FROM labels WHERE escalated = 1").await?;
    stats.needs_review = count(
        pool,
        r#"
        SELECT COUNT(*) FROM plans
        WHERE needs_review = 1
          AND run_id = (SELECT MAX(id) FROM runs WHERE stage = 'planning' AND status = 'completed')
        "#,
    )
    .await?;

    let rows = sqlx::query(
        r#"
        SELECT l.doc_type AS doc_type, COUNT(*) AS n FROM labels l
        JOIN inputs i ON i.id = l.input_id AND l.content_hash = i.content_hash
        WHERE i.status = 'active'
          AND l.id = (SELECT MAX(id) FROM labels WHERE input_id = i.id AND content_hash = i.content_hash)
        GROUP BY l.doc_type
        ORDER BY n DESC, doc_type
        "#,
    )
    .fetch_all(pool)
    .await?;
    stats.by_doc_type = rows
        .iter()
        .map(|r| (r.get("doc_type"), r.get("n")))
        .collect();

    let rows = sqlx::query(
        r#"
        SELECT r.stage AS stage, COUNT(*) AS runs,
            (SELECT status FROM runs WHERE stage = r.stage ORDER BY id DESC LIMIT 1) AS last_status,
            MAX(r.started_at) AS last_started_at
        FROM runs r
        GROUP BY r.stage
        ORDER BY MIN(r.id)
        "#,
    )
    .fetch_all(pool)
    .await?;
    stats.stages = rows
        .iter()
        .map(|r| StageSummary {
            stage: r.get("stage"),
            runs: r.get("runs"),
            last_status: r.get("last_status"),
            last_started_at: r.get("last_started_at"),
        })
        .collect();

    Ok(stats)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Archivist Library Stats");
    println!("=======================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!(
        "  Inputs:       {} ({} unique, {} unreadable)",
        stats.inputs, stats.unique_contents, stats.unreadable
    );
    println!(
        "  Extracted:    {} / {} ({}%), {} failed",
        stats.extracted,
        stats.inputs,
        percent(stats.extracted, stats.inputs),
        stats.extraction_failed
    );
    println!(
        "  Labeled:      {} / {} ({}%), {} escalated",
        stats.labeled,
        stats.inputs,
        percent(stats.labeled, stats.inputs),
        stats.escalated
    );
    println!("  Needs review: {}", stats.needs_review);

    if !stats.by_doc_type.is_empty() {
        println!();
        println!("  By document type:");
        for (doc_type, n) in &stats.by_doc_type {
            println!("    {:<20} {:>6}", doc_type, n);
        }
    }

    if !stats.stages.is_empty() {
        println!();
        println!(
            "  {:<16} {:>5}   {:<10}   {}",
            "STAGE", "RUNS", "LAST", "STARTED"
        );
        println!("  {}", "-".repeat(56));
        for s in &stats.stages {
            println!(
                "  {:<16} {:>5}   {:<10}   {}",
                s.stage,
                s.runs,
                s.last_status.as_deref().unwrap_or("-"),
                s.last_started_at
                    .map(format_ts_relative)
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }

    println!();
    Ok(())
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        part * 100 / whole
    } else {
        0
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_pool;

    #[test]
    fn byte_and_percent_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(5, 0), 0);
    }

    #[test]
    fn relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 60), "1 min ago");
    }

    #[tokio::test]
    async fn empty_library_has_zero_counts() {
        let (_dir, pool) = test_pool().await;
        let stats = collect_stats(&pool).await.unwrap();
        assert_eq!(stats.inputs, 0);
        assert_eq!(stats.labeled, 0);
        assert!(stats.stages.is_empty());
    }
}
