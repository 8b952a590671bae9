//! Planning stage: turn current labels into reviewable placement plans.
//!
//! A plan row says where an input would go (`target_dir`), under what name
//! (`target_filename`), with which tags, and whether a human should look at
//! it first. Plans are only recorded; nothing on disk is moved.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::labeling::{self, ESCALATION_FAILED_NOTE};
use crate::ledger::RunLedger;
use crate::models::{InputRecord, LabelRecord, PlanRecord, StageKind};
use crate::progress::{ProgressEvent, ProgressReporter};

pub const UNCATEGORIZED_DIR: &str = "98 Uncategorized";

const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// One path component with filesystem-hostile characters removed.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() && !FORBIDDEN.contains(c))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_matches('.').trim().to_string()
}

pub fn target_dir(target_path: &str) -> String {
    let parts: Vec<String> = target_path
        .split(['/', '\\'])
        .map(sanitize_component)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        UNCATEGORIZED_DIR.to_string()
    } else {
        parts.join("/")
    }
}

/// Sanitized canonical name plus the input's original extension. Falls back
/// to the input's own file stem when the canonical name sanitizes to nothing.
pub fn target_filename(canonical_name: &str, input: &InputRecord) -> String {
    let path = std::path::Path::new(&input.path);
    let mut stem = sanitize_component(canonical_name);
    if stem.is_empty() {
        stem = path
            .file_stem()
            .map(|s| sanitize_component(&s.to_string_lossy()))
            .unwrap_or_default();
    }
    if stem.is_empty() {
        stem = "untitled".to_string();
    }
    match input.extension() {
        Some(ext) if !stem.to_lowercase().ends_with(&ext) => format!("{}{}", stem, ext),
        _ => stem,
    }
}

pub fn needs_review(label: &LabelRecord, review_below: f64) -> bool {
    label.confidence < review_below
        || matches!(label.doc_type.as_str(), "other" | "uncategorized")
        || label
            .notes
            .iter()
            .any(|n| n.starts_with(ESCALATION_FAILED_NOTE))
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PlanStats {
    pub labels: u64,
    pub planned: u64,
    pub needs_review: u64,
}

pub async fn run_plan(
    config: &Config,
    pool: &SqlitePool,
    progress: &dyn ProgressReporter,
) -> Result<(i64, PlanStats)> {
    let ledger = RunLedger::new(pool.clone());
    let run_id = ledger.begin(StageKind::Planning, &config.snapshot()).await?;

    match plan_into(config, pool, run_id, progress).await {
        Ok(stats) => {
            ledger.complete(run_id, &stats).await?;
            Ok((run_id, stats))
        }
        Err(e) => {
            ledger.fail(run_id, &format!("{:#}", e)).await?;
            Err(e)
        }
    }
}

async fn plan_into(
    config: &Config,
    pool: &SqlitePool,
    run_id: i64,
    progress: &dyn ProgressReporter,
) -> Result<PlanStats> {
    let labels = labeling::current_labels(pool).await?;
    let mut stats = PlanStats {
        labels: labels.len() as u64,
        ..PlanStats::default()
    };

    for (input, label) in &labels {
        let review = needs_review(label, config.planning.review_below);
        sqlx::query(
            r#"
            INSERT INTO plans (input_id, label_id, run_id, source_path, target_dir, target_filename,
                tags_json, needs_review, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(input.id)
        .bind(label.id)
        .bind(run_id)
        .bind(&input.path)
        .bind(target_dir(&label.target_path))
        .bind(target_filename(&label.canonical_name, input))
        .bind(serde_json::to_string(&label.tags)?)
        .bind(review)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await
        .with_context(|| format!("failed to record plan for {}", input.path))?;

        stats.planned += 1;
        if review {
            stats.needs_review += 1;
        }
        progress.report(ProgressEvent::Processing {
            stage: StageKind::Planning,
            n: stats.planned,
            total: stats.labels,
        });
    }

    tracing::info!(run_id, planned = stats.planned, needs_review = stats.needs_review, "planning complete");
    Ok(stats)
}

/// Plan history for an input, newest first.
pub async fn history(pool: &SqlitePool, input_id: i64) -> Result<Vec<PlanRecord>> {
    let rows = sqlx::query("SELECT * FROM plans WHERE input_id = ? ORDER BY id DESC")
        .bind(input_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(plan_from_row).collect())
}

pub async fn for_run(pool: &SqlitePool, run_id: i64) -> Result<Vec<PlanRecord>> {
    let rows = sqlx::query("SELECT * FROM plans WHERE run_id = ? ORDER BY id")
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(plan_from_row).collect())
}

fn plan_from_row(row: &SqliteRow) -> PlanRecord {
    let tags_json: String = row.get("tags_json");
    PlanRecord {
        id: row.get("id"),
        input_id: row.get("input_id"),
        label_id: row.get("label_id"),
        run_id: row.get("run_id"),
        source_path: row.get("source_path"),
        target_dir: row.get("target_dir"),
        target_filename: row.get("target_filename"),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        needs_review: row.get("needs_review"),
    }
}
